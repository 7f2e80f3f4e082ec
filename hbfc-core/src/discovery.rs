//! Discovery datagrams.
//!
//! The exterior announces itself as `key=<key>&ip=<a>.<b>.<c>.<d>.`: every
//! octet, the last one included, is closed by a `.`, which doubles as the
//! end-of-packet marker.
use arrayvec::ArrayString;
use core::{fmt::Write, net::Ipv4Addr};
use thiserror::Error;

use crate::config::DISCOVERY_KEY;

pub const ANNOUNCEMENT_CAPACITY: usize = 64;
const IP_SEPARATOR: &[u8] = b"&ip=";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    /// Not one of ours. Dropped silently.
    #[error("discovery key not present")]
    MissingKey,
    #[error("address separator missing after key")]
    MissingSeparator,
    #[error("octet {0} is not terminated")]
    MissingDelimiter(usize),
    #[error("octet {0} is not a decimal in 0..=255")]
    BadOctet(usize),
}

pub fn announcement(ip: Ipv4Addr) -> ArrayString<ANNOUNCEMENT_CAPACITY> {
    let mut payload = ArrayString::new();
    // The longest dotted quad still leaves room to spare.
    let _ = write!(payload, "key={DISCOVERY_KEY}&ip={ip}.");
    payload
}

/// Extracts the exterior's address from an announcement.
pub fn parse_announcement(payload: &[u8]) -> Result<Ipv4Addr, DiscoveryError> {
    let key_at = find(payload, DISCOVERY_KEY.as_bytes()).ok_or(DiscoveryError::MissingKey)?;
    let rest = &payload[key_at + DISCOVERY_KEY.len()..];
    let mut rest = rest
        .strip_prefix(IP_SEPARATOR)
        .ok_or(DiscoveryError::MissingSeparator)?;

    let mut octets = [0u8; 4];
    for (index, octet) in octets.iter_mut().enumerate() {
        let end = rest
            .iter()
            .position(|&byte| byte == b'.')
            .ok_or(DiscoveryError::MissingDelimiter(index))?;
        *octet = parse_octet(&rest[..end]).ok_or(DiscoveryError::BadOctet(index))?;
        rest = &rest[end + 1..];
    }

    Ok(Ipv4Addr::from(octets))
}

fn parse_octet(digits: &[u8]) -> Option<u8> {
    if digits.is_empty() || digits.len() > 3 {
        return None;
    }
    let mut value: u16 = 0;
    for &digit in digits {
        if !digit.is_ascii_digit() {
            return None;
        }
        value = value * 10 + u16::from(digit - b'0');
    }
    u8::try_from(value).ok()
}

/// Position of the first occurrence of `needle` in `haystack`.
pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
