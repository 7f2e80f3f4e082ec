//! Credential hand-over: the captive portal form and the interior-to-exterior push.
//!
//! Both carry the same `ssid=<v>&pass=<v>` form body, percent-encoded.
use arrayvec::ArrayVec;
use thiserror::Error;

use crate::{
    credentials::{PASSWORD_MAX, SSID_MAX, StationCredentials},
    discovery::find,
};

/// What the exterior answers once it has stored forwarded credentials.
pub const ACCEPT_REPLY: &[u8] = b"accept";
/// Every field byte may need three characters once encoded.
pub const FORWARD_CAPACITY: usize = 16 + 3 * (SSID_MAX + PASSWORD_MAX);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("form field `{0}` is missing")]
    MissingField(&'static str),
    #[error("invalid percent escape")]
    BadEscape,
}

/// Decodes a posted `ssid=..&pass=..` body.
///
/// Fields longer than the record allows are truncated. The SSID must be
/// present and non-empty; the password may be empty for open networks.
pub fn parse_credentials_form(body: &[u8]) -> Result<StationCredentials, FormError> {
    let mut ssid = None;
    let mut password = None;

    for pair in body.split(|&byte| byte == b'&') {
        let (name, value) = match pair.iter().position(|&byte| byte == b'=') {
            Some(at) => (&pair[..at], &pair[at + 1..]),
            None => (pair, &[][..]),
        };
        match name {
            b"ssid" => ssid = Some(url_decode::<SSID_MAX>(value)?),
            b"pass" => password = Some(url_decode::<PASSWORD_MAX>(value)?),
            _ => {}
        }
    }

    let ssid = ssid
        .filter(|ssid| !ssid.is_empty())
        .ok_or(FormError::MissingField("ssid"))?;
    let password = password.ok_or(FormError::MissingField("pass"))?;
    Ok(StationCredentials::from_parts(ssid, password))
}

/// True if the forwarded payload looks like a credential form at all.
pub fn is_credential_push(payload: &[u8]) -> bool {
    find(payload, b"ssid=").is_some()
}

pub fn is_accept(reply: &[u8]) -> bool {
    find(reply, ACCEPT_REPLY).is_some()
}

/// Encodes credentials for the push to the exterior.
pub fn forward_payload(credentials: &StationCredentials) -> ArrayVec<u8, FORWARD_CAPACITY> {
    let mut payload = ArrayVec::new();
    // Capacity covers the worst case encoding.
    payload.extend(b"ssid=".iter().copied());
    url_encode(credentials.ssid(), &mut payload);
    payload.extend(b"&pass=".iter().copied());
    url_encode(credentials.password(), &mut payload);
    payload
}

/// Form-urlencoded decoding into a bounded buffer, truncating at `N` bytes.
pub fn url_decode<const N: usize>(input: &[u8]) -> Result<ArrayVec<u8, N>, FormError> {
    let mut output = ArrayVec::new();
    let mut bytes = input.iter();
    while let Some(&byte) = bytes.next() {
        let decoded = match byte {
            b'+' => b' ',
            b'%' => {
                let high = bytes.next().and_then(|&c| hex_value(c));
                let low = bytes.next().and_then(|&c| hex_value(c));
                match (high, low) {
                    (Some(high), Some(low)) => (high << 4) | low,
                    _ => return Err(FormError::BadEscape),
                }
            }
            other => other,
        };
        if output.try_push(decoded).is_err() {
            break;
        }
    }
    Ok(output)
}

fn url_encode<const N: usize>(input: &[u8], output: &mut ArrayVec<u8, N>) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for &byte in input {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            output.push(byte);
        } else if byte == b' ' {
            output.push(b'+');
        } else {
            output.push(b'%');
            output.push(HEX[usize::from(byte >> 4)]);
            output.push(HEX[usize::from(byte & 0x0F)]);
        }
    }
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}
