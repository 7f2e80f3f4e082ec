//! Build-time configuration for the node.
use core::net::Ipv4Addr;
use embassy_net::{DhcpConfig, Ipv4Cidr, StaticConfigV4};
use hbfc_core::{
    Role,
    config::{SETUP_ADDRESS, SETUP_PREFIX_LEN},
};

#[cfg(all(feature = "interior", feature = "exterior"))]
compile_error!("enable only one of the `interior` and `exterior` features");
#[cfg(not(any(feature = "interior", feature = "exterior")))]
compile_error!("enable one of the `interior` and `exterior` features");

#[cfg(feature = "interior")]
pub const ROLE: Role = Role::Interior;
#[cfg(feature = "exterior")]
pub const ROLE: Role = Role::Exterior;

pub const NODE_NAME: &str = match ROLE {
    Role::Interior => "interior",
    Role::Exterior => "exterior",
};

// In characters.
pub const MEMLOG_CAPACITY: usize = 2048;

/// Start of the 4 KiB sector holding the station credentials.
/// Sits past the application partition of a 4 MiB flash.
pub const CREDENTIALS_OFFSET: u32 = 0x3F_F000;

// SoftAP parameters for configuration mode.
pub const SETUP_CHANNEL: u8 = 1;
pub const SETUP_MAX_CLIENTS: u16 = 2;
pub const SETUP_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 240);
pub const SETUP_LEASE_FIRST: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);
pub const SETUP_LEASE_LAST: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 10);

pub const fn setup_address() -> Ipv4Addr {
    let [a, b, c, d] = SETUP_ADDRESS;
    Ipv4Addr::new(a, b, c, d)
}

/// The station interface takes its address from the router.
pub fn station_net_config() -> embassy_net::Config {
    let mut dhcp = DhcpConfig::default();
    dhcp.hostname = heapless::String::try_from(HOSTNAME).ok();
    embassy_net::Config::dhcpv4(dhcp)
}

/// The SoftAP interface is the gateway of its own small subnet.
pub fn setup_net_config() -> embassy_net::Config {
    embassy_net::Config::ipv4_static(StaticConfigV4 {
        address: Ipv4Cidr::new(setup_address(), SETUP_PREFIX_LEN),
        gateway: Some(setup_address()),
        dns_servers: heapless::Vec::new(),
    })
}

const HOSTNAME: &str = const_format::concatcp!("hbfc-", NODE_NAME);
