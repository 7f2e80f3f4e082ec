use alloc::format;
use core::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use edge_dhcp::{
    io::{self, DEFAULT_SERVER_PORT},
    server::{Server, ServerOptions},
};
use edge_nal::UdpBind;
use edge_nal_embassy::{Udp, UdpBuffers};
use embassy_time::{Duration, Timer};
use hbfc_core::{Event, event::ApMode};

use crate::{
    bus::SharedBus,
    config::{SETUP_LEASE_FIRST, SETUP_LEASE_LAST, SETUP_NETMASK, setup_address},
    memlog::SharedLogger,
};

const DHCP_LEASES: usize = 8;
const DHCP_BUF_SIZE: usize = 1500;

/// Hands out addresses on the setup network. Serves nothing until the
/// SoftAP is up, so it runs for the node's whole life.
#[embassy_executor::task]
pub async fn dhcp_server(stack: embassy_net::Stack<'static>, bus: SharedBus, memlog: SharedLogger) {
    let buffers = UdpBuffers::<1, DHCP_BUF_SIZE, DHCP_BUF_SIZE, 4>::new();
    let udp = Udp::new(stack, &buffers);
    let listen = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_SERVER_PORT));
    let mut socket = match udp.bind(listen).await {
        Ok(socket) => socket,
        Err(error) => {
            memlog.error(format!("dhcp: bind to port {DEFAULT_SERVER_PORT}: {error:?}"));
            bus.report(Event::ApMode(ApMode::DhcpConfigFailure));
            return;
        }
    };

    let address = setup_address();
    let mut gateways = [address];
    let mut options = ServerOptions::new(address, Some(&mut gateways));
    options.subnet = Some(SETUP_NETMASK);

    let mut server = Server::<_, DHCP_LEASES>::new_with_et(address);
    server.range_start = SETUP_LEASE_FIRST;
    server.range_end = SETUP_LEASE_LAST;

    let mut buf = [0u8; DHCP_BUF_SIZE];
    loop {
        if let Err(error) = io::server::run(&mut server, &options, &mut socket, &mut buf).await {
            memlog.warn(format!("dhcp: {error:?}"));
        }
        Timer::after(Duration::from_millis(500)).await;
    }
}
