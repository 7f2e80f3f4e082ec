use alloc::{boxed::Box, format};
use core::net::Ipv4Addr;
use embassy_futures::{
    select::{Either, select},
    yield_now,
};
use embassy_net::{
    Stack,
    udp::{PacketMetadata, UdpSocket},
};
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, channel, watch};
use hbfc_core::{
    Event,
    config::{BROADCAST_LIMIT, DISCOVERY_PORT},
    discovery::{DiscoveryError, announcement, parse_announcement},
    event::Discovery,
};

use crate::{bus::SharedBus, memlog::SharedLogger};

const DISCOVERY_COMMAND_QUEUE: usize = 4;
const DATAGRAM_SIZE: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryCommand {
    /// Interior: wait for an announcement.
    Listen,
    /// Interior: the wait is over.
    Deadline,
    /// Exterior: open the announcement socket.
    Announce,
    /// Exterior: broadcast one announcement.
    Send,
    /// Exterior: stop announcing and report back.
    Close,
    /// Exterior: stop announcing, the interior found us.
    Retire,
}

pub type DiscoveryChannel =
    &'static channel::Channel<NoopRawMutex, DiscoveryCommand, DISCOVERY_COMMAND_QUEUE>;
pub type DiscoverySender =
    channel::Sender<'static, NoopRawMutex, DiscoveryCommand, DISCOVERY_COMMAND_QUEUE>;
pub type DiscoveryReceiver =
    channel::Receiver<'static, NoopRawMutex, DiscoveryCommand, DISCOVERY_COMMAND_QUEUE>;

/// Where the exterior said it can be reached.
pub type PeerAddressWatch<const W: usize> = &'static watch::Watch<NoopRawMutex, Ipv4Addr, W>;
pub type PeerAddressDynSender = watch::DynSender<'static, Ipv4Addr>;
pub type PeerAddressDynReceiver = watch::DynReceiver<'static, Ipv4Addr>;

pub fn init<const WATCHERS: usize>() -> (DiscoveryChannel, PeerAddressWatch<WATCHERS>) {
    (
        Box::leak(Box::new(channel::Channel::new())),
        Box::leak(Box::new(watch::Watch::new())),
    )
}

#[embassy_executor::task]
pub async fn discovery(
    stack: Stack<'static>,
    commands: DiscoveryReceiver,
    peer_address_sender: PeerAddressDynSender,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    loop {
        match commands.receive().await {
            DiscoveryCommand::Listen => {
                listen(stack, commands, &peer_address_sender, bus, memlog).await
            }
            DiscoveryCommand::Announce => announce(stack, commands, bus, memlog).await,
            // No session to end, but the state machine still waits on these.
            DiscoveryCommand::Deadline => bus.report(Event::Discovery(Discovery::Timeout)),
            DiscoveryCommand::Close => bus.report(Event::Discovery(Discovery::BroadcastCleanup)),
            command => memlog.trace(format!("discovery: {command:?} with no session")),
        }
    }
}

async fn listen(
    stack: Stack<'static>,
    commands: DiscoveryReceiver,
    peer_address_sender: &PeerAddressDynSender,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buffer = [0u8; 4 * DATAGRAM_SIZE];
    let mut tx_meta = [PacketMetadata::EMPTY; 1];
    let mut tx_buffer = [0u8; 1];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(error) = socket.bind(DISCOVERY_PORT) {
        memlog.error(format!("discovery: bind to port {DISCOVERY_PORT}: {error:?}"));
        bus.report(Event::Discovery(Discovery::ListenFailure));
        return;
    }
    memlog.info(format!("discovery: listening on port {DISCOVERY_PORT}"));
    bus.report(Event::Discovery(Discovery::ConfigComplete));

    let mut datagram = [0u8; DATAGRAM_SIZE];
    loop {
        match select(socket.recv_from(&mut datagram), commands.receive()).await {
            Either::First(Ok((len, meta))) => match parse_announcement(&datagram[..len]) {
                Ok(address) => {
                    memlog.info(format!(
                        "discovery: exterior at {address} (from {})",
                        meta.endpoint
                    ));
                    peer_address_sender.send(address);
                    bus.report(Event::Discovery(Discovery::Found));
                    return;
                }
                // Not for us.
                Err(DiscoveryError::MissingKey) => {}
                Err(error) => {
                    memlog.warn(format!("discovery: from {}: {error}", meta.endpoint));
                    bus.report(Event::Discovery(Discovery::Malformed));
                    // Let the dispatcher drain before the next datagram.
                    yield_now().await;
                }
            },
            Either::First(Err(error)) => {
                memlog.warn(format!("discovery: receive: {error:?}"));
            }
            Either::Second(DiscoveryCommand::Deadline) => {
                memlog.warn("discovery: no exterior heard");
                bus.report(Event::Discovery(Discovery::Timeout));
                return;
            }
            Either::Second(DiscoveryCommand::Close | DiscoveryCommand::Retire) => return,
            Either::Second(command) => {
                memlog.trace(format!("discovery: {command:?} while listening"));
            }
        }
    }
}

async fn announce(
    stack: Stack<'static>,
    commands: DiscoveryReceiver,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    let mut rx_meta = [PacketMetadata::EMPTY; 1];
    let mut rx_buffer = [0u8; DATAGRAM_SIZE];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_buffer = [0u8; 2 * DATAGRAM_SIZE];
    let mut socket = UdpSocket::new(
        stack,
        &mut rx_meta,
        &mut rx_buffer,
        &mut tx_meta,
        &mut tx_buffer,
    );
    if let Err(error) = socket.bind(DISCOVERY_PORT) {
        memlog.error(format!("discovery: bind to port {DISCOVERY_PORT}: {error:?}"));
        bus.report(Event::Discovery(Discovery::OpenFailure));
        return;
    }
    bus.report(Event::Discovery(Discovery::ConfigComplete));

    let mut sent: u32 = 0;
    loop {
        match commands.receive().await {
            DiscoveryCommand::Send => {
                if sent >= BROADCAST_LIMIT {
                    memlog.warn(format!("discovery: no interior after {sent} announcements"));
                    bus.report(Event::Discovery(Discovery::Timeout));
                    continue;
                }
                let Some(config) = stack.config_v4() else {
                    memlog.warn("discovery: no address to announce");
                    bus.report(Event::Discovery(Discovery::BroadcastFailure));
                    continue;
                };
                let payload = announcement(config.address.address());
                match socket
                    .send_to(payload.as_bytes(), (Ipv4Addr::BROADCAST, DISCOVERY_PORT))
                    .await
                {
                    Ok(()) => sent += 1,
                    Err(error) => {
                        memlog.warn(format!("discovery: broadcast: {error:?}"));
                        bus.report(Event::Discovery(Discovery::BroadcastFailure));
                    }
                }
            }
            DiscoveryCommand::Close => {
                bus.report(Event::Discovery(Discovery::BroadcastCleanup));
                return;
            }
            DiscoveryCommand::Retire => {
                memlog.debug(format!("discovery: announced {sent} times"));
                return;
            }
            command => memlog.trace(format!("discovery: {command:?} while announcing")),
        }
    }
}
