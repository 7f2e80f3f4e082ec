//! The pairing link on the pairing port.
//!
//! The exterior accepts, the interior connects. Once paired the exterior
//! pushes its humidity on every report tick and the interior keeps the
//! latest value for the fan decision.
use alloc::{boxed::Box, format};
use embassy_futures::select::{Either, select};
use embassy_net::{Stack, tcp::TcpSocket};
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, channel, watch};
use embassy_time::Duration;
use embedded_io_async::Write;
use hbfc_core::{
    Event,
    config::PAIRING_PORT,
    event::{Discovery, Humidity},
    humidity::{ReportStream, encode_report},
};

use crate::{
    bus::SharedBus,
    memlog::SharedLogger,
    task::{
        discovery::{DiscoveryCommand, DiscoverySender, PeerAddressDynReceiver},
        humidity_sensor::HumidityDynReceiver,
    },
};

const PEER_COMMAND_QUEUE: usize = 4;
// Three missed reports and the link is considered gone.
const PEER_TIMEOUT: Duration = Duration::from_secs(10);
const PEER_BUF_SIZE: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerCommand {
    /// Interior: connect to the announced exterior.
    Connect,
    /// Exterior: accept the interior.
    Listen,
    /// Exterior: push the latest humidity.
    Report,
    Close,
}

pub type PeerChannel = &'static channel::Channel<NoopRawMutex, PeerCommand, PEER_COMMAND_QUEUE>;
pub type PeerSender = channel::Sender<'static, NoopRawMutex, PeerCommand, PEER_COMMAND_QUEUE>;
pub type PeerReceiver = channel::Receiver<'static, NoopRawMutex, PeerCommand, PEER_COMMAND_QUEUE>;

/// The exterior's humidity as last reported over the pairing link.
pub type ExteriorHumidityWatch<const W: usize> = &'static watch::Watch<NoopRawMutex, f32, W>;
pub type ExteriorHumidityDynSender = watch::DynSender<'static, f32>;
pub type ExteriorHumidityDynReceiver = watch::DynReceiver<'static, f32>;

pub fn init<const WATCHERS: usize>() -> (PeerChannel, ExteriorHumidityWatch<WATCHERS>) {
    (
        Box::leak(Box::new(channel::Channel::new())),
        Box::leak(Box::new(watch::Watch::new())),
    )
}

pub struct PeerLinks {
    pub peer_address: PeerAddressDynReceiver,
    pub exterior_humidity: ExteriorHumidityDynSender,
    pub own_humidity: HumidityDynReceiver,
    pub discovery: DiscoverySender,
}

#[embassy_executor::task]
pub async fn peer(
    stack: Stack<'static>,
    commands: PeerReceiver,
    mut links: PeerLinks,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    loop {
        match commands.receive().await {
            PeerCommand::Connect => connect(stack, commands, &mut links, bus, memlog).await,
            PeerCommand::Listen => serve(stack, commands, &mut links, bus, memlog).await,
            PeerCommand::Close => bus.report(Event::Discovery(Discovery::IntCleanup)),
            PeerCommand::Report => memlog.trace("peer: report with no link"),
        }
    }
}

async fn connect(
    stack: Stack<'static>,
    commands: PeerReceiver,
    links: &mut PeerLinks,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    let Some(address) = links.peer_address.try_get() else {
        memlog.warn("peer: no exterior address");
        bus.report(Event::Discovery(Discovery::ConnFailed));
        return;
    };

    let mut rx_buffer = [0u8; PEER_BUF_SIZE];
    let mut tx_buffer = [0u8; PEER_BUF_SIZE];
    let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);
    socket.set_timeout(Some(PEER_TIMEOUT));

    if let Err(error) = socket.connect((address, PAIRING_PORT)).await {
        memlog.warn(format!("peer: connect to {address}:{PAIRING_PORT}: {error:?}"));
        bus.report(Event::Discovery(Discovery::ConnFailed));
        return;
    }
    memlog.info(format!("peer: paired with {address}"));
    bus.report(Event::Discovery(Discovery::Connected));

    let mut chunk = [0u8; 16];
    let mut reports = ReportStream::new();
    loop {
        match select(socket.read(&mut chunk), commands.receive()).await {
            Either::First(Ok(0)) => {
                memlog.warn("peer: exterior closed the link");
                break;
            }
            Either::First(Ok(len)) => reports.feed(&chunk[..len], |report| match report {
                Ok(humidity) => links.exterior_humidity.send(humidity),
                Err(error) => memlog.warn(format!("peer: dropped report: {error}")),
            }),
            Either::First(Err(error)) => {
                memlog.warn(format!("peer: link lost: {error:?}"));
                break;
            }
            Either::Second(PeerCommand::Close) => break,
            Either::Second(command) => memlog.trace(format!("peer: {command:?} while connected")),
        }
    }
    socket.abort();
    // A stale exterior value would keep driving the fan.
    links.exterior_humidity.clear();
}

async fn serve(
    stack: Stack<'static>,
    commands: PeerReceiver,
    links: &mut PeerLinks,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    let mut rx_buffer = [0u8; PEER_BUF_SIZE];
    let mut tx_buffer = [0u8; PEER_BUF_SIZE];
    let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);

    bus.report(Event::Discovery(Discovery::ListenInit));

    let closed = async {
        loop {
            match commands.receive().await {
                PeerCommand::Close => break,
                command => memlog.trace(format!("peer: {command:?} while waiting")),
            }
        }
    };
    match select(socket.accept(PAIRING_PORT), closed).await {
        Either::First(Ok(())) => {}
        Either::First(Err(error)) => {
            memlog.error(format!("peer: accept on port {PAIRING_PORT}: {error:?}"));
            bus.report(Event::Discovery(Discovery::ListenFailure));
            return;
        }
        Either::Second(()) => {
            bus.report(Event::Discovery(Discovery::IntCleanup));
            return;
        }
    }

    socket.set_timeout(Some(PEER_TIMEOUT));
    if let Some(remote) = socket.remote_endpoint() {
        memlog.info(format!("peer: paired with {remote}"));
    }
    if links.discovery.try_send(DiscoveryCommand::Retire).is_err() {
        memlog.warn("peer: discovery queue full, announcer left running");
    }
    bus.report(Event::Discovery(Discovery::Connected));

    loop {
        match commands.receive().await {
            PeerCommand::Report => {
                let Some(reading) = links.own_humidity.try_get() else {
                    memlog.trace("peer: no reading to report yet");
                    continue;
                };
                if let Err(error) = socket.write_all(&encode_report(reading.humidity)).await {
                    memlog.warn(format!("peer: report not sent: {error:?}"));
                    bus.report(Event::Humidity(Humidity::SendFailure));
                    break;
                }
            }
            PeerCommand::Close => {
                bus.report(Event::Discovery(Discovery::IntCleanup));
                break;
            }
            command => memlog.trace(format!("peer: {command:?} while paired")),
        }
    }
    socket.abort();
}
