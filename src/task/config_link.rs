//! The credential hand-over link on the setup network.
//!
//! The interior listens on the setup address; the exterior, joined to the
//! setup network, connects and waits. Once the portal has saved credentials
//! the interior pushes them on every forward tick until the exterior answers
//! `accept`.
use alloc::{boxed::Box, format};
use embassy_futures::select::{Either, select};
use embassy_net::{Stack, tcp::TcpSocket};
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, channel, watch};
use embassy_time::{Duration, with_timeout};
use embedded_io_async::Write;
use hbfc_core::{
    Event,
    config::CONFIG_PORT,
    event::{ApMode, Config},
    portal::{
        ACCEPT_REPLY, FORWARD_CAPACITY, forward_payload, is_accept, is_credential_push,
        parse_credentials_form,
    },
};

use crate::{
    bus::SharedBus, config::setup_address, memlog::SharedLogger, storage::SharedCredentials,
};

const LINK_COMMAND_QUEUE: usize = 4;
const LINK_BUF_SIZE: usize = 512;
const REPLY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkCommand {
    /// Interior: wait for the exterior to connect.
    Open,
    /// Interior: push the saved credentials once.
    Forward,
    /// Exterior: connect to the interior and wait for credentials.
    Connect,
    Close,
}

pub type LinkChannel = &'static channel::Channel<NoopRawMutex, LinkCommand, LINK_COMMAND_QUEUE>;
pub type LinkSender = channel::Sender<'static, NoopRawMutex, LinkCommand, LINK_COMMAND_QUEUE>;
pub type LinkReceiver = channel::Receiver<'static, NoopRawMutex, LinkCommand, LINK_COMMAND_QUEUE>;

/// Whether an exterior is connected to the interior's forward port.
pub type LinkStatusWatch<const W: usize> = &'static watch::Watch<NoopRawMutex, bool, W>;
pub type LinkStatusDynSender = watch::DynSender<'static, bool>;
pub type LinkStatusDynReceiver = watch::DynReceiver<'static, bool>;

pub fn init<const WATCHERS: usize>() -> (LinkChannel, LinkStatusWatch<WATCHERS>) {
    (
        Box::leak(Box::new(channel::Channel::new())),
        Box::leak(Box::new(watch::Watch::new_with(false))),
    )
}

/// Runs on the setup stack for the interior, on the station stack for the exterior.
#[embassy_executor::task]
pub async fn config_link(
    stack: Stack<'static>,
    commands: LinkReceiver,
    credentials: SharedCredentials,
    link_status: LinkStatusDynSender,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    loop {
        match commands.receive().await {
            LinkCommand::Open => {
                offer(stack, commands, credentials, &link_status, bus, memlog).await;
                link_status.send(false);
            }
            LinkCommand::Connect => receive(stack, commands, credentials, bus, memlog).await,
            LinkCommand::Forward => {
                memlog.trace("link: forward with no link open");
                bus.report(Event::ApMode(ApMode::SendFailure));
            }
            LinkCommand::Close => {}
        }
    }
}

enum Forwarded {
    Accepted,
    NoReply,
    LinkLost,
    FlashFailure,
}

/// Interior side. Re-accepts if the exterior drops off before accepting.
async fn offer(
    stack: Stack<'static>,
    commands: LinkReceiver,
    credentials: SharedCredentials,
    link_status: &LinkStatusDynSender,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    let mut rx_buffer = [0u8; LINK_BUF_SIZE];
    let mut tx_buffer = [0u8; LINK_BUF_SIZE];
    let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);

    loop {
        link_status.send(false);

        let closed = async {
            loop {
                match commands.receive().await {
                    LinkCommand::Close => break,
                    // Nobody to forward to yet; the next tick tries again.
                    LinkCommand::Forward => bus.report(Event::ApMode(ApMode::SendFailure)),
                    command => memlog.trace(format!("link: {command:?} while waiting")),
                }
            }
        };
        match select(socket.accept(CONFIG_PORT), closed).await {
            Either::First(Ok(())) => {}
            Either::First(Err(error)) => {
                memlog.error(format!("link: accept on port {CONFIG_PORT}: {error:?}"));
                bus.report(Event::ApMode(ApMode::ExtInitFailure));
                return;
            }
            Either::Second(()) => return,
        }

        if let Some(remote) = socket.remote_endpoint() {
            memlog.info(format!("link: exterior connected from {remote}"));
        }
        link_status.send(true);

        loop {
            match commands.receive().await {
                LinkCommand::Forward => match forward(&mut socket, credentials, memlog).await {
                    Forwarded::Accepted => {
                        memlog.info("link: exterior accepted the credentials");
                        bus.report(Event::ApMode(ApMode::ExtAccept));
                    }
                    Forwarded::NoReply => bus.report(Event::ApMode(ApMode::SendFailure)),
                    Forwarded::FlashFailure => bus.report(Event::ApMode(ApMode::FlashFailure)),
                    Forwarded::LinkLost => {
                        memlog.warn("link: exterior dropped off");
                        bus.report(Event::ApMode(ApMode::SendFailure));
                        break;
                    }
                },
                LinkCommand::Close => {
                    socket.close();
                    if let Err(error) = socket.flush().await {
                        memlog.warn(format!("link: flush on close: {error:?}"));
                    }
                    return;
                }
                command => memlog.trace(format!("link: {command:?} while linked")),
            }
        }

        socket.abort();
    }
}

async fn forward(
    socket: &mut TcpSocket<'_>,
    credentials: SharedCredentials,
    memlog: SharedLogger,
) -> Forwarded {
    let stored = match credentials.load() {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            memlog.error("link: no saved credentials to forward");
            return Forwarded::FlashFailure;
        }
        Err(error) => {
            memlog.error(format!("link: reading credentials: {error}"));
            return Forwarded::FlashFailure;
        }
    };

    if let Err(error) = socket.write_all(&forward_payload(&stored)).await {
        memlog.warn(format!("link: forward: {error:?}"));
        return Forwarded::LinkLost;
    }

    let mut reply = [0u8; 32];
    match with_timeout(REPLY_TIMEOUT, socket.read(&mut reply)).await {
        Ok(Ok(0)) | Ok(Err(_)) => Forwarded::LinkLost,
        Ok(Ok(len)) if is_accept(&reply[..len]) => Forwarded::Accepted,
        Ok(Ok(_)) | Err(_) => Forwarded::NoReply,
    }
}

/// Exterior side.
async fn receive(
    stack: Stack<'static>,
    commands: LinkReceiver,
    credentials: SharedCredentials,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    let mut rx_buffer = [0u8; LINK_BUF_SIZE];
    let mut tx_buffer = [0u8; LINK_BUF_SIZE];
    let mut socket = TcpSocket::new(stack, &mut rx_buffer, &mut tx_buffer);

    let interior = (setup_address(), CONFIG_PORT);
    if let Err(error) = socket.connect(interior).await {
        memlog.error(format!("link: connect to {}:{CONFIG_PORT}: {error:?}", interior.0));
        bus.report(Event::Config(Config::ConnectFailed));
        return;
    }
    memlog.info("link: waiting for credentials");

    let mut payload = [0u8; FORWARD_CAPACITY];
    loop {
        let len = match select(socket.read(&mut payload), commands.receive()).await {
            Either::First(Ok(0)) => {
                memlog.error("link: interior closed the link");
                bus.report(Event::Config(Config::ConnectFailed));
                return;
            }
            Either::First(Ok(len)) => len,
            Either::First(Err(error)) => {
                memlog.error(format!("link: {error:?}"));
                bus.report(Event::Config(Config::ConnectFailed));
                return;
            }
            Either::Second(LinkCommand::Close) => return,
            Either::Second(command) => {
                memlog.trace(format!("link: {command:?} while receiving"));
                continue;
            }
        };

        let body = &payload[..len];
        if !is_credential_push(body) {
            memlog.warn("link: payload carries no credentials");
            bus.report(Event::Config(Config::Malformed));
            continue;
        }
        let received = match parse_credentials_form(body) {
            Ok(received) => received,
            Err(error) => {
                memlog.warn(format!("link: {error}"));
                bus.report(Event::Config(Config::Malformed));
                continue;
            }
        };
        if let Err(error) = credentials.store(&received) {
            memlog.error(format!("link: saving credentials: {error}"));
            bus.report(Event::Config(Config::FlashFailure));
            return;
        }

        if let Err(error) = socket.write_all(ACCEPT_REPLY).await {
            memlog.warn(format!("link: accept not sent: {error:?}"));
        }
        if let Err(error) = socket.flush().await {
            memlog.warn(format!("link: accept not flushed: {error:?}"));
        }
        socket.close();
        memlog.info("link: credentials received");
        bus.report(Event::Config(Config::Recv));
        return;
    }
}
