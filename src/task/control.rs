//! The dispatcher: the one place events are consumed.
//!
//! Control deliveries go through the state machine and its actions are
//! carried out here. Worker deliveries start the matching service, and
//! bookkeeping ticks are routed to whichever service owns that period.
use alloc::{boxed::Box, format};
use core::fmt::Debug;
use embassy_futures::yield_now;
use embassy_net::Stack;
use embassy_sync::{
    blocking_mutex::raw::NoopRawMutex,
    channel::{self, TrySendError},
    watch,
};
use hbfc_core::{
    Action, Controller, Disposition, Event, Phase, Priority, Role, TaskId, TimerId, TimerMode,
    event::{Control, IpWait},
};
use serde::Serialize;

use crate::{
    bus::{Handler, SharedBus},
    config::ROLE,
    memlog::SharedLogger,
    storage::SharedCredentials,
    task::{
        config_link::{LinkCommand, LinkSender},
        discovery::{DiscoveryCommand, DiscoverySender},
        fan::{FanCommand, FanSender},
        httpd::FrontEndSignal,
        humidity_sensor::{SensorCommand, SensorSender},
        peer::{PeerCommand, PeerSender},
        timers::{TimerCommand, TimerSender},
        wifi::{WifiCommand, WifiSender},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ControlStatus {
    pub role: Role,
    pub phase: Phase,
    pub config_mode: bool,
    pub fallbacks: u16,
}

pub type ControlStatusWatch<const W: usize> = &'static watch::Watch<NoopRawMutex, ControlStatus, W>;
pub type ControlStatusDynSender = watch::DynSender<'static, ControlStatus>;
pub type ControlStatusDynReceiver = watch::DynReceiver<'static, ControlStatus>;

pub fn init<const WATCHERS: usize>() -> ControlStatusWatch<WATCHERS> {
    Box::leak(Box::new(watch::Watch::new()))
}

/// Command queues of the services the dispatcher drives.
pub struct Services {
    pub timers: TimerSender,
    pub wifi: WifiSender,
    pub discovery: DiscoverySender,
    pub peer: PeerSender,
    pub link: LinkSender,
    pub sensor: SensorSender,
    /// Interior only.
    pub fan: Option<FanSender>,
    pub front_end: FrontEndSignal,
}

#[embassy_executor::task]
pub async fn dispatcher(
    station: Stack<'static>,
    services: Services,
    credentials: SharedCredentials,
    status_sender: ControlStatusDynSender,
    bus: SharedBus,
    memlog: SharedLogger,
) {
    let mut dispatcher = Dispatcher {
        controller: Controller::new(ROLE),
        armed: 0,
        one_shot: 0,
        station,
        services,
        credentials,
        bus,
        memlog,
    };
    status_sender.send(dispatcher.status());

    bus.report(Event::Control(Control::Start));

    loop {
        let delivery = bus.next().await;
        match delivery.task {
            Handler::Control => {
                dispatcher.control(delivery.event);
                status_sender.send(dispatcher.status());
            }
            Handler::Worker(task) => dispatcher.start_worker(task),
            Handler::Bookkeeping => dispatcher.bookkeeping(delivery.event),
        }
        // One delivery per turn; the services and the timer task run in between.
        yield_now().await;
    }
}

struct Dispatcher {
    controller: Controller,
    // Timers this side believes are armed, one bit per id. Ticks that race a
    // disarm are dropped against this.
    armed: u16,
    one_shot: u16,
    station: Stack<'static>,
    services: Services,
    credentials: SharedCredentials,
    bus: SharedBus,
    memlog: SharedLogger,
}

const fn timer_bit(id: TimerId) -> u16 {
    1 << (id as u16)
}

impl Dispatcher {
    fn status(&self) -> ControlStatus {
        ControlStatus {
            role: self.controller.role(),
            phase: self.controller.phase(),
            config_mode: self.controller.config_mode(),
            fallbacks: self.controller.fallbacks(),
        }
    }

    fn control(&mut self, event: Event) {
        let before = self.controller.phase();
        let step = self.controller.handle(event);

        match step.disposition {
            Disposition::Advanced => self.memlog.debug(format!("control: {event}")),
            Disposition::Ignored => self.memlog.warn(format!("control: ignored {event}")),
            Disposition::Escalated => self.memlog.error(format!("control: fatal {event}")),
            // The deadloop spins on this until the reset.
            Disposition::Inert => {}
        }

        let after = self.controller.phase();
        if after != before {
            self.memlog.info(format!("control: {before:?} -> {after:?}"));
        }

        for action in step.actions {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Start(task) => {
                let kick_off = Event::Control(Control::Start);
                if let Err(error) = self
                    .bus
                    .start(Handler::Worker(task), Priority::Worker, kick_off)
                {
                    self.memlog
                        .error(format!("control: starting {task:?}: {error}"));
                    self.bus.report(Event::Control(Control::ErrFatal));
                }
            }
            Action::Post(event) => self.bus.report(event),
            Action::Arm(id, period, mode) => {
                if id == TimerId::Reboot {
                    self.memlog
                        .error(format!("rebooting system in {} seconds", period.as_secs()));
                }
                self.armed |= timer_bit(id);
                match mode {
                    TimerMode::Once => self.one_shot |= timer_bit(id),
                    TimerMode::Repeat => self.one_shot &= !timer_bit(id),
                }
                self.command_timers(TimerCommand::Arm(id, period, mode));
            }
            Action::Disarm(id) => {
                self.armed &= !timer_bit(id);
                self.command_timers(TimerCommand::Disarm(id));
            }
            Action::EraseCredentials => match self.credentials.erase() {
                Ok(()) => self.memlog.info("control: stored credentials erased"),
                Err(error) => self.memlog.error(format!("control: erasing credentials: {error}")),
            },
        }
    }

    fn command_timers(&self, command: TimerCommand) {
        if !deliver(&self.services.timers, command, self.memlog) {
            self.bus.report(Event::Control(Control::ErrFatal));
        }
    }

    /// Hands a freshly started worker to the service that carries it out.
    fn start_worker(&mut self, task: TaskId) {
        let services = &self.services;
        let memlog = self.memlog;
        let started = match task {
            TaskId::ApScan => deliver(&services.wifi, WifiCommand::Scan, memlog),
            TaskId::ApModeInit => {
                deliver(&services.wifi, WifiCommand::StartAp, memlog)
                    && deliver(&services.link, LinkCommand::Open, memlog)
            }
            TaskId::ApModeCleanup => {
                deliver(&services.link, LinkCommand::Close, memlog)
                    && deliver(&services.wifi, WifiCommand::StopAp, memlog)
            }
            TaskId::BroadcastListen => {
                deliver(&services.discovery, DiscoveryCommand::Listen, memlog)
            }
            TaskId::PeerConnect => deliver(&services.peer, PeerCommand::Connect, memlog),
            TaskId::FrontEnd => {
                services.front_end.signal(());
                true
            }
            TaskId::ConfigAssoc => deliver(&services.wifi, WifiCommand::JoinSetup, memlog),
            TaskId::ConfigConnect => deliver(&services.link, LinkCommand::Connect, memlog),
            TaskId::ConfigCleanup => {
                deliver(&services.link, LinkCommand::Close, memlog)
                    && deliver(&services.wifi, WifiCommand::Leave, memlog)
            }
            TaskId::IntConnect => deliver(&services.peer, PeerCommand::Listen, memlog),
            TaskId::IntConnectCleanup => deliver(&services.peer, PeerCommand::Close, memlog),
            TaskId::BroadcastInit => {
                deliver(&services.discovery, DiscoveryCommand::Announce, memlog)
            }
            TaskId::BroadcastStop => deliver(&services.discovery, DiscoveryCommand::Close, memlog),
        };

        if started {
            memlog.trace(format!("control: worker {task:?} started"));
        } else {
            memlog.error(format!("control: worker {task:?} not started"));
            self.bus.report(Event::Control(Control::ErrFatal));
        }
    }

    fn bookkeeping(&mut self, event: Event) {
        let Event::Tick(id) = event else {
            self.memlog
                .warn(format!("control: {event} at the bookkeeping level"));
            return;
        };
        if self.armed & timer_bit(id) == 0 {
            self.memlog.trace(format!("control: stale {} tick", id.label()));
            return;
        }
        if self.one_shot & timer_bit(id) != 0 {
            self.armed &= !timer_bit(id);
        }

        let services = &self.services;
        let memlog = self.memlog;
        match id {
            TimerId::IpCheck => {
                if let Some(config) = self.station.config_v4() {
                    memlog.info(format!("control: got address {}", config.address));
                    self.bus.report(Event::IpWait(IpWait::GotIp));
                }
            }
            TimerId::PeerWait => {
                deliver(&services.discovery, DiscoveryCommand::Deadline, memlog);
            }
            TimerId::Broadcast => {
                deliver(&services.discovery, DiscoveryCommand::Send, memlog);
            }
            TimerId::CredForward => {
                deliver(&services.link, LinkCommand::Forward, memlog);
            }
            TimerId::Assoc => {
                deliver(&services.wifi, WifiCommand::CheckAssoc, memlog);
            }
            TimerId::Humidity => {
                deliver(&services.sensor, SensorCommand::Measure, memlog);
            }
            TimerId::Tachometer => {
                if let Some(fan) = &services.fan {
                    deliver(fan, FanCommand::Sample, memlog);
                }
            }
            TimerId::PeerReport => {
                deliver(&services.peer, PeerCommand::Report, memlog);
            }
            // The timer task resets the chip before a REBOOT tick could be posted.
            TimerId::Reboot => memlog.warn("control: REBOOT tick reached the dispatcher"),
        }
    }
}

/// Queues a command without waiting. Returns false if the service is backed up.
fn deliver<C: Debug, const N: usize>(
    sender: &channel::Sender<'static, NoopRawMutex, C, N>,
    command: C,
    memlog: SharedLogger,
) -> bool {
    match sender.try_send(command) {
        Ok(()) => true,
        Err(TrySendError::Full(command)) => {
            memlog.warn(format!("control: {command:?} dropped, queue full"));
            false
        }
    }
}
