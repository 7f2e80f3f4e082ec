//! The control state machine.
//!
//! Registered once at the control priority and never replaced. Workers report
//! outcomes as events; this is the only place that decides what happens next.
//! `handle` never performs I/O: it returns the actions for the runtime to
//! carry out, in order.
use embassy_time::Duration;
use heapless::Vec;
use serde::Serialize;

use crate::{
    config::{
        ASSOC_CHECK_INTERVAL, BROADCAST_INTERVAL, CRED_FORWARD_INTERVAL, HUMIDITY_INTERVAL,
        IP_CHECK_INTERVAL, PEER_REPORT_INTERVAL, PEER_WAIT_TIMEOUT, REBOOT_DELAY, TACH_PERIOD,
    },
    event::{ApMode, ApScan, Config, Control, Discovery, Event, Humidity, IpWait, Web},
    timer::{TimerId, TimerMode},
};

pub const MAX_ACTIONS: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Role {
    /// Sits indoors, drives the fan and serves the front-end.
    Interior,
    /// Sits outdoors and reports the outside humidity.
    Exterior,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Phase {
    Boot,
    Scanning,
    IpWait,
    ConfigMode,
    Discovery,
    PeerFound,
    Paired,
    /// A fatal outcome was seen and ERR_FATAL is on its way.
    Fatal,
    /// Waiting for the reboot timer. Nothing advances from here.
    Deadloop,
}

/// Worker tasks the state machine starts at the worker priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TaskId {
    ApScan,
    // Interior.
    ApModeInit,
    ApModeCleanup,
    BroadcastListen,
    PeerConnect,
    FrontEnd,
    // Exterior.
    ConfigAssoc,
    ConfigConnect,
    ConfigCleanup,
    IntConnect,
    IntConnectCleanup,
    BroadcastInit,
    BroadcastStop,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Start(TaskId),
    /// Post back to the control level.
    Post(Event),
    Arm(TimerId, Duration, TimerMode),
    Disarm(TimerId),
    EraseCredentials,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Disposition {
    Advanced,
    /// A recoverable outcome; the current phase carries on.
    Ignored,
    /// An unrecoverable or unexpected outcome was turned into ERR_FATAL.
    Escalated,
    /// The node is shutting down and the event had no effect.
    Inert,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub disposition: Disposition,
    pub actions: Vec<Action, MAX_ACTIONS>,
}

impl Step {
    fn advanced<const N: usize>(actions: [Action; N]) -> Self {
        Step {
            disposition: Disposition::Advanced,
            actions: actions.into_iter().collect(),
        }
    }

    fn ignored() -> Self {
        Step {
            disposition: Disposition::Ignored,
            actions: Vec::new(),
        }
    }

    fn inert<const N: usize>(actions: [Action; N]) -> Self {
        Step {
            disposition: Disposition::Inert,
            actions: actions.into_iter().collect(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Controller {
    role: Role,
    phase: Phase,
    // Set while the node is waiting for, or handing over, credentials.
    config_mode: bool,
    // Times discovery gave up and fell back to configuration mode.
    fallbacks: u16,
}

impl Controller {
    pub const fn new(role: Role) -> Self {
        Controller {
            role,
            phase: Phase::Boot,
            config_mode: false,
            fallbacks: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn config_mode(&self) -> bool {
        self.config_mode
    }

    pub fn fallbacks(&self) -> u16 {
        self.fallbacks
    }

    pub fn handle(&mut self, event: Event) -> Step {
        use Action::*;

        if matches!(self.phase, Phase::Fatal | Phase::Deadloop) {
            return self.handle_shutdown(event);
        }

        match event {
            Event::Control(Control::Start) => {
                self.phase = Phase::Scanning;
                Step::advanced([Start(TaskId::ApScan)])
            }
            Event::Control(Control::ErrFatal) => self.enter_deadloop(),
            // Deadloop is only posted by the deadloop itself.
            Event::Control(Control::ErrDeadloop) => self.escalate(),

            Event::ApScan(ApScan::Connected) => {
                self.phase = Phase::IpWait;
                Step::advanced([Arm(TimerId::IpCheck, IP_CHECK_INTERVAL, TimerMode::Repeat)])
            }
            Event::ApScan(ApScan::NoAp) => {
                self.config_mode = true;
                self.phase = Phase::ConfigMode;
                match self.role {
                    Role::Interior => Step::advanced([Start(TaskId::ApModeInit)]),
                    Role::Exterior => Step::advanced([Start(TaskId::ConfigAssoc)]),
                }
            }
            Event::ApScan(_) => self.escalate(),

            Event::IpWait(IpWait::GotIp) => {
                let next = match (self.role, self.config_mode) {
                    (Role::Interior, _) => {
                        self.phase = Phase::Discovery;
                        TaskId::BroadcastListen
                    }
                    (Role::Exterior, true) => TaskId::ConfigConnect,
                    (Role::Exterior, false) => {
                        self.phase = Phase::Discovery;
                        TaskId::IntConnect
                    }
                };
                Step::advanced([Disarm(TimerId::IpCheck), Start(next)])
            }
            Event::IpWait(IpWait::CheckFailure) => Step::ignored(),

            Event::Humidity(Humidity::ReadDone) => Step::advanced([]),
            Event::Humidity(Humidity::ReadFailure | Humidity::SendFailure) => Step::ignored(),

            Event::Web(Web::InitFailure) => self.escalate(),

            // Ticks belong to the bookkeeping level.
            Event::Tick(_) => self.escalate(),

            Event::Discovery(outcome) => match self.role {
                Role::Interior => self.interior_discovery(outcome),
                Role::Exterior => self.exterior_discovery(outcome),
            },

            Event::ApMode(outcome) if self.role == Role::Interior => self.apmode(outcome),
            Event::Config(outcome) if self.role == Role::Exterior => self.config(outcome),
            Event::ApMode(_) | Event::Config(_) => self.escalate(),
        }
    }

    fn interior_discovery(&mut self, outcome: Discovery) -> Step {
        use Action::*;

        match outcome {
            Discovery::ConfigComplete => {
                Step::advanced([Arm(TimerId::PeerWait, PEER_WAIT_TIMEOUT, TimerMode::Once)])
            }
            Discovery::Timeout => {
                if !self.enter_config_mode() {
                    return Step::ignored();
                }
                Step::advanced([
                    Disarm(TimerId::PeerWait),
                    EraseCredentials,
                    Start(TaskId::ApModeInit),
                ])
            }
            Discovery::Found => {
                self.phase = Phase::PeerFound;
                Step::advanced([Disarm(TimerId::PeerWait), Start(TaskId::PeerConnect)])
            }
            Discovery::Connected => {
                self.phase = Phase::Paired;
                Step::advanced([
                    Arm(TimerId::Humidity, HUMIDITY_INTERVAL, TimerMode::Repeat),
                    Arm(TimerId::Tachometer, TACH_PERIOD, TimerMode::Repeat),
                    Start(TaskId::FrontEnd),
                ])
            }
            // Go back to listening; the listener re-arms the deadline.
            Discovery::ConnFailed => {
                self.phase = Phase::Discovery;
                Step::advanced([Start(TaskId::BroadcastListen)])
            }
            Discovery::Malformed => Step::ignored(),
            _ => self.escalate(),
        }
    }

    fn exterior_discovery(&mut self, outcome: Discovery) -> Step {
        use Action::*;

        match outcome {
            Discovery::ListenInit => Step::advanced([Start(TaskId::BroadcastInit)]),
            Discovery::ConfigComplete => {
                Step::advanced([Arm(TimerId::Broadcast, BROADCAST_INTERVAL, TimerMode::Repeat)])
            }
            Discovery::Timeout => {
                if !self.enter_config_mode() {
                    return Step::ignored();
                }
                Step::advanced([Disarm(TimerId::Broadcast), Start(TaskId::IntConnectCleanup)])
            }
            Discovery::IntCleanup => Step::advanced([Start(TaskId::BroadcastStop)]),
            Discovery::BroadcastCleanup => Step::advanced([Start(TaskId::ConfigAssoc)]),
            Discovery::Connected => {
                self.phase = Phase::Paired;
                Step::advanced([
                    Disarm(TimerId::Broadcast),
                    Arm(TimerId::Humidity, HUMIDITY_INTERVAL, TimerMode::Repeat),
                    Arm(TimerId::PeerReport, PEER_REPORT_INTERVAL, TimerMode::Repeat),
                ])
            }
            Discovery::BroadcastFailure | Discovery::Malformed => Step::ignored(),
            _ => self.escalate(),
        }
    }

    fn apmode(&mut self, outcome: ApMode) -> Step {
        use Action::*;

        match outcome {
            ApMode::SetupComplete => Step::advanced([]),
            ApMode::ConfigRecv => Step::advanced([Arm(
                TimerId::CredForward,
                CRED_FORWARD_INTERVAL,
                TimerMode::Repeat,
            )]),
            ApMode::ExtAccept => {
                Step::advanced([Disarm(TimerId::CredForward), Start(TaskId::ApModeCleanup)])
            }
            ApMode::CleanupComplete => self.rescan(),
            // Retried on the next forward tick.
            ApMode::SendFailure => Step::ignored(),
            _ => self.escalate(),
        }
    }

    fn config(&mut self, outcome: Config) -> Step {
        use Action::*;

        match outcome {
            Config::AssocInit => {
                Step::advanced([Arm(TimerId::Assoc, ASSOC_CHECK_INTERVAL, TimerMode::Repeat)])
            }
            Config::Assoc => Step::advanced([
                Disarm(TimerId::Assoc),
                Arm(TimerId::IpCheck, IP_CHECK_INTERVAL, TimerMode::Repeat),
            ]),
            Config::Recv => {
                self.config_mode = false;
                Step::advanced([Start(TaskId::ConfigCleanup)])
            }
            Config::CleanupComplete => self.rescan(),
            Config::Malformed => Step::ignored(),
            _ => self.escalate(),
        }
    }

    /// Returns false if the node is already in configuration mode.
    fn enter_config_mode(&mut self) -> bool {
        if self.config_mode {
            return false;
        }
        self.config_mode = true;
        self.fallbacks = self.fallbacks.saturating_add(1);
        self.phase = Phase::ConfigMode;
        true
    }

    fn rescan(&mut self) -> Step {
        self.config_mode = false;
        self.phase = Phase::Scanning;
        Step::advanced([Action::Start(TaskId::ApScan)])
    }

    fn escalate(&mut self) -> Step {
        self.phase = Phase::Fatal;
        Step {
            disposition: Disposition::Escalated,
            actions: [Action::Post(Event::Control(Control::ErrFatal))]
                .into_iter()
                .collect(),
        }
    }

    fn enter_deadloop(&mut self) -> Step {
        self.phase = Phase::Deadloop;
        Step::advanced([
            Action::Arm(TimerId::Reboot, REBOOT_DELAY, TimerMode::Once),
            Action::Post(Event::Control(Control::ErrDeadloop)),
        ])
    }

    fn handle_shutdown(&mut self, event: Event) -> Step {
        match (self.phase, event) {
            (Phase::Fatal, Event::Control(Control::ErrFatal)) => self.enter_deadloop(),
            // Keep the control mailbox occupied until the reboot fires.
            (Phase::Deadloop, Event::Control(Control::ErrDeadloop)) => {
                Step::inert([Action::Post(Event::Control(Control::ErrDeadloop))])
            }
            _ => Step::inert([]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Action::*;

    fn started(step: &Step) -> std::vec::Vec<TaskId> {
        step.actions
            .iter()
            .filter_map(|action| match action {
                Start(task) => Some(*task),
                _ => None,
            })
            .collect()
    }

    /// Boots a controller and walks it to the discovery phase.
    fn discovering(role: Role) -> Controller {
        let mut controller = Controller::new(role);
        controller.handle(Event::Control(Control::Start));
        controller.handle(Event::ApScan(ApScan::Connected));
        controller.handle(Event::IpWait(IpWait::GotIp));
        assert_eq!(controller.phase(), Phase::Discovery);
        controller
    }

    #[test]
    fn boot_starts_the_scan() {
        let mut controller = Controller::new(Role::Interior);
        let step = controller.handle(Event::Control(Control::Start));
        assert_eq!(step.disposition, Disposition::Advanced);
        assert_eq!(started(&step), [TaskId::ApScan]);
        assert_eq!(controller.phase(), Phase::Scanning);
    }

    #[test]
    fn association_arms_the_ip_check() {
        let mut controller = Controller::new(Role::Exterior);
        controller.handle(Event::Control(Control::Start));
        let step = controller.handle(Event::ApScan(ApScan::Connected));
        assert_eq!(
            step.actions.as_slice(),
            &[Arm(TimerId::IpCheck, IP_CHECK_INTERVAL, TimerMode::Repeat)]
        );

        let step = controller.handle(Event::IpWait(IpWait::GotIp));
        assert_eq!(
            step.actions.as_slice(),
            &[Disarm(TimerId::IpCheck), Start(TaskId::IntConnect)]
        );
    }

    #[test]
    fn missing_network_enters_configuration_mode() {
        let mut interior = Controller::new(Role::Interior);
        interior.handle(Event::Control(Control::Start));
        let step = interior.handle(Event::ApScan(ApScan::NoAp));
        assert_eq!(started(&step), [TaskId::ApModeInit]);
        assert!(interior.config_mode());

        let mut exterior = Controller::new(Role::Exterior);
        exterior.handle(Event::Control(Control::Start));
        let step = exterior.handle(Event::ApScan(ApScan::NoAp));
        assert_eq!(started(&step), [TaskId::ConfigAssoc]);
        assert_eq!(exterior.phase(), Phase::ConfigMode);
    }

    #[test]
    fn scan_failures_are_fatal() {
        for failure in [
            ApScan::FailedConnect,
            ApScan::FailedConfig,
            ApScan::FailedScan,
            ApScan::FlashFailure,
            ApScan::StationModeFailure,
        ] {
            let mut controller = Controller::new(Role::Interior);
            controller.handle(Event::Control(Control::Start));
            let step = controller.handle(Event::ApScan(failure));
            assert_eq!(step.disposition, Disposition::Escalated);
            assert_eq!(
                step.actions.as_slice(),
                &[Post(Event::Control(Control::ErrFatal))]
            );
        }
    }

    #[test]
    fn exterior_in_config_mode_connects_to_the_setup_network() {
        let mut controller = Controller::new(Role::Exterior);
        controller.handle(Event::Control(Control::Start));
        controller.handle(Event::ApScan(ApScan::NoAp));

        let step = controller.handle(Event::Config(Config::AssocInit));
        assert_eq!(
            step.actions.as_slice(),
            &[Arm(TimerId::Assoc, ASSOC_CHECK_INTERVAL, TimerMode::Repeat)]
        );
        let step = controller.handle(Event::Config(Config::Assoc));
        assert_eq!(
            step.actions.as_slice(),
            &[
                Disarm(TimerId::Assoc),
                Arm(TimerId::IpCheck, IP_CHECK_INTERVAL, TimerMode::Repeat)
            ]
        );
        let step = controller.handle(Event::IpWait(IpWait::GotIp));
        assert_eq!(started(&step), [TaskId::ConfigConnect]);
        assert_eq!(controller.phase(), Phase::ConfigMode);

        controller.handle(Event::Config(Config::Recv));
        assert!(!controller.config_mode());
        let step = controller.handle(Event::Config(Config::CleanupComplete));
        assert_eq!(started(&step), [TaskId::ApScan]);
        assert_eq!(controller.phase(), Phase::Scanning);
    }

    #[test]
    fn interior_pairs_with_the_exterior() {
        let mut controller = discovering(Role::Interior);

        let step = controller.handle(Event::Discovery(Discovery::ConfigComplete));
        assert_eq!(
            step.actions.as_slice(),
            &[Arm(TimerId::PeerWait, PEER_WAIT_TIMEOUT, TimerMode::Once)]
        );
        let step = controller.handle(Event::Discovery(Discovery::Found));
        assert_eq!(
            step.actions.as_slice(),
            &[Disarm(TimerId::PeerWait), Start(TaskId::PeerConnect)]
        );
        assert_eq!(controller.phase(), Phase::PeerFound);

        let step = controller.handle(Event::Discovery(Discovery::Connected));
        assert_eq!(
            step.actions.as_slice(),
            &[
                Arm(TimerId::Humidity, HUMIDITY_INTERVAL, TimerMode::Repeat),
                Arm(TimerId::Tachometer, TACH_PERIOD, TimerMode::Repeat),
                Start(TaskId::FrontEnd),
            ]
        );
        assert_eq!(controller.phase(), Phase::Paired);
    }

    #[test]
    fn interior_retries_listening_after_a_failed_connect() {
        let mut controller = discovering(Role::Interior);
        controller.handle(Event::Discovery(Discovery::Found));
        let step = controller.handle(Event::Discovery(Discovery::ConnFailed));
        assert_eq!(step.disposition, Disposition::Advanced);
        assert_eq!(started(&step), [TaskId::BroadcastListen]);
        assert_eq!(controller.phase(), Phase::Discovery);
    }

    #[test]
    fn exterior_announces_until_paired() {
        let mut controller = discovering(Role::Exterior);

        let step = controller.handle(Event::Discovery(Discovery::ListenInit));
        assert_eq!(started(&step), [TaskId::BroadcastInit]);
        let step = controller.handle(Event::Discovery(Discovery::ConfigComplete));
        assert_eq!(
            step.actions.as_slice(),
            &[Arm(TimerId::Broadcast, BROADCAST_INTERVAL, TimerMode::Repeat)]
        );
        let step = controller.handle(Event::Discovery(Discovery::Connected));
        assert_eq!(
            step.actions.as_slice(),
            &[
                Disarm(TimerId::Broadcast),
                Arm(TimerId::Humidity, HUMIDITY_INTERVAL, TimerMode::Repeat),
                Arm(TimerId::PeerReport, PEER_REPORT_INTERVAL, TimerMode::Repeat),
            ]
        );
    }

    #[test]
    fn discovery_timeout_falls_back_exactly_once() {
        let mut controller = discovering(Role::Interior);
        controller.handle(Event::Discovery(Discovery::ConfigComplete));

        let step = controller.handle(Event::Discovery(Discovery::Timeout));
        assert_eq!(
            step.actions.as_slice(),
            &[
                Disarm(TimerId::PeerWait),
                EraseCredentials,
                Start(TaskId::ApModeInit)
            ]
        );
        assert_eq!(controller.phase(), Phase::ConfigMode);

        // A late duplicate must not start AP mode a second time.
        let step = controller.handle(Event::Discovery(Discovery::Timeout));
        assert_eq!(step.disposition, Disposition::Ignored);
        assert!(started(&step).is_empty());
        assert_eq!(controller.fallbacks(), 1);
    }

    #[test]
    fn exterior_timeout_unwinds_into_association() {
        let mut controller = discovering(Role::Exterior);
        controller.handle(Event::Discovery(Discovery::ListenInit));
        controller.handle(Event::Discovery(Discovery::ConfigComplete));

        let step = controller.handle(Event::Discovery(Discovery::Timeout));
        assert_eq!(
            step.actions.as_slice(),
            &[Disarm(TimerId::Broadcast), Start(TaskId::IntConnectCleanup)]
        );
        let step = controller.handle(Event::Discovery(Discovery::IntCleanup));
        assert_eq!(started(&step), [TaskId::BroadcastStop]);
        let step = controller.handle(Event::Discovery(Discovery::BroadcastCleanup));
        assert_eq!(started(&step), [TaskId::ConfigAssoc]);
        assert!(controller.config_mode());

        let step = controller.handle(Event::Discovery(Discovery::Timeout));
        assert_eq!(step.disposition, Disposition::Ignored);
    }

    #[test]
    fn noise_is_ignored_in_place() {
        let mut interior = discovering(Role::Interior);
        for event in [
            Event::Discovery(Discovery::Malformed),
            Event::IpWait(IpWait::CheckFailure),
            Event::Humidity(Humidity::ReadFailure),
        ] {
            assert_eq!(interior.handle(event).disposition, Disposition::Ignored);
            assert_eq!(interior.phase(), Phase::Discovery);
        }

        let mut exterior = discovering(Role::Exterior);
        let step = exterior.handle(Event::Discovery(Discovery::BroadcastFailure));
        assert_eq!(step.disposition, Disposition::Ignored);
    }

    #[test]
    fn other_roles_events_are_fatal() {
        let mut interior = discovering(Role::Interior);
        let step = interior.handle(Event::Config(Config::Recv));
        assert_eq!(step.disposition, Disposition::Escalated);

        let mut exterior = discovering(Role::Exterior);
        let step = exterior.handle(Event::Discovery(Discovery::Found));
        assert_eq!(step.disposition, Disposition::Escalated);
    }

    #[test]
    fn credentials_are_forwarded_until_accepted() {
        let mut controller = Controller::new(Role::Interior);
        controller.handle(Event::Control(Control::Start));
        controller.handle(Event::ApScan(ApScan::NoAp));

        let step = controller.handle(Event::ApMode(ApMode::SetupComplete));
        assert!(step.actions.is_empty());
        let step = controller.handle(Event::ApMode(ApMode::ConfigRecv));
        assert_eq!(
            step.actions.as_slice(),
            &[Arm(TimerId::CredForward, CRED_FORWARD_INTERVAL, TimerMode::Repeat)]
        );
        let step = controller.handle(Event::ApMode(ApMode::SendFailure));
        assert_eq!(step.disposition, Disposition::Ignored);

        let step = controller.handle(Event::ApMode(ApMode::ExtAccept));
        assert_eq!(
            step.actions.as_slice(),
            &[Disarm(TimerId::CredForward), Start(TaskId::ApModeCleanup)]
        );
        let step = controller.handle(Event::ApMode(ApMode::CleanupComplete));
        assert_eq!(started(&step), [TaskId::ApScan]);
        assert!(!controller.config_mode());
    }

    #[test]
    fn fatal_arms_the_reboot_and_deadloops() {
        let mut controller = discovering(Role::Interior);
        let step = controller.handle(Event::Discovery(Discovery::ListenFailure));
        assert_eq!(step.disposition, Disposition::Escalated);
        assert_eq!(controller.phase(), Phase::Fatal);

        let step = controller.handle(Event::Control(Control::ErrFatal));
        assert_eq!(
            step.actions.as_slice(),
            &[
                Arm(TimerId::Reboot, REBOOT_DELAY, TimerMode::Once),
                Post(Event::Control(Control::ErrDeadloop)),
            ]
        );
        assert_eq!(controller.phase(), Phase::Deadloop);

        let step = controller.handle(Event::Control(Control::ErrDeadloop));
        assert_eq!(
            step.actions.as_slice(),
            &[Post(Event::Control(Control::ErrDeadloop))]
        );
    }

    #[test]
    fn nothing_advances_after_fatal() {
        let mut controller = discovering(Role::Interior);
        controller.handle(Event::Control(Control::ErrFatal));

        for event in [
            Event::Discovery(Discovery::Found),
            Event::Discovery(Discovery::Connected),
            Event::ApScan(ApScan::Connected),
            Event::Control(Control::Start),
            Event::Control(Control::ErrFatal),
        ] {
            let step = controller.handle(event);
            assert_eq!(step.disposition, Disposition::Inert);
            assert!(step.actions.is_empty());
            assert_eq!(controller.phase(), Phase::Deadloop);
        }
    }

    #[test]
    fn events_between_escalation_and_fatal_are_inert() {
        let mut controller = discovering(Role::Exterior);
        controller.handle(Event::Web(Web::InitFailure));
        let step = controller.handle(Event::Discovery(Discovery::ListenInit));
        assert_eq!(step.disposition, Disposition::Inert);
        assert_eq!(controller.phase(), Phase::Fatal);
    }
}
