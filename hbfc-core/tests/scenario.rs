//! End-to-end runs of the control state machine on top of the scheduler,
//! timer bank and credential store, with the radio and sockets played by
//! the test.
use embassy_time::{Duration, Instant};
use embedded_storage::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};
use hbfc_core::{
    Action, Controller, Event, Phase, Priority, Role, Scheduler, TaskId, TimerBank, TimerId,
    config::MSG_QUEUE_LENGTH,
    credentials::{CredentialStore, StationCredentials},
    discovery::{announcement, parse_announcement},
    event::{ApMode, ApScan, Config, Control, Discovery, IpWait},
    portal::{ACCEPT_REPLY, forward_payload, is_accept, is_credential_push, parse_credentials_form},
    scan::{ScanEntry, strongest},
};
use std::net::Ipv4Addr;

const SECTOR: usize = 4096;

struct MemFlash {
    bytes: Vec<u8>,
}

impl ErrorType for MemFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        bytes.copy_from_slice(&self.bytes[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.bytes.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = SECTOR;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.bytes[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        let start = offset as usize;
        for (cell, byte) in self.bytes[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *byte;
        }
        Ok(())
    }
}

struct Ap {
    ssid: &'static str,
    rssi: i8,
    channel: u8,
}

impl ScanEntry for Ap {
    fn ssid(&self) -> &str {
        self.ssid
    }
    fn rssi(&self) -> i8 {
        self.rssi
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Handler {
    Control,
    Worker(TaskId),
    Bookkeeping,
}

/// One node: the dispatcher loop of the firmware without the I/O.
struct Node {
    controller: Controller,
    sched: Scheduler<Handler>,
    timers: TimerBank,
    store: CredentialStore<MemFlash>,
    now: Instant,
    // Workers kicked off, in order.
    kicked: Vec<TaskId>,
    // Timer ticks delivered at the bookkeeping level.
    ticks: Vec<TimerId>,
}

impl Node {
    fn boot(role: Role) -> Self {
        let flash = MemFlash {
            bytes: vec![0xFF; SECTOR],
        };
        let mut node = Node {
            controller: Controller::new(role),
            sched: Scheduler::new(),
            timers: TimerBank::new(),
            store: CredentialStore::new(flash, 0),
            now: Instant::from_millis(0),
            kicked: Vec::new(),
            ticks: Vec::new(),
        };
        node.sched.replace_handler(Priority::Bookkeeping, Handler::Bookkeeping);
        node.sched
            .start(Handler::Control, Priority::Control, Event::Control(Control::Start))
            .unwrap();
        node.run();
        node
    }

    /// A worker or session reporting back to the state machine.
    fn report(&mut self, event: Event) {
        self.sched.post(Priority::Control, event).unwrap();
        self.run();
    }

    fn advance(&mut self, by: Duration) {
        self.now += by;
        for id in self.timers.expire(self.now) {
            self.sched.post(Priority::Bookkeeping, Event::Tick(id)).unwrap();
        }
        self.run();
    }

    fn run(&mut self) {
        // The deadloop never drains, so passes are bounded.
        for _ in 0..64 {
            let Some(delivery) = self.sched.next() else {
                return;
            };
            match delivery.task {
                Handler::Control => {
                    let step = self.controller.handle(delivery.event);
                    for action in step.actions {
                        self.apply(action);
                    }
                }
                Handler::Worker(task) => self.kicked.push(task),
                Handler::Bookkeeping => {
                    if let Event::Tick(id) = delivery.event {
                        self.ticks.push(id);
                    }
                }
            }
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Start(task) => {
                self.sched
                    .start(Handler::Worker(task), Priority::Worker, Event::Control(Control::Start))
                    .unwrap();
            }
            Action::Post(event) => self.sched.post(Priority::Control, event).unwrap(),
            Action::Arm(id, period, mode) => {
                self.timers.arm(id, period, mode, self.now);
            }
            Action::Disarm(id) => {
                self.timers.disarm(id);
            }
            Action::EraseCredentials => self.store.erase().unwrap(),
        }
    }

    fn last_kicked(&self) -> Option<TaskId> {
        self.kicked.last().copied()
    }

    /// What the scan worker does: filter on the stored SSID.
    fn scan<'a>(&mut self, visible: &'a [Ap]) -> Option<&'a Ap> {
        let stored = self.store.load().unwrap().unwrap_or_default();
        strongest(visible, stored.ssid_str().unwrap_or(""))
    }
}

#[test]
fn interior_takes_credentials_through_the_portal() {
    let visible = [
        Ap { ssid: "Neighbour", rssi: -30, channel: 1 },
        Ap { ssid: "MyNet", rssi: -70, channel: 6 },
        Ap { ssid: "MyNet", rssi: -45, channel: 11 },
    ];

    let mut interior = Node::boot(Role::Interior);
    assert_eq!(interior.last_kicked(), Some(TaskId::ApScan));

    // Nothing stored yet, so nothing in range matches.
    assert!(interior.scan(&visible).is_none());
    interior.report(Event::ApScan(ApScan::NoAp));
    assert_eq!(interior.last_kicked(), Some(TaskId::ApModeInit));
    interior.report(Event::ApMode(ApMode::SetupComplete));
    assert_eq!(interior.controller.phase(), Phase::ConfigMode);

    let posted = parse_credentials_form(b"ssid=MyNet&pass=Secret1").unwrap();
    interior.store.store(&posted).unwrap();
    interior.report(Event::ApMode(ApMode::ConfigRecv));
    assert!(interior.timers.is_armed(TimerId::CredForward));

    // The first forward goes unanswered, the second is accepted.
    interior.advance(Duration::from_millis(1000));
    interior.report(Event::ApMode(ApMode::SendFailure));
    interior.advance(Duration::from_millis(1000));
    assert_eq!(interior.ticks, [TimerId::CredForward, TimerId::CredForward]);

    let stored = interior.store.load().unwrap().unwrap();
    let payload = forward_payload(&stored);
    assert!(is_credential_push(&payload));
    assert_eq!(parse_credentials_form(&payload).unwrap(), posted);
    assert!(is_accept(ACCEPT_REPLY));
    interior.report(Event::ApMode(ApMode::ExtAccept));
    assert!(!interior.timers.is_armed(TimerId::CredForward));
    assert_eq!(interior.last_kicked(), Some(TaskId::ApModeCleanup));

    interior.report(Event::ApMode(ApMode::CleanupComplete));
    assert_eq!(interior.controller.phase(), Phase::Scanning);
    assert_eq!(interior.last_kicked(), Some(TaskId::ApScan));

    let chosen = interior.scan(&visible).unwrap();
    assert_eq!((chosen.ssid, chosen.channel), ("MyNet", 11));
}

#[test]
fn exterior_receives_pushed_credentials() {
    let mut exterior = Node::boot(Role::Exterior);
    exterior.report(Event::ApScan(ApScan::NoAp));
    assert_eq!(exterior.last_kicked(), Some(TaskId::ConfigAssoc));

    exterior.report(Event::Config(Config::AssocInit));
    exterior.advance(Duration::from_millis(1000));
    assert_eq!(exterior.ticks, [TimerId::Assoc]);
    exterior.report(Event::Config(Config::Assoc));
    assert!(!exterior.timers.is_armed(TimerId::Assoc));

    exterior.advance(Duration::from_millis(1000));
    exterior.report(Event::IpWait(IpWait::GotIp));
    assert!(!exterior.timers.is_armed(TimerId::IpCheck));
    assert_eq!(exterior.last_kicked(), Some(TaskId::ConfigConnect));

    let pushed = forward_payload(&StationCredentials::new(b"MyNet", b"Secret1").unwrap());
    assert!(is_credential_push(&pushed));
    let credentials = parse_credentials_form(&pushed).unwrap();
    exterior.store.store(&credentials).unwrap();
    exterior.report(Event::Config(Config::Recv));
    assert_eq!(exterior.last_kicked(), Some(TaskId::ConfigCleanup));

    exterior.report(Event::Config(Config::CleanupComplete));
    assert_eq!(exterior.controller.phase(), Phase::Scanning);
    assert_eq!(
        exterior.store.load().unwrap().unwrap().ssid_str(),
        Some("MyNet")
    );
}

#[test]
fn nodes_pair_over_discovery() {
    let mut interior = Node::boot(Role::Interior);
    let mut exterior = Node::boot(Role::Exterior);
    for node in [&mut interior, &mut exterior] {
        node.report(Event::ApScan(ApScan::Connected));
        node.advance(Duration::from_millis(1000));
        node.report(Event::IpWait(IpWait::GotIp));
        assert_eq!(node.controller.phase(), Phase::Discovery);
    }
    assert_eq!(interior.last_kicked(), Some(TaskId::BroadcastListen));
    assert_eq!(exterior.last_kicked(), Some(TaskId::IntConnect));

    interior.report(Event::Discovery(Discovery::ConfigComplete));
    exterior.report(Event::Discovery(Discovery::ListenInit));
    exterior.report(Event::Discovery(Discovery::ConfigComplete));
    assert!(exterior.timers.is_armed(TimerId::Broadcast));

    let datagram = announcement(Ipv4Addr::new(192, 168, 1, 40));
    assert_eq!(
        parse_announcement(datagram.as_bytes()),
        Ok(Ipv4Addr::new(192, 168, 1, 40))
    );
    interior.report(Event::Discovery(Discovery::Found));
    assert!(!interior.timers.is_armed(TimerId::PeerWait));
    assert_eq!(interior.last_kicked(), Some(TaskId::PeerConnect));

    interior.report(Event::Discovery(Discovery::Connected));
    exterior.report(Event::Discovery(Discovery::Connected));
    assert_eq!(interior.controller.phase(), Phase::Paired);
    assert_eq!(exterior.controller.phase(), Phase::Paired);
    assert_eq!(interior.last_kicked(), Some(TaskId::FrontEnd));

    interior.ticks.clear();
    interior.advance(Duration::from_millis(3000));
    assert!(interior.ticks.contains(&TimerId::Humidity));
    assert!(interior.ticks.contains(&TimerId::Tachometer));
}

#[test]
fn malformed_burst_drained_between_datagrams_keeps_listening() {
    let mut interior = Node::boot(Role::Interior);
    interior.report(Event::ApScan(ApScan::Connected));
    interior.advance(Duration::from_millis(1000));
    interior.report(Event::IpWait(IpWait::GotIp));
    interior.report(Event::Discovery(Discovery::ConfigComplete));

    // The listener yields after each report, so the dispatcher gets a turn.
    for _ in 0..4 * MSG_QUEUE_LENGTH {
        interior.sched.post(Priority::Control, Event::Discovery(Discovery::Malformed)).unwrap();
        interior.run();
        assert_eq!(interior.sched.pending(Priority::Control), 0);
    }
    assert_eq!(interior.controller.phase(), Phase::Discovery);
    assert!(interior.timers.is_armed(TimerId::PeerWait));
}

#[test]
fn silent_exterior_sends_the_interior_back_to_setup() {
    let mut interior = Node::boot(Role::Interior);
    interior
        .store
        .store(&StationCredentials::new(b"MyNet", b"Secret1").unwrap())
        .unwrap();
    interior.report(Event::ApScan(ApScan::Connected));
    interior.advance(Duration::from_millis(1000));
    interior.report(Event::IpWait(IpWait::GotIp));
    interior.report(Event::Discovery(Discovery::ConfigComplete));

    interior.advance(Duration::from_secs(60));
    assert_eq!(interior.ticks.last(), Some(&TimerId::PeerWait));
    // The peer wait tick turns into a discovery timeout, twice over.
    interior.report(Event::Discovery(Discovery::Timeout));
    interior.report(Event::Discovery(Discovery::Timeout));

    assert_eq!(interior.controller.phase(), Phase::ConfigMode);
    assert_eq!(interior.controller.fallbacks(), 1);
    let setups = interior
        .kicked
        .iter()
        .filter(|&&task| task == TaskId::ApModeInit)
        .count();
    assert_eq!(setups, 1);
    assert_eq!(interior.store.load().unwrap(), None);
}

#[test]
fn fatal_outcome_deadloops_until_reboot() {
    let mut exterior = Node::boot(Role::Exterior);
    exterior.report(Event::ApScan(ApScan::FailedScan));

    assert_eq!(exterior.controller.phase(), Phase::Deadloop);
    assert!(exterior.timers.is_armed(TimerId::Reboot));
    // The deadloop keeps one event parked on the control level.
    assert_eq!(exterior.sched.pending(Priority::Control), 1);

    exterior.report(Event::ApScan(ApScan::Connected));
    assert_eq!(exterior.controller.phase(), Phase::Deadloop);
    assert_eq!(exterior.sched.pending(Priority::Control), 1);

    // Ticks starve behind the deadloop, so the reboot cannot ride on one.
    exterior
        .sched
        .post(Priority::Bookkeeping, Event::Tick(TimerId::Reboot))
        .unwrap();
    exterior.run();
    assert!(exterior.ticks.is_empty());

    let expired = exterior
        .timers
        .expire(exterior.now + Duration::from_millis(5000));
    assert_eq!(&expired[..], &[TimerId::Reboot][..]);
}
