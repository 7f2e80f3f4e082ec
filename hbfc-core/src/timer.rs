//! Software timers, one slot per purpose.
//!
//! Arming a slot always replaces whatever was armed there before, so a phase
//! can never leave a stale timer of the same purpose running behind it.
use embassy_time::{Duration, Instant};
use heapless::Vec;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u16)]
pub enum TimerId {
    /// Restarts the chip. Serviced directly, never dispatched.
    Reboot = 0,
    IpCheck = 1,
    /// Exterior announcement period.
    Broadcast = 2,
    /// Interior deadline for hearing from the exterior.
    PeerWait = 3,
    CredForward = 4,
    Assoc = 5,
    Humidity = 6,
    Tachometer = 7,
    /// Exterior humidity push to the interior.
    PeerReport = 8,
}

impl TimerId {
    pub const COUNT: usize = 9;
    pub const ALL: [TimerId; Self::COUNT] = [
        TimerId::Reboot,
        TimerId::IpCheck,
        TimerId::Broadcast,
        TimerId::PeerWait,
        TimerId::CredForward,
        TimerId::Assoc,
        TimerId::Humidity,
        TimerId::Tachometer,
        TimerId::PeerReport,
    ];

    pub const fn from_param(param: u16) -> Option<Self> {
        if (param as usize) < Self::COUNT {
            Some(Self::ALL[param as usize])
        } else {
            None
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            TimerId::Reboot => "REBOOT",
            TimerId::IpCheck => "IP_CHECK",
            TimerId::Broadcast => "BROADCAST",
            TimerId::PeerWait => "PEER_WAIT",
            TimerId::CredForward => "CRED_FORWARD",
            TimerId::Assoc => "ASSOC",
            TimerId::Humidity => "HUMIDITY",
            TimerId::Tachometer => "TACHOMETER",
            TimerId::PeerReport => "PEER_REPORT",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerMode {
    Once,
    Repeat,
}

#[derive(Clone, Copy, Debug)]
struct Armed {
    period: Duration,
    mode: TimerMode,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct TimerBank {
    slots: [Option<Armed>; TimerId::COUNT],
}

impl TimerBank {
    pub const fn new() -> Self {
        TimerBank {
            slots: [None; TimerId::COUNT],
        }
    }

    /// Arms `id` to first fire at `now + period`.
    ///
    /// Returns true if an armed predecessor was replaced.
    pub fn arm(&mut self, id: TimerId, period: Duration, mode: TimerMode, now: Instant) -> bool {
        let replaced = self.slots[id as usize].is_some();
        self.slots[id as usize] = Some(Armed {
            period,
            mode,
            deadline: now + period,
        });
        replaced
    }

    /// Returns true if the timer was armed.
    pub fn disarm(&mut self, id: TimerId) -> bool {
        self.slots[id as usize].take().is_some()
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.slots[id as usize].is_some()
    }

    pub fn armed(&self) -> impl Iterator<Item = TimerId> + '_ {
        TimerId::ALL
            .into_iter()
            .filter(|id| self.slots[*id as usize].is_some())
    }

    /// The earliest pending deadline, if any timer is armed.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().flatten().map(|armed| armed.deadline).min()
    }

    /// Schedules another expiry of `id` after `delay`, for a tick that could
    /// not be delivered.
    ///
    /// Only a one-shot needs this: a repeating timer is still armed and fires
    /// again on its own. Returns true if the timer was re-armed.
    pub fn retry(&mut self, id: TimerId, delay: Duration, now: Instant) -> bool {
        if self.is_armed(id) {
            return false;
        }
        self.arm(id, delay, TimerMode::Once, now);
        true
    }

    /// Collects every timer whose deadline is at or before `now`.
    ///
    /// One-shot timers are disarmed. Repeating timers are rescheduled one
    /// period past their deadline, or one period past `now` if they fell
    /// more than a period behind, so a stalled caller sees a single expiry.
    pub fn expire(&mut self, now: Instant) -> Vec<TimerId, { TimerId::COUNT }> {
        let mut expired = Vec::new();
        for id in TimerId::ALL {
            let slot = &mut self.slots[id as usize];
            let Some(armed) = *slot else { continue };
            if armed.deadline > now {
                continue;
            }

            *slot = match armed.mode {
                TimerMode::Once => None,
                TimerMode::Repeat => {
                    let next = armed.deadline + armed.period;
                    let deadline = if next > now { next } else { now + armed.period };
                    Some(Armed { deadline, ..armed })
                }
            };
            // Capacity equals the number of slots.
            let _ = expired.push(id);
        }
        expired
    }
}
