//! Events posted by workers and consumed by the dispatcher.
//!
//! Every event is a (signal, outcome) pair. The signal names the subsystem
//! that produced it and the outcome is scoped to that signal. Both fit in 16
//! bits so an event packs losslessly into a single `u32` code, signal in the
//! upper half, which is what the logs and the dispatch history show.
use core::fmt::{self, Display};

use crate::timer::TimerId;

/// Outcome codes at or above this value are failures.
pub const FAILURE_FLOOR: u16 = 0xFF00;

/// Signal category codes.
pub mod signal {
    pub const CONTROL: u16 = 0x0000;
    pub const AP_SCAN: u16 = 0x0001;
    pub const IP_WAIT: u16 = 0x0002;
    pub const DISCOVERY: u16 = 0x0004;
    pub const HUMIDITY: u16 = 0x0005;
    pub const WEB: u16 = 0x0006;
    pub const TICK: u16 = 0x0007;
    pub const CONFIG: u16 = 0x0100;
    pub const APMODE: u16 = 0x0101;
}

macro_rules! outcomes {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $variant:ident = $code:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq)]
        #[repr(u16)]
        pub enum $name {
            $( $variant = $code ),+
        }

        impl $name {
            pub const fn param(self) -> u16 {
                self as u16
            }

            pub const fn from_param(param: u16) -> Option<Self> {
                match param {
                    $( $code => Some(Self::$variant), )+
                    _ => None,
                }
            }

            pub const fn label(self) -> &'static str {
                match self {
                    $( Self::$variant => $label, )+
                }
            }

            pub const fn is_failure(self) -> bool {
                self.param() >= FAILURE_FLOOR
            }
        }
    };
}

outcomes! {
    /// Lifecycle control of the dispatcher itself.
    Control {
        Start = 0x0000 => "START",
        ErrDeadloop = 0xFFFE => "ERR_DEADLOOP",
        ErrFatal = 0xFFFF => "ERR_FATAL",
    }
}

outcomes! {
    /// Result of scanning for, and associating with, the stored network.
    ApScan {
        Connected = 0x0000 => "CONNECTED",
        NoAp = 0x0001 => "NOAP",
        FailedConnect = 0xFFFB => "FAILED_CONNECT",
        FailedConfig = 0xFFFC => "FAILED_CONFIG",
        FailedScan = 0xFFFD => "FAILED_SCAN",
        FlashFailure = 0xFFFE => "FLASH_FAILURE",
        StationModeFailure = 0xFFFF => "STATION_MODE_FAILURE",
    }
}

outcomes! {
    IpWait {
        GotIp = 0x0000 => "GOTIP",
        CheckFailure = 0xFFFF => "CHECK_FAILURE",
    }
}

outcomes! {
    /// Peer discovery and pairing, both roles.
    Discovery {
        ListenInit = 0x0000 => "LISTEN_INIT",
        ConfigComplete = 0x0001 => "CONFIG_COMPLETE",
        Timeout = 0x0002 => "TIMEOUT",
        IntCleanup = 0x0003 => "INT_CLEANUP",
        BroadcastCleanup = 0x0004 => "BROADCAST_CLEANUP",
        Found = 0x0005 => "FOUND",
        Connected = 0x0006 => "CONNECTED",
        BroadcastFailure = 0xFFFA => "BROADCAST_FAILURE",
        ConnFailed = 0xFFFB => "CONN_FAILED",
        Malformed = 0xFFFC => "MALFORMED",
        ListenFailure = 0xFFFE => "LISTEN_FAILURE",
        OpenFailure = 0xFFFF => "OPEN_FAILURE",
    }
}

outcomes! {
    Humidity {
        ReadDone = 0x0000 => "READ_DONE",
        ReadFailure = 0xFFFE => "READ_FAILURE",
        SendFailure = 0xFFFF => "SEND_FAILURE",
    }
}

outcomes! {
    Web {
        InitFailure = 0xFFFF => "INIT_FAILURE",
    }
}

outcomes! {
    /// Exterior node: receiving credentials from the interior's setup network.
    Config {
        AssocInit = 0x0000 => "ASSOC_INIT",
        Assoc = 0x0001 => "ASSOC",
        Recv = 0x0002 => "RECV",
        CleanupComplete = 0x0003 => "CLEANUP_COMPLETE",
        Malformed = 0xFFFA => "MALFORMED",
        StationModeFailure = 0xFFFB => "STATION_MODE_FAILURE",
        ConfigFailure = 0xFFFC => "CONFIG_FAILURE",
        FlashFailure = 0xFFFD => "FLASH_FAILURE",
        ConnectFailed = 0xFFFE => "CONNECT_FAILED",
        SetupFailed = 0xFFFF => "SETUP_FAILED",
    }
}

outcomes! {
    /// Interior node: SoftAP, captive portal and credential forwarding.
    ApMode {
        SetupComplete = 0x0000 => "SETUP_COMPLETE",
        ConfigRecv = 0x0001 => "CONFIG_RECV",
        ExtAccept = 0x0002 => "EXT_ACCEPT",
        CleanupComplete = 0x0003 => "CLEANUP_COMPLETE",
        SendFailure = 0xFFF9 => "SEND_FAILURE",
        FlashFailure = 0xFFFA => "FLASH_FAILURE",
        ExtInitFailure = 0xFFFB => "EXT_INIT_FAILURE",
        WebInitFailure = 0xFFFC => "WEB_INIT_FAILURE",
        DhcpConfigFailure = 0xFFFD => "DHCP_CONFIG_FAILURE",
        ModeConfigFailure = 0xFFFE => "MODE_CONFIG_FAILURE",
        ApModeFailure = 0xFFFF => "AP_MODE_FAILURE",
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Control(Control),
    ApScan(ApScan),
    IpWait(IpWait),
    Discovery(Discovery),
    Humidity(Humidity),
    Web(Web),
    /// A timer expired. Only ever posted at the bookkeeping level.
    Tick(TimerId),
    Config(Config),
    ApMode(ApMode),
}

impl Event {
    pub const fn signal(self) -> u16 {
        match self {
            Event::Control(_) => signal::CONTROL,
            Event::ApScan(_) => signal::AP_SCAN,
            Event::IpWait(_) => signal::IP_WAIT,
            Event::Discovery(_) => signal::DISCOVERY,
            Event::Humidity(_) => signal::HUMIDITY,
            Event::Web(_) => signal::WEB,
            Event::Tick(_) => signal::TICK,
            Event::Config(_) => signal::CONFIG,
            Event::ApMode(_) => signal::APMODE,
        }
    }

    pub const fn param(self) -> u16 {
        match self {
            Event::Control(outcome) => outcome.param(),
            Event::ApScan(outcome) => outcome.param(),
            Event::IpWait(outcome) => outcome.param(),
            Event::Discovery(outcome) => outcome.param(),
            Event::Humidity(outcome) => outcome.param(),
            Event::Web(outcome) => outcome.param(),
            Event::Tick(timer) => timer as u16,
            Event::Config(outcome) => outcome.param(),
            Event::ApMode(outcome) => outcome.param(),
        }
    }

    /// The packed `signal << 16 | parameter` key.
    pub const fn code(self) -> u32 {
        ((self.signal() as u32) << 16) | self.param() as u32
    }

    /// Unpacks a composite key. Unknown signals or outcomes yield `None`.
    pub fn from_code(code: u32) -> Option<Self> {
        let param = code as u16;
        let event = match (code >> 16) as u16 {
            signal::CONTROL => Event::Control(Control::from_param(param)?),
            signal::AP_SCAN => Event::ApScan(ApScan::from_param(param)?),
            signal::IP_WAIT => Event::IpWait(IpWait::from_param(param)?),
            signal::DISCOVERY => Event::Discovery(Discovery::from_param(param)?),
            signal::HUMIDITY => Event::Humidity(Humidity::from_param(param)?),
            signal::WEB => Event::Web(Web::from_param(param)?),
            signal::TICK => Event::Tick(TimerId::from_param(param)?),
            signal::CONFIG => Event::Config(Config::from_param(param)?),
            signal::APMODE => Event::ApMode(ApMode::from_param(param)?),
            _ => return None,
        };
        Some(event)
    }

    pub const fn is_failure(self) -> bool {
        match self {
            Event::Tick(_) => false,
            _ => self.param() >= FAILURE_FLOOR,
        }
    }

    pub const fn signal_label(self) -> &'static str {
        match self {
            Event::Control(_) => "CONTROL",
            Event::ApScan(_) => "AP_SCAN",
            Event::IpWait(_) => "IP_WAIT",
            Event::Discovery(_) => "DISCOVERY",
            Event::Humidity(_) => "HUMIDITY",
            Event::Web(_) => "WEB",
            Event::Tick(_) => "TICK",
            Event::Config(_) => "CONFIG",
            Event::ApMode(_) => "APMODE",
        }
    }

    pub const fn outcome_label(self) -> &'static str {
        match self {
            Event::Control(outcome) => outcome.label(),
            Event::ApScan(outcome) => outcome.label(),
            Event::IpWait(outcome) => outcome.label(),
            Event::Discovery(outcome) => outcome.label(),
            Event::Humidity(outcome) => outcome.label(),
            Event::Web(outcome) => outcome.label(),
            Event::Tick(timer) => timer.label(),
            Event::Config(outcome) => outcome.label(),
            Event::ApMode(outcome) => outcome.label(),
        }
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({:#010x})",
            self.signal_label(),
            self.outcome_label(),
            self.code()
        )
    }
}
