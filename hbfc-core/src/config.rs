//! Protocol constants shared by both nodes.
use embassy_time::Duration;

/// Pending events each priority level can hold.
pub const MSG_QUEUE_LENGTH: usize = 4;
/// Dispatched events kept for inspection.
pub const DISPATCH_HISTORY: usize = 16;

// Ports.
pub const DISCOVERY_PORT: u16 = 5000;
pub const PAIRING_PORT: u16 = 6000;
pub const CONFIG_PORT: u16 = 4000;

/// Identifies the exterior's announcement datagrams.
pub const DISCOVERY_KEY: &str = "hbfcd_exterior_confirm";
/// Announcements sent before the exterior gives up on the interior.
pub const BROADCAST_LIMIT: u32 = 60;

/// Open network the interior raises while it waits for credentials.
pub const SETUP_SSID: &str = "HBFC/D Wireless Setup";
pub const SETUP_ADDRESS: [u8; 4] = [192, 168, 0, 1];
pub const SETUP_PREFIX_LEN: u8 = 28;

// Timer periods.
pub const IP_CHECK_INTERVAL: Duration = Duration::from_millis(1000);
pub const REBOOT_DELAY: Duration = Duration::from_millis(5000);
pub const PEER_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(1000);
pub const CRED_FORWARD_INTERVAL: Duration = Duration::from_millis(1000);
pub const ASSOC_CHECK_INTERVAL: Duration = Duration::from_millis(1000);
pub const HUMIDITY_INTERVAL: Duration = Duration::from_millis(3000);
pub const TACH_PERIOD: Duration = Duration::from_millis(1000);
pub const PEER_REPORT_INTERVAL: Duration = Duration::from_millis(3000);
