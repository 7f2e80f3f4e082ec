pub mod config_link;
pub mod control;
pub mod dhcp;
pub mod discovery;
pub mod fan;
pub mod httpd;
pub mod humidity_sensor;
pub mod net;
pub mod peer;
pub mod serial_console;
pub mod timers;
pub mod wifi;

pub use control::dispatcher;
pub use humidity_sensor::humidity_sensor;
pub use serial_console::serial_console;
