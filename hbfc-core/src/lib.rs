//! Hardware-independent core of the humidity based fan controller.
//!
//! Everything here is plain data and logic: the event model, the three-level
//! cooperative scheduler, the timer bank, the control state machine, the log
//! storage policy, and the codecs and arithmetic the firmware tasks lean on.
//! The firmware crate wires these up to the radio, sockets, flash, I2C and GPIO.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod control;
pub mod credentials;
pub mod discovery;
pub mod event;
pub mod fan;
pub mod humidity;
pub mod logbook;
pub mod portal;
pub mod scan;
pub mod sched;
pub mod timer;

pub use control::{Action, Controller, Disposition, Phase, Role, Step, TaskId};
pub use event::Event;
pub use sched::{Priority, SchedError, Scheduler};
pub use timer::{TimerBank, TimerId, TimerMode};
