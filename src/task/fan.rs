//! Interior fan drive: triac phase control plus tachometer feedback.
//!
//! The edge tasks run on an interrupt-priority executor so the fire delay is
//! not at the mercy of the radio and network tasks. They only touch [`FAN`]
//! and their pins.
use alloc::{boxed::Box, format};
use core::cell::RefCell;
use embassy_sync::{
    blocking_mutex::{Mutex, raw::NoopRawMutex},
    channel, watch,
};
use embassy_time::{Instant, Timer};
use esp_hal::{
    delay::Delay,
    gpio::{Input, Output},
};
use hbfc_core::{
    config::TACH_PERIOD,
    fan::{FAN_BLADES, FanError, FanShared, FanStatus, Regulator, TRIAC_PULSE_US, rpm_from_pulses},
};

use crate::memlog::SharedLogger;

/// Shared with the edge tasks.
pub static FAN: FanShared = FanShared::new();

const FAN_COMMAND_QUEUE: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FanCommand {
    /// Close one tachometer period.
    Sample,
}

pub type FanChannel = &'static channel::Channel<NoopRawMutex, FanCommand, FAN_COMMAND_QUEUE>;
pub type FanSender = channel::Sender<'static, NoopRawMutex, FanCommand, FAN_COMMAND_QUEUE>;
pub type FanReceiver = channel::Receiver<'static, NoopRawMutex, FanCommand, FAN_COMMAND_QUEUE>;

pub type FanStatusWatch<const W: usize> = &'static watch::Watch<NoopRawMutex, FanStatus, W>;
pub type FanStatusDynSender = watch::DynSender<'static, FanStatus>;
pub type FanStatusDynReceiver = watch::DynReceiver<'static, FanStatus>;

/// The speed regulator, shared so the console and front-end can set the target.
pub type SharedRegulator = &'static Mutex<NoopRawMutex, RefCell<Regulator>>;

pub fn init<const WATCHERS: usize>() -> (FanChannel, FanStatusWatch<WATCHERS>, SharedRegulator) {
    (
        Box::leak(Box::new(channel::Channel::new())),
        Box::leak(Box::new(watch::Watch::new())),
        Box::leak(Box::new(Mutex::new(RefCell::new(Regulator::new())))),
    )
}

pub fn set_target(regulator: SharedRegulator, rpm: u32) -> Result<(), FanError> {
    regulator.lock(|regulator| regulator.borrow_mut().set_target(rpm))
}

/// Fires the triac after every zero crossing while the fan is driven.
#[embassy_executor::task]
pub async fn zero_cross(mut zcd: Input<'static>, mut triac: Output<'static>) {
    let delay = Delay::new();
    loop {
        zcd.wait_for_falling_edge().await;
        if !FAN.drive() {
            continue;
        }
        Timer::after_micros(u64::from(FAN.fire_delay())).await;
        triac.set_high();
        delay.delay_micros(TRIAC_PULSE_US);
        triac.set_low();
    }
}

/// Counts debounced tachometer pulses.
#[embassy_executor::task]
pub async fn tachometer(mut tach: Input<'static>) {
    loop {
        tach.wait_for_rising_edge().await;
        // Wraps every ~71 minutes; the debounce only looks at differences.
        FAN.record_tach_edge(Instant::now().as_micros() as u32);
    }
}

/// Turns each tachometer period into a speed and a new fire delay.
#[embassy_executor::task]
pub async fn fan_regulator(
    commands: FanReceiver,
    regulator: SharedRegulator,
    status_sender: FanStatusDynSender,
    memlog: SharedLogger,
) {
    loop {
        let FanCommand::Sample = commands.receive().await;

        let rpm = rpm_from_pulses(FAN.take_pulses(), TACH_PERIOD, FAN_BLADES);
        let (delay_us, target_rpm) = regulator.lock(|regulator| {
            let mut regulator = regulator.borrow_mut();
            (regulator.update(rpm), regulator.target())
        });
        if delay_us != FAN.fire_delay() {
            memlog.trace(format!("fan: {rpm} rpm, fire delay {delay_us} us"));
        }
        FAN.set_fire_delay(delay_us);

        status_sender.send(FanStatus {
            drive: FAN.drive(),
            rpm,
            target_rpm,
            delay_us,
        });
    }
}
