//! Phase-angle fan drive.
//!
//! A zero-cross interrupt arms a one-shot timer with the current fire delay;
//! when it expires the triac is pulsed. A longer delay leaves less of the
//! half-cycle to the motor, so the regulator slows the fan by raising it.
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use embassy_time::Duration;
use serde::Serialize;
use thiserror::Error;

pub const TRIAC_PULSE_US: u32 = 3;
pub const FAN_RPM_MAX: u32 = 3100;
pub const FAN_RPM_MIN: u32 = 300;
pub const FAN_BLADES: u32 = 2;
/// 60 Hz mains.
pub const SUPPLY_PERIOD_US: u32 = 16_667;
pub const HALF_CYCLE_US: u32 = SUPPLY_PERIOD_US / 2;
pub const INITIAL_DELAY_US: u32 = HALF_CYCLE_US / 2;
pub const DEFAULT_TARGET_RPM: u32 = 2500;
pub const TACH_DEBOUNCE_US: u32 = 1500;
/// Samples further apart than this are treated as the fan still settling.
pub const SAMPLE_TOLERANCE_RPM: i32 = 100;
/// Microseconds of delay per RPM of error.
pub const GAIN: f32 = 0.1;
pub const DELAY_BOUNDL: u32 = 500;
pub const DELAY_BOUNDH: u32 = 8000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum FanError {
    #[error("target of {0} rpm is outside 300..=3100")]
    TargetOutOfRange(u32),
}

pub fn rpm_from_pulses(pulses: u32, period: Duration, blades: u32) -> u32 {
    let period_ms = period.as_millis().max(1);
    let per_minute = u64::from(pulses) * 60_000 / period_ms;
    (per_minute / u64::from(blades.max(1))) as u32
}

/// Proportional speed control over the fire delay.
#[derive(Clone, Copy, Debug)]
pub struct Regulator {
    target_rpm: u32,
    last_rpm: i32,
    delay_us: i32,
}

impl Default for Regulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Regulator {
    pub const fn new() -> Self {
        Regulator {
            target_rpm: DEFAULT_TARGET_RPM,
            last_rpm: -(FAN_RPM_MAX as i32),
            delay_us: INITIAL_DELAY_US as i32,
        }
    }

    pub fn target(&self) -> u32 {
        self.target_rpm
    }

    pub fn set_target(&mut self, rpm: u32) -> Result<(), FanError> {
        if !(FAN_RPM_MIN..=FAN_RPM_MAX).contains(&rpm) {
            return Err(FanError::TargetOutOfRange(rpm));
        }
        self.target_rpm = rpm;
        Ok(())
    }

    pub fn delay_us(&self) -> u32 {
        self.delay_us as u32
    }

    /// Feeds one tachometer sample and returns the fire delay to use next.
    ///
    /// Stalled or barely turning fans leave the delay alone, and so does a
    /// sample that jumped away from the previous one.
    pub fn update(&mut self, measured_rpm: u32) -> u32 {
        let measured = measured_rpm.min(i32::MAX as u32) as i32;
        if measured > FAN_RPM_MIN as i32 {
            if (measured - self.last_rpm).abs() < SAMPLE_TOLERANCE_RPM {
                let error = measured - self.target_rpm as i32;
                self.delay_us += (GAIN * error as f32) as i32;
                self.delay_us = self
                    .delay_us
                    .clamp(DELAY_BOUNDL as i32, DELAY_BOUNDH as i32);
            }
            self.last_rpm = measured;
        }
        self.delay_us()
    }
}

/// Fan state shared with interrupt handlers.
pub struct FanShared {
    drive: AtomicBool,
    fire_delay_us: AtomicU32,
    tach_pulses: AtomicU32,
    last_edge_us: AtomicU32,
}

impl Default for FanShared {
    fn default() -> Self {
        Self::new()
    }
}

impl FanShared {
    pub const fn new() -> Self {
        FanShared {
            drive: AtomicBool::new(false),
            fire_delay_us: AtomicU32::new(INITIAL_DELAY_US),
            tach_pulses: AtomicU32::new(0),
            last_edge_us: AtomicU32::new(0),
        }
    }

    pub fn set_drive(&self, drive: bool) {
        self.drive.store(drive, Ordering::Relaxed);
    }

    pub fn drive(&self) -> bool {
        self.drive.load(Ordering::Relaxed)
    }

    pub fn set_fire_delay(&self, delay_us: u32) {
        self.fire_delay_us.store(delay_us, Ordering::Relaxed);
    }

    pub fn fire_delay(&self) -> u32 {
        self.fire_delay_us.load(Ordering::Relaxed)
    }

    /// Called from the tachometer edge interrupt. Returns whether the edge counted.
    pub fn record_tach_edge(&self, now_us: u32) -> bool {
        let last = self.last_edge_us.load(Ordering::Relaxed);
        if now_us.wrapping_sub(last) <= TACH_DEBOUNCE_US {
            return false;
        }
        self.last_edge_us.store(now_us, Ordering::Relaxed);
        self.tach_pulses.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Pulses since the previous call.
    pub fn take_pulses(&self) -> u32 {
        self.tach_pulses.swap(0, Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FanStatus {
    pub drive: bool,
    pub rpm: u32,
    pub target_rpm: u32,
    pub delay_us: u32,
}
