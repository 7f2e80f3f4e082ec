use alloc::{boxed::Box, format};
use embassy_futures::select::{Either, select};
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, channel};
use embassy_time::{Duration, Instant, Timer};
use hbfc_core::{Event, Priority, TimerBank, TimerId, TimerMode};

use crate::{bus::SharedBus, memlog::SharedLogger};

const TIMER_COMMAND_QUEUE: usize = 8;
/// Delay before offering an undelivered one-shot tick again.
const TICK_RETRY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug)]
pub enum TimerCommand {
    Arm(TimerId, Duration, TimerMode),
    Disarm(TimerId),
}

pub type TimerChannel = &'static channel::Channel<NoopRawMutex, TimerCommand, TIMER_COMMAND_QUEUE>;
pub type TimerSender = channel::Sender<'static, NoopRawMutex, TimerCommand, TIMER_COMMAND_QUEUE>;
pub type TimerReceiver =
    channel::Receiver<'static, NoopRawMutex, TimerCommand, TIMER_COMMAND_QUEUE>;

pub fn init() -> TimerChannel {
    Box::leak(Box::new(channel::Channel::new()))
}

/// Turns timer expiries into bookkeeping ticks.
///
/// REBOOT is never dispatched: once the node is deadlooping the bookkeeping
/// level no longer gets a turn, so the reset happens right here.
#[embassy_executor::task]
pub async fn timers(commands: TimerReceiver, bus: SharedBus, memlog: SharedLogger) {
    let mut bank = TimerBank::new();

    loop {
        let next_deadline = bank.next_deadline();
        let expiry = async {
            match next_deadline {
                Some(deadline) => Timer::at(deadline).await,
                None => core::future::pending().await,
            }
        };

        match select(commands.receive(), expiry).await {
            Either::First(TimerCommand::Arm(id, period, mode)) => {
                if bank.arm(id, period, mode, Instant::now()) {
                    memlog.trace(format!("timers: {} re-armed", id.label()));
                }
            }
            Either::First(TimerCommand::Disarm(id)) => {
                bank.disarm(id);
            }
            Either::Second(()) => {
                for id in bank.expire(Instant::now()) {
                    if id == TimerId::Reboot {
                        esp_println::println!("rebooting");
                        esp_hal::system::software_reset();
                    }
                    if let Err(error) = bus.post(Priority::Bookkeeping, Event::Tick(id)) {
                        // A one-shot would otherwise never fire again.
                        if bank.retry(id, TICK_RETRY, Instant::now()) {
                            memlog.warn(format!("timers: {} tick deferred: {error}", id.label()));
                        } else {
                            memlog.warn(format!("timers: {} tick lost: {error}", id.label()));
                        }
                    }
                }
            }
        }
    }
}
