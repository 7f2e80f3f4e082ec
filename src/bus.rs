//! The scheduler as seen by the firmware tasks.
//!
//! Workers report outcomes here, the timer service posts ticks, and the
//! dispatcher pulls one delivery at a time. Everything runs on the one
//! thread-mode executor, so a no-op mutex is enough.
use alloc::{boxed::Box, format};
use core::{
    cell::{Cell, RefCell},
    fmt::Display,
};
use embassy_sync::{
    blocking_mutex::{Mutex, raw::NoopRawMutex},
    signal::Signal,
};
use hbfc_core::{
    Event, Priority, SchedError, Scheduler, TaskId,
    config::DISPATCH_HISTORY,
    event::Control,
    sched::Delivery,
};

use crate::memlog::SharedLogger;

/// Handlers registered with the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    /// The control state machine.
    Control,
    Worker(TaskId),
    /// Timer ticks.
    Bookkeeping,
}

impl Display for Handler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Handler::Control => write!(f, "control"),
            Handler::Worker(task) => write!(f, "worker {task:?}"),
            Handler::Bookkeeping => write!(f, "bookkeeping"),
        }
    }
}

pub type SharedBus = &'static Bus;

pub struct Bus {
    sched: Mutex<NoopRawMutex, RefCell<Scheduler<Handler>>>,
    wake: Signal<NoopRawMutex, ()>,
    // Set when an outcome could not be queued for the control level.
    overflow: Mutex<NoopRawMutex, Cell<bool>>,
    memlog: SharedLogger,
}

/// Registers the control and bookkeeping handlers. The worker level starts empty.
pub fn init(memlog: SharedLogger) -> SharedBus {
    let mut sched = Scheduler::new();
    sched.replace_handler(Priority::Control, Handler::Control);
    sched.replace_handler(Priority::Bookkeeping, Handler::Bookkeeping);

    Box::leak(Box::new(Bus {
        sched: Mutex::new(RefCell::new(sched)),
        wake: Signal::new(),
        overflow: Mutex::new(Cell::new(false)),
        memlog,
    }))
}

impl Bus {
    pub fn post(&self, priority: Priority, event: Event) -> Result<(), SchedError> {
        self.sched
            .lock(|sched| sched.borrow_mut().post(priority, event))?;
        self.wake.signal(());
        Ok(())
    }

    /// Hands a worker outcome to the control state machine.
    ///
    /// An outcome that does not fit in the control mailbox is lost, and the
    /// node is sent down the fatal path instead.
    pub fn report(&self, event: Event) {
        if let Err(error) = self.post(Priority::Control, event) {
            self.memlog
                .error(format!("bus: dropped {event}: {error}"));
            self.overflow.lock(|overflow| overflow.set(true));
            self.wake.signal(());
        }
    }

    /// Registers `task` at `priority`, replacing the previous handler, and kicks it off.
    pub fn start(&self, task: Handler, priority: Priority, event: Event) -> Result<(), SchedError> {
        let replaced = self
            .sched
            .lock(|sched| sched.borrow_mut().start(task, priority, event))?;
        if let Some(previous) = replaced.filter(|previous| *previous != task) {
            self.memlog
                .trace(format!("bus: {task} replaces {previous}"));
        }
        self.wake.signal(());
        Ok(())
    }

    /// Waits for the next delivery, highest priority first.
    pub async fn next(&self) -> Delivery<Handler> {
        loop {
            if self.overflow.lock(|overflow| overflow.replace(false)) {
                return Delivery {
                    task: Handler::Control,
                    priority: Priority::Control,
                    event: Event::Control(Control::ErrFatal),
                };
            }
            if let Some(delivery) = self.sched.lock(|sched| sched.borrow_mut().next()) {
                return delivery;
            }
            self.wake.wait().await;
        }
    }

    pub fn pending(&self, priority: Priority) -> usize {
        self.sched.lock(|sched| sched.borrow().pending(priority))
    }

    /// Dispatched events, oldest first.
    pub fn history(&self) -> heapless::Vec<(Priority, Event), DISPATCH_HISTORY> {
        self.sched
            .lock(|sched| sched.borrow().history().copied().collect())
    }
}
