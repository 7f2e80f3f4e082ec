//! The node's shared in-memory log.
//!
//! Storage and eviction live in [`hbfc_core::logbook`]; this adds the console
//! echo and a watch that live viewers subscribe to.

use alloc::{boxed::Box, format, string::String};
use core::cell::RefCell;
use embassy_sync::{blocking_mutex::raw::NoopRawMutex, watch};
use embassy_time::Instant;
use hbfc_core::logbook::Logbook;

pub use hbfc_core::logbook::{Level, Record};

const MEMLOG_WATCHERS: usize = 2;

pub type LogDynReceiver = watch::DynReceiver<'static, Record>;

struct Sink {
    book: Logbook,
    echo_from: Option<Level>,
    live: Option<&'static watch::Watch<NoopRawMutex, Record, MEMLOG_WATCHERS>>,
}

#[derive(Clone, Copy)]
pub struct SharedLogger {
    sink: &'static RefCell<Sink>,
}

/// Panics if `capacity` is too small to hold a discard notice.
pub fn init(capacity: usize) -> SharedLogger {
    let sink = Sink {
        book: Logbook::new(capacity),
        echo_from: None,
        live: None,
    };
    SharedLogger {
        sink: Box::leak(Box::new(RefCell::new(sink))),
    }
}

impl SharedLogger {
    /// Echo records at or above `level` to the console.
    pub fn enable_print(&self, level: Level) {
        self.sink.borrow_mut().echo_from = Some(level);
    }

    pub fn enable_watch(&self) {
        let mut sink = self.sink.borrow_mut();
        if sink.live.is_none() {
            sink.live = Some(Box::leak(Box::new(watch::Watch::new())));
        }
    }

    /// None until [`enable_watch`](Self::enable_watch), or once every watcher slot is taken.
    pub fn watch(&self) -> Option<LogDynReceiver> {
        self.sink.borrow().live?.dyn_receiver()
    }

    fn record(&self, level: Level, text: String) {
        let mut sink = self.sink.borrow_mut();
        let echo = sink.echo_from.is_some_and(|from| level >= from);
        let live = sink.live;
        let stored = sink.book.push(Record {
            at: Instant::now(),
            level,
            text,
        });

        if echo {
            esp_println::println!("{stored}");
        }
        if let Some(live) = live {
            live.sender().send(stored.clone());
        }
    }

    pub fn trace(&self, text: impl Into<String>) {
        self.record(Level::Trace, text.into());
    }
    pub fn debug(&self, text: impl Into<String>) {
        self.record(Level::Debug, text.into());
    }
    pub fn info(&self, text: impl Into<String>) {
        self.record(Level::Info, text.into());
    }
    pub fn warn(&self, text: impl Into<String>) {
        self.record(Level::Warn, text.into());
    }
    pub fn error(&self, text: impl Into<String>) {
        self.record(Level::Error, text.into());
    }

    pub fn clear(&self) {
        self.sink.borrow_mut().book.clear();
    }

    /// Every record, oldest first, each followed by `line_ending`.
    pub fn render(&self, line_ending: &str) -> String {
        self.sink
            .borrow()
            .book
            .iter()
            .map(|record| format!("{record}{line_ending}"))
            .collect()
    }
}
