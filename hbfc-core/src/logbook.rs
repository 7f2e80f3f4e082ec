//! The in-memory log's storage policy: a history of records bounded by the
//! number of text bytes it holds, not by the number of records.
use alloc::{collections::VecDeque, string::String};
use core::fmt;
use embassy_time::Instant;

/// Stored in place of a record that could never fit.
pub const DISCARD_NOTICE: &str = "log discarded: too large for storage";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub const fn tag(self) -> &'static str {
        match self {
            Level::Trace => "TRCE",
            Level::Debug => "DEBG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERRO",
        }
    }
}

/// Time since boot as `HHHHH:MM:SS.mmm`.
#[derive(Clone, Copy, Debug)]
pub struct Uptime(pub Instant);

impl fmt::Display for Uptime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        let (secs, millis) = (ms / 1000, ms % 1000);
        let (mins, secs) = (secs / 60, secs % 60);
        let (hours, mins) = (mins / 60, mins % 60);
        write!(f, "{hours:05}:{mins:02}:{secs:02}.{millis:03}")
    }
}

#[derive(Clone, Debug)]
pub struct Record {
    pub at: Instant,
    pub level: Level,
    pub text: String,
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", Uptime(self.at), self.level.tag(), self.text)
    }
}

/// Oldest record first.
#[derive(Debug)]
pub struct Logbook {
    records: VecDeque<Record>,
    used: usize,
    budget: usize,
}

impl Logbook {
    /// # Panics
    ///
    /// If `budget` can't hold [`DISCARD_NOTICE`].
    pub fn new(budget: usize) -> Self {
        assert!(
            budget >= DISCARD_NOTICE.len(),
            "log budget must be at least {} bytes",
            DISCARD_NOTICE.len()
        );
        Logbook {
            records: VecDeque::new(),
            used: 0,
            budget,
        }
    }

    /// Stores `record`, evicting the oldest ones to make room.
    ///
    /// A record larger than the whole budget is replaced by a warning.
    /// Returns what was actually stored.
    pub fn push(&mut self, mut record: Record) -> &Record {
        if record.text.len() > self.budget {
            record = Record {
                at: record.at,
                level: Level::Warn,
                text: String::from(DISCARD_NOTICE),
            };
        }
        while self.used + record.text.len() > self.budget {
            let Some(evicted) = self.records.pop_front() else {
                break;
            };
            self.used -= evicted.text.len();
        }
        self.used += record.text.len();
        self.records.push_back(record);
        // Just pushed.
        &self.records[self.records.len() - 1]
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Record> {
        self.records.iter()
    }

    /// Text bytes held.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{format, string::ToString, vec::Vec};

    fn record(ms: u64, text: &str) -> Record {
        Record {
            at: Instant::from_millis(ms),
            level: Level::Info,
            text: text.to_string(),
        }
    }

    fn texts(book: &Logbook) -> Vec<&str> {
        book.iter().map(|record| record.text.as_str()).collect()
    }

    #[test]
    fn evicts_oldest_until_the_new_record_fits() {
        let mut book = Logbook::new(DISCARD_NOTICE.len());
        book.push(record(0, "first record"));
        book.push(record(1, "second record"));
        assert_eq!(book.used(), 25);

        book.push(record(2, "a third record"));
        assert_eq!(texts(&book), ["second record", "a third record"]);
        assert_eq!(book.used(), 27);
    }

    #[test]
    fn oversized_record_becomes_a_warning() {
        let mut book = Logbook::new(DISCARD_NOTICE.len());
        book.push(record(0, "kept?"));
        let long = "x".repeat(DISCARD_NOTICE.len() + 1);

        let stored = book.push(record(5, &long));
        assert_eq!(stored.level, Level::Warn);
        assert_eq!(stored.text, DISCARD_NOTICE);
        // The notice fills the whole budget.
        assert_eq!(texts(&book), [DISCARD_NOTICE]);
    }

    #[test]
    fn clear_releases_the_budget() {
        let mut book = Logbook::new(64);
        book.push(record(0, "one"));
        book.push(record(0, "two"));
        book.clear();
        assert_eq!(book.used(), 0);
        assert_eq!(book.iter().count(), 0);
    }

    #[test]
    #[should_panic]
    fn budget_must_hold_the_discard_notice() {
        Logbook::new(DISCARD_NOTICE.len() - 1);
    }

    #[test]
    fn records_render_with_uptime_and_level() {
        let mut warn = record(3_723_004, "link lost");
        warn.level = Level::Warn;
        assert_eq!(format!("{warn}"), "[00001:02:03.004] WARN: link lost");
        assert_eq!(
            format!("{}", Uptime(Instant::from_millis(360_000_000))),
            "00100:00:00.000"
        );
    }
}
