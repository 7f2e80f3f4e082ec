//! Cooperative three-level task scheduler.
//!
//! Each priority level has one registered handler and a small mailbox. The
//! dispatcher drains the highest non-empty mailbox first, one event per step,
//! FIFO within a level. Starting a task at a level replaces whatever handler
//! was there and posts the event that kicks it off.
use heapless::{Deque, HistoryBuffer};
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::{DISPATCH_HISTORY, MSG_QUEUE_LENGTH},
    event::Event,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Priority {
    Bookkeeping = 0,
    Worker = 1,
    Control = 2,
}

impl Priority {
    pub const LEVELS: usize = 3;
    /// Highest first.
    const DRAIN_ORDER: [Priority; Self::LEVELS] =
        [Priority::Control, Priority::Worker, Priority::Bookkeeping];
}

impl TryFrom<u8> for Priority {
    type Error = SchedError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Bookkeeping),
            1 => Ok(Priority::Worker),
            2 => Ok(Priority::Control),
            _ => Err(SchedError::InvalidPriority(value)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SchedError {
    #[error("priority {0} is out of range")]
    InvalidPriority(u8),
    #[error("no handler registered at {0:?}")]
    NoHandler(Priority),
    #[error("mailbox at {0:?} is full")]
    QueueFull(Priority),
}

/// One event handed to the handler registered at its level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delivery<T> {
    pub task: T,
    pub priority: Priority,
    pub event: Event,
}

struct Level<T> {
    handler: Option<T>,
    mailbox: Deque<Event, MSG_QUEUE_LENGTH>,
}

impl<T> Level<T> {
    const fn new() -> Self {
        Level {
            handler: None,
            mailbox: Deque::new(),
        }
    }
}

pub struct Scheduler<T> {
    levels: [Level<T>; Priority::LEVELS],
    history: HistoryBuffer<(Priority, Event), DISPATCH_HISTORY>,
}

impl<T: Copy> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy> Scheduler<T> {
    pub const fn new() -> Self {
        Scheduler {
            levels: [Level::new(), Level::new(), Level::new()],
            history: HistoryBuffer::new(),
        }
    }

    /// Installs `task` as the handler at `priority`, returning the handler it displaced.
    ///
    /// Events already queued at that level are delivered to the new handler.
    pub fn replace_handler(&mut self, priority: Priority, task: T) -> Option<T> {
        self.levels[priority as usize].handler.replace(task)
    }

    pub fn handler(&self, priority: Priority) -> Option<T> {
        self.levels[priority as usize].handler
    }

    /// Registers `task` at `priority` and posts `event` to trigger it.
    pub fn start(&mut self, task: T, priority: Priority, event: Event) -> Result<Option<T>, SchedError> {
        let displaced = self.replace_handler(priority, task);
        self.post(priority, event)?;
        Ok(displaced)
    }

    /// Enqueues an event. Never blocks; a full mailbox rejects the event.
    pub fn post(&mut self, priority: Priority, event: Event) -> Result<(), SchedError> {
        let level = &mut self.levels[priority as usize];
        if level.handler.is_none() {
            return Err(SchedError::NoHandler(priority));
        }
        level
            .mailbox
            .push_back(event)
            .map_err(|_| SchedError::QueueFull(priority))
    }

    /// Pops the next event, highest priority first.
    pub fn next(&mut self) -> Option<Delivery<T>> {
        for priority in Priority::DRAIN_ORDER {
            let level = &mut self.levels[priority as usize];
            let Some(task) = level.handler else { continue };
            if let Some(event) = level.mailbox.pop_front() {
                self.history.write((priority, event));
                return Some(Delivery {
                    task,
                    priority,
                    event,
                });
            }
        }
        None
    }

    pub fn pending(&self, priority: Priority) -> usize {
        self.levels[priority as usize].mailbox.len()
    }

    pub fn is_idle(&self) -> bool {
        self.levels.iter().all(|level| level.mailbox.is_empty())
    }

    /// Recently dispatched events, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &(Priority, Event)> {
        self.history.oldest_ordered()
    }
}
