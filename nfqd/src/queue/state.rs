use std::{
    fmt,
    sync::atomic::{AtomicU8, Ordering},
};

/// Lifecycle of a queue instance. Transitions only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueueState {
    Unbound = 0,
    Bound = 1,
    Running = 2,
    Stopping = 3,
    Closed = 4,
}

impl QueueState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => QueueState::Unbound,
            1 => QueueState::Bound,
            2 => QueueState::Running,
            3 => QueueState::Stopping,
            _ => QueueState::Closed,
        }
    }
}

impl fmt::Display for QueueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueState::Unbound => write!(f, "unbound"),
            QueueState::Bound => write!(f, "bound"),
            QueueState::Running => write!(f, "running"),
            QueueState::Stopping => write!(f, "stopping"),
            QueueState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(QueueState::Unbound as u8))
    }

    pub(crate) fn get(&self) -> QueueState {
        QueueState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move to `next` unless the cell is already there or further along.
    pub(crate) fn advance(&self, next: QueueState) -> QueueState {
        QueueState::from_u8(self.0.fetch_max(next as u8, Ordering::SeqCst))
    }
}
