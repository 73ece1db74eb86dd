use thiserror::Error;

use crate::entry::HandlerId;

/// Contract violations reported by clock sources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("a clock entry with handler {0} already exists in the clock source")]
    DuplicateHandler(HandlerId),

    #[error("no clock entry with handler {0}")]
    NotFound(HandlerId),

    #[error("ticks cannot be negative (got {0})")]
    NegativeTicks(i64),

    #[error("invalid clock entry: {0}")]
    InvalidEntry(&'static str),

    #[error("frequency must be positive (got {0} Hz)")]
    InvalidFrequency(i64),
}

pub type ClockResult<T> = std::result::Result<T, ClockError>;

/// Outcome of a synchronization attempt that did not complete normally.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    #[error("synchronization was cancelled")]
    Cancelled,

    #[error("synchronizer has already exited its domain")]
    Exited,
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
