use thiserror::Error;
use vtime::ClockError;

/// Errors reported by machine time services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error("the host time clock source cannot be used while a synchronization domain is attached")]
    HostClockInSyncDomain,

    #[error("the synchronization domain cannot be changed while the host time clock source is used")]
    SyncDomainWithHostClock,

    #[error("delayed execution is only available with a virtual clock source")]
    HostDriven,

    #[error("sync unit must be positive (got {0})")]
    InvalidSyncUnit(i64),

    #[error("limit cannot be zero")]
    ZeroLimit,

    #[error("divider cannot be zero")]
    ZeroDivider,
}

pub type MachineResult<T> = std::result::Result<T, MachineError>;
