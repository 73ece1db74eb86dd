//! # vtime-machine
//!
//! Time services of an emulated machine built on top of [`vtime`]:
//!
//! - [`clock`] – [`MachineClock`], the machine's switchable clock source with
//!   its synchronization point, delayed tasks and virtual time indicator.
//! - [`timer`] – [`LimitTimer`], a general purpose counter peripheral driven
//!   by a single clock entry.
//! - [`config`] – Builder-style configuration.

pub mod clock;
pub mod config;
pub mod error;
pub mod timer;

pub use clock::MachineClock;
pub use config::{MachineClockConfig, MachineClockConfigBuilder, SyncUnitPolicy, DEFAULT_SYNC_UNIT};
pub use error::{MachineError, MachineResult};
pub use timer::{LimitReachedHook, LimitTimer, LimitTimerConfig};
