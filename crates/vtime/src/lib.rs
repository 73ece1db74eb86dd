//! # vtime
//!
//! Virtual time engine for full-system emulation. Emulated devices register
//! [`ClockEntry`] timers with a [`ClockSource`]; the source is advanced in
//! ticks of one microsecond either explicitly by an execution loop
//! ([`BaseClockSource`]) or by a background thread following the host clock
//! ([`HostTimeClockSource`]). Independent emulated machines are kept in step
//! by a [`SynchronizationDomain`].
//!
//! ## Module Overview
//! - [`entry`]  – Clock entries, handlers and frequency conversion.
//! - [`source`] – The [`ClockSource`] contract.
//! - [`base`]   – Tick-driven source dispatching entries.
//! - [`host`]   – Host wall-clock driven source.
//! - [`domain`] – Barrier-based synchronization domains.
//! - [`units`]  – Tick, duration and frequency conversions.

pub mod base;
pub mod domain;
pub mod entry;
pub mod error;
pub mod host;
pub mod source;
mod sync;
pub mod units;

pub use base::BaseClockSource;
pub use domain::{
    DummySynchronizationDomain, SyncAction, SyncDomain, SyncPointHook, SynchronizationDomain,
    Synchronizer,
};
pub use entry::{
    ClockEntry, ClockEntryBuilder, Direction, FrequencyRatio, Handler, HandlerFn, HandlerId,
    WorkMode,
};
pub use error::{ClockError, ClockResult, SyncError, SyncResult};
pub use host::{HostClockConfig, HostClockConfigBuilder, HostTimeClockSource};
pub use source::{ClockSource, EntriesChangedHook, EntryFactory, EntryVisitor};

#[cfg(test)]
mod tests;
