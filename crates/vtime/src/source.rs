//! The contract every timer-owning component programs against.

use crate::entry::{ClockEntry, HandlerId};
use crate::error::ClockResult;
use crate::sync::Arc;

/// Observer called with `(old_count, new_count)` whenever entries are added or removed.
pub type EntriesChangedHook = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Read-modify-write callback for [`ClockSource::exchange_clock_entry_with`].
pub type EntryVisitor<'a> = &'a mut dyn FnMut(ClockEntry) -> ClockEntry;

/// Factory used when the entry to exchange does not exist yet.
pub type EntryFactory<'a> = &'a mut dyn FnMut() -> ClockEntry;

/// A set of clock entries keyed by handler identity.
///
/// Implementations guard their entries with one lock. Every method may be
/// called from a handler that is currently being invoked by the same source.
pub trait ClockSource: Send + Sync {
    /// Registers `entry`; its handler must not already be present.
    fn add_clock_entry(&self, entry: ClockEntry) -> ClockResult<()>;

    fn get_clock_entry(&self, handler: HandlerId) -> ClockResult<ClockEntry>;

    /// Runs `visitor` on the entry while the source is locked.
    fn get_clock_entry_in_lock(
        &self,
        handler: HandlerId,
        visitor: &mut dyn FnMut(&ClockEntry),
    ) -> ClockResult<()>;

    /// Snapshot of every entry in registration order.
    fn get_all_clock_entries(&self) -> Vec<ClockEntry>;

    /// Replaces the entry with `visitor(old)`, or inserts `factory_if_absent()`
    /// when there is no such entry and a factory is given.
    fn exchange_clock_entry_with(
        &self,
        handler: HandlerId,
        visitor: EntryVisitor<'_>,
        factory_if_absent: Option<EntryFactory<'_>>,
    ) -> ClockResult<()>;

    /// Returns `false` when no entry with `handler` was registered.
    fn remove_clock_entry(&self, handler: HandlerId) -> bool;

    /// Removes and returns all entries at once.
    fn eject_clock_entries(&self) -> Vec<ClockEntry>;

    fn add_clock_entries(&self, entries: Vec<ClockEntry>) -> ClockResult<()>;

    /// Total ticks advanced since creation.
    fn current_value(&self) -> i64;

    fn has_entries(&self) -> bool;

    fn execute_in_lock(&self, action: &mut dyn FnMut());

    /// Whether the source advances on its own from host wall-clock time.
    fn is_host_driven(&self) -> bool {
        false
    }
}
