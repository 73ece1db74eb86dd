//! Tick-driven clock source dispatching clock entries.

use core::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::entry::{ClockEntry, Direction, Handler, HandlerId, WorkMode};
use crate::error::{ClockError, ClockResult};
use crate::source::{ClockSource, EntriesChangedHook, EntryFactory, EntryVisitor};
use crate::sync::{Mutex, ReentrantMutex};

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Sources whose update loop is running on this thread.
    static UPDATING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Marks a source as updating on the current thread until dropped.
struct UpdateGuard {
    source: u64,
}

impl UpdateGuard {
    fn enter(source: u64) -> Option<Self> {
        UPDATING.with(|updating| {
            let mut updating = updating.borrow_mut();
            if updating.contains(&source) {
                None
            } else {
                updating.push(source);
                Some(Self { source })
            }
        })
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        UPDATING.with(|updating| updating.borrow_mut().retain(|id| *id != self.source));
    }
}

/// Applies `ticks` to an entry, lowers `nearest_tick_in` to the entry's next
/// boundary and reports whether the entry fired.
type UpdateHandler = fn(&mut ClockEntry, i64, &mut i64) -> bool;

fn select_update_handler(direction: Direction, ratio: i64) -> UpdateHandler {
    match (direction, ratio > 0) {
        (Direction::Ascending, true) => ascending_positive_ratio,
        (Direction::Ascending, false) => ascending_negative_ratio,
        (Direction::Descending, true) => descending_positive_ratio,
        (Direction::Descending, false) => descending_negative_ratio,
    }
}

fn fire(entry: &mut ClockEntry) {
    if entry.work_mode == WorkMode::OneShot {
        entry.enabled = false;
    }
}

fn ascending_positive_ratio(entry: &mut ClockEntry, ticks: i64, nearest_tick_in: &mut i64) -> bool {
    entry.value = entry.value.saturating_add(ticks.saturating_mul(entry.ratio));
    entry.value_residuum = 0;
    let fired = entry.value >= entry.period;
    if fired {
        entry.value = 0;
        fire(entry);
    }
    if entry.enabled {
        let next = (entry.period - entry.value - 1) / entry.ratio + 1;
        *nearest_tick_in = (*nearest_tick_in).min(next);
    }
    fired
}

fn ascending_negative_ratio(entry: &mut ClockEntry, ticks: i64, nearest_tick_in: &mut i64) -> bool {
    let divisor = -entry.ratio;
    let progress = ticks.saturating_add(entry.value_residuum);
    entry.value = entry.value.saturating_add(progress / divisor);
    entry.value_residuum = progress % divisor;
    let fired = entry.value >= entry.period;
    if fired {
        entry.value = 0;
        fire(entry);
    }
    if entry.enabled {
        let next = (entry.period - entry.value).saturating_mul(divisor) - entry.value_residuum;
        *nearest_tick_in = (*nearest_tick_in).min(next);
    }
    fired
}

fn descending_positive_ratio(entry: &mut ClockEntry, ticks: i64, nearest_tick_in: &mut i64) -> bool {
    entry.value = entry.value.saturating_sub(ticks.saturating_mul(entry.ratio));
    entry.value_residuum = 0;
    let fired = entry.value <= 0;
    if fired {
        entry.value = entry.period;
        fire(entry);
    }
    if entry.enabled {
        let next = (entry.value - 1) / entry.ratio + 1;
        *nearest_tick_in = (*nearest_tick_in).min(next);
    }
    fired
}

fn descending_negative_ratio(entry: &mut ClockEntry, ticks: i64, nearest_tick_in: &mut i64) -> bool {
    let divisor = -entry.ratio;
    let progress = ticks.saturating_add(entry.value_residuum);
    entry.value = entry.value.saturating_sub(progress / divisor);
    entry.value_residuum = progress % divisor;
    let fired = entry.value <= 0;
    if fired {
        entry.value = entry.period;
        fire(entry);
    }
    if entry.enabled {
        let next = entry.value.saturating_mul(divisor) - entry.value_residuum;
        *nearest_tick_in = (*nearest_tick_in).min(next);
    }
    fired
}

struct Slot {
    entry: ClockEntry,
    update: UpdateHandler,
}

impl Slot {
    fn new(entry: ClockEntry) -> Self {
        let update = select_update_handler(entry.direction, entry.ratio);
        Self { entry, update }
    }
}

struct ClockState {
    slots: Vec<Slot>,
    nearest_tick_in: i64,
    elapsed: i64,
    total_elapsed: i64,
    /// Set when a nested update was skipped and the limits are stale.
    limits_dirty: bool,
}

impl ClockState {
    fn position(&self, handler: HandlerId) -> Option<usize> {
        self.slots.iter().position(|slot| slot.entry.handler_id() == handler)
    }
}

/// Clock source advanced explicitly by its owner.
///
/// `advance` fires every entry whose boundary is crossed, never skipping one
/// even when asked to move far past the nearest boundary. Handlers run on the
/// advancing thread after all entries have been updated, in registration
/// order, and may call back into the source.
pub struct BaseClockSource {
    id: u64,
    state: ReentrantMutex<RefCell<ClockState>>,
    entries_changed: Mutex<Option<EntriesChangedHook>>,
}

impl Default for BaseClockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseClockSource {
    pub fn new() -> Self {
        Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            state: ReentrantMutex::new(RefCell::new(ClockState {
                slots: Vec::new(),
                nearest_tick_in: i64::MAX,
                elapsed: 0,
                total_elapsed: 0,
                limits_dirty: false,
            })),
            entries_changed: Mutex::new(None),
        }
    }

    /// Ticks left until the nearest enabled entry fires.
    pub fn nearest_tick_in(&self) -> i64 {
        self.with_state(|state| state.nearest_tick_in)
    }

    pub fn set_entries_changed_hook(&self, hook: Option<EntriesChangedHook>) {
        *self.entries_changed.lock() = hook;
    }

    /// Moves virtual time forward by `ticks`.
    ///
    /// Unless `immediately` is set, entries are only scanned when the nearest
    /// boundary is reached; smaller advances just accumulate.
    pub fn advance(&self, ticks: i64, immediately: bool) -> ClockResult<()> {
        if ticks < 0 {
            return Err(ClockError::NegativeTicks(ticks));
        }
        let _lock = self.state.lock();
        let mut remaining = ticks;
        loop {
            let nearest = self.with_state(|state| state.nearest_tick_in);
            if remaining <= nearest {
                self.advance_inner(remaining, immediately);
                return Ok(());
            }
            self.advance_inner(nearest, immediately);
            remaining -= nearest;
        }
    }

    fn advance_inner(&self, ticks: i64, immediately: bool) {
        let _lock = self.state.lock();
        let reached = self.with_state(|state| {
            state.elapsed += ticks;
            state.total_elapsed += ticks;
            if state.nearest_tick_in > ticks && !immediately {
                // i64::MAX means no enabled entry is pending.
                if state.nearest_tick_in != i64::MAX {
                    state.nearest_tick_in -= ticks;
                }
                false
            } else {
                true
            }
        });
        if reached {
            self.update();
        }
    }

    /// Applies pending elapsed ticks and recomputes `nearest_tick_in`.
    fn update_limits(&self) {
        self.advance_inner(0, true);
    }

    fn update(&self) {
        let Some(_guard) = UpdateGuard::enter(self.id) else {
            self.with_state(|state| state.limits_dirty = true);
            return;
        };
        let _lock = self.state.lock();
        loop {
            let fired = self.with_state(|state| {
                let ticks = core::mem::take(&mut state.elapsed);
                state.limits_dirty = false;
                state.nearest_tick_in = i64::MAX;
                let mut fired: Vec<Handler> = Vec::new();
                for slot in state.slots.iter_mut().filter(|slot| slot.entry.enabled) {
                    if (slot.update)(&mut slot.entry, ticks, &mut state.nearest_tick_in) {
                        fired.push(slot.entry.handler.clone());
                    }
                }
                fired
            });
            for handler in &fired {
                handler.invoke();
            }
            if !self.with_state(|state| state.limits_dirty) {
                break;
            }
        }
    }

    /// Borrows the state under the lock. `f` must not call back into `self`.
    fn with_state<R>(&self, f: impl FnOnce(&mut ClockState) -> R) -> R {
        let lock = self.state.lock();
        let mut state = lock.borrow_mut();
        f(&mut state)
    }

    fn notify_entries_changed(&self, old_count: usize, new_count: usize) {
        let hook = self.entries_changed.lock().clone();
        if let Some(hook) = hook {
            hook(old_count, new_count);
        }
    }

    fn find_entry(&self, handler: HandlerId) -> ClockResult<ClockEntry> {
        self.with_state(|state| {
            state
                .position(handler)
                .map(|index| state.slots[index].entry.clone())
                .ok_or(ClockError::NotFound(handler))
        })
    }

    fn check_replacement(&self, previous: Option<HandlerId>, entry: &ClockEntry) -> ClockResult<()> {
        entry.validate()?;
        let id = entry.handler_id();
        if Some(id) != previous && self.with_state(|state| state.position(id).is_some()) {
            return Err(ClockError::DuplicateHandler(id));
        }
        Ok(())
    }
}

impl ClockSource for BaseClockSource {
    fn add_clock_entry(&self, entry: ClockEntry) -> ClockResult<()> {
        let (old_count, new_count) = {
            let _lock = self.state.lock();
            // Pending ticks belong to the entries registered before this one.
            self.update_limits();
            self.check_replacement(None, &entry)?;
            let handler = entry.handler_id();
            let counts = self.with_state(|state| {
                let old_count = state.slots.len();
                state.slots.push(Slot::new(entry));
                (old_count, state.slots.len())
            });
            self.update_limits();
            debug!("clock source {}: added entry {handler}", self.id);
            counts
        };
        self.notify_entries_changed(old_count, new_count);
        Ok(())
    }

    fn get_clock_entry(&self, handler: HandlerId) -> ClockResult<ClockEntry> {
        let _lock = self.state.lock();
        self.update_limits();
        self.find_entry(handler)
    }

    fn get_clock_entry_in_lock(
        &self,
        handler: HandlerId,
        visitor: &mut dyn FnMut(&ClockEntry),
    ) -> ClockResult<()> {
        let _lock = self.state.lock();
        self.update_limits();
        let entry = self.find_entry(handler)?;
        visitor(&entry);
        Ok(())
    }

    fn get_all_clock_entries(&self) -> Vec<ClockEntry> {
        let _lock = self.state.lock();
        self.update_limits();
        self.with_state(|state| state.slots.iter().map(|slot| slot.entry.clone()).collect())
    }

    fn exchange_clock_entry_with(
        &self,
        handler: HandlerId,
        visitor: EntryVisitor<'_>,
        factory_if_absent: Option<EntryFactory<'_>>,
    ) -> ClockResult<()> {
        let mut inserted = None;
        {
            let _lock = self.state.lock();
            self.update_limits();
            match self.find_entry(handler) {
                Ok(old) => {
                    let replacement = visitor(old);
                    self.check_replacement(Some(handler), &replacement)?;
                    self.with_state(|state| match state.position(handler) {
                        Some(index) => {
                            state.slots[index] = Slot::new(replacement);
                            Ok(())
                        }
                        None => Err(ClockError::NotFound(handler)),
                    })?;
                }
                Err(not_found) => {
                    let Some(factory) = factory_if_absent else {
                        return Err(not_found);
                    };
                    let created = factory();
                    self.check_replacement(None, &created)?;
                    inserted = Some(self.with_state(|state| {
                        let old_count = state.slots.len();
                        state.slots.push(Slot::new(created));
                        (old_count, state.slots.len())
                    }));
                }
            }
            self.update_limits();
        }
        if let Some((old_count, new_count)) = inserted {
            self.notify_entries_changed(old_count, new_count);
        }
        Ok(())
    }

    fn remove_clock_entry(&self, handler: HandlerId) -> bool {
        let counts = {
            let _lock = self.state.lock();
            let removed = self.with_state(|state| {
                let index = state.position(handler)?;
                let old_count = state.slots.len();
                state.slots.remove(index);
                Some((old_count, state.slots.len()))
            });
            if removed.is_some() {
                self.update_limits();
                debug!("clock source {}: removed entry {handler}", self.id);
            }
            removed
        };
        match counts {
            Some((old_count, new_count)) => {
                self.notify_entries_changed(old_count, new_count);
                true
            }
            None => false,
        }
    }

    fn eject_clock_entries(&self) -> Vec<ClockEntry> {
        let entries: Vec<ClockEntry> = {
            let _lock = self.state.lock();
            self.update_limits();
            self.with_state(|state| {
                state.nearest_tick_in = i64::MAX;
                state.slots.drain(..).map(|slot| slot.entry).collect()
            })
        };
        debug!("clock source {}: ejected {} entries", self.id, entries.len());
        self.notify_entries_changed(entries.len(), 0);
        entries
    }

    fn add_clock_entries(&self, entries: Vec<ClockEntry>) -> ClockResult<()> {
        let _lock = self.state.lock();
        for entry in entries {
            self.add_clock_entry(entry)?;
        }
        Ok(())
    }

    fn current_value(&self) -> i64 {
        self.with_state(|state| state.total_elapsed)
    }

    fn has_entries(&self) -> bool {
        self.with_state(|state| !state.slots.is_empty())
    }

    fn execute_in_lock(&self, action: &mut dyn FnMut()) {
        let _lock = self.state.lock();
        action();
    }
}
