//! The clock of an emulated machine.
//!
//! [`MachineClock`] owns a [`HostTimeClockSource`] and forwards every
//! [`ClockSource`] call to whichever source is current. Two entries of its own
//! travel with the other entries when the source is switched:
//!
//! - the sync entry fires every sync unit, waits for the rest of the
//!   machine's synchronization domain and then runs due delayed tasks;
//! - the indicator entry counts virtual milliseconds and backs
//!   [`MachineClock::elapsed_virtual_time`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use vtime::units::TICKS_PER_SECOND;
use vtime::{
    ClockEntry, ClockResult, ClockSource, DummySynchronizationDomain, EntryFactory, EntryVisitor,
    Handler, HandlerId, HostTimeClockSource, SyncAction, SyncDomain, Synchronizer,
};

use crate::config::{MachineClockConfig, SyncUnitPolicy};
use crate::error::{MachineError, MachineResult};

/// Frequency of the virtual time indicator entry.
const INDICATOR_HZ: i64 = 1_000;

/// Tasks waiting for a sync point, ordered by due time then by submission.
#[derive(Default)]
struct DelayedTasks {
    queue: BTreeMap<(i64, u64), SyncAction>,
    next_id: u64,
    /// Virtual ticks covered by the sync points seen so far.
    synced_ticks: i64,
}

impl DelayedTasks {
    fn push(&mut self, delay: i64, action: SyncAction) {
        let due = self.synced_ticks.saturating_add(delay);
        self.queue.insert((due, self.next_id), action);
        self.next_id += 1;
    }

    fn take_due(&mut self) -> Vec<SyncAction> {
        let later = self.queue.split_off(&(self.synced_ticks.saturating_add(1), 0));
        core::mem::replace(&mut self.queue, later).into_values().collect()
    }
}

/// State reachable from the sync entry handler.
struct SyncPoint {
    name: String,
    synchronizer: Mutex<Arc<dyn Synchronizer>>,
    delayed: Mutex<DelayedTasks>,
    sync_unit: AtomicI64,
}

impl SyncPoint {
    fn synchronize(&self) {
        let synchronizer = Arc::clone(&*self.synchronizer.lock());
        if let Err(err) = synchronizer.sync() {
            trace!("{}: {err}", self.name);
        }
        let due = {
            let mut delayed = self.delayed.lock();
            delayed.synced_ticks += self.sync_unit.load(Ordering::Acquire);
            delayed.take_due()
        };
        // Tasks scheduled by these ones wait for the next sync point.
        for task in due {
            task();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    NotStarted,
    Started,
    Paused,
}

/// Switchable clock source of one emulated machine.
pub struct MachineClock {
    config: MachineClockConfig,
    host: Arc<HostTimeClockSource>,
    current: Mutex<Arc<dyn ClockSource>>,
    domain: Mutex<Arc<dyn SyncDomain>>,
    sync_point: Arc<SyncPoint>,
    sync_handler: HandlerId,
    indicator: HandlerId,
    state: Mutex<RunState>,
}

impl MachineClock {
    /// Creates a machine clock running on host time in a dummy domain.
    pub fn new(config: MachineClockConfig) -> MachineResult<Self> {
        if config.sync_unit <= 0 {
            return Err(MachineError::InvalidSyncUnit(config.sync_unit));
        }
        let host = Arc::new(HostTimeClockSource::with_config(config.host_clock.clone()));
        let domain: Arc<dyn SyncDomain> = Arc::new(DummySynchronizationDomain::new());
        let sync_point = Arc::new(SyncPoint {
            name: config.name.clone(),
            synchronizer: Mutex::new(domain.provide_synchronizer()),
            delayed: Mutex::new(DelayedTasks::default()),
            sync_unit: AtomicI64::new(config.sync_unit),
        });

        let sync_handler = {
            let sync_point = Arc::clone(&sync_point);
            Handler::new(move || sync_point.synchronize())
        };
        let indicator = Handler::marker();
        let (sync_id, indicator_id) = (sync_handler.id(), indicator.id());

        host.add_clock_entry(
            ClockEntry::builder(1, -config.sync_unit, sync_handler)
                .value(0)
                .build(),
        )?;
        let indicator_ratio = ClockEntry::frequency_to_ratio(INDICATOR_HZ)?.ratio;
        host.add_clock_entry(ClockEntry::new(
            i64::from(u32::MAX),
            indicator_ratio,
            indicator,
        ))?;

        let current: Arc<dyn ClockSource> = Arc::clone(&host) as Arc<dyn ClockSource>;
        debug!("{}: machine clock created", config.name);
        Ok(Self {
            config,
            host,
            current: Mutex::new(current),
            domain: Mutex::new(domain),
            sync_point,
            sync_handler: sync_id,
            indicator: indicator_id,
            state: Mutex::new(RunState::NotStarted),
        })
    }

    pub fn config(&self) -> &MachineClockConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The machine's own host time source, whether current or not.
    pub fn host_time_clock_source(&self) -> &Arc<HostTimeClockSource> {
        &self.host
    }

    pub fn clock_source(&self) -> Arc<dyn ClockSource> {
        Arc::clone(&*self.current.lock())
    }

    /// Makes `source` current, moving every entry over from the previous one.
    ///
    /// The switch is not atomic with respect to a concurrently advancing
    /// source: entries are looked up on `source` as soon as it becomes
    /// current, before they have been moved.
    pub fn set_clock_source(&self, source: Arc<dyn ClockSource>) -> MachineResult<()> {
        if source.is_host_driven() && !self.domain.lock().is_dummy() {
            return Err(MachineError::HostClockInSyncDomain);
        }
        // Never hold `current` while locking a source: handlers running on an
        // advancing source forward through `current` too.
        let previous = core::mem::replace(&mut *self.current.lock(), Arc::clone(&source));
        let entries = previous.eject_clock_entries();
        debug!("{}: moving {} clock entries to a new source", self.config.name, entries.len());
        source.add_clock_entries(entries)?;
        Ok(())
    }

    pub fn use_host_time_clock_source(&self) -> MachineResult<()> {
        self.set_clock_source(Arc::clone(&self.host) as Arc<dyn ClockSource>)
    }

    pub fn sync_domain(&self) -> Arc<dyn SyncDomain> {
        Arc::clone(&*self.domain.lock())
    }

    /// Leaves the current domain and joins `domain`.
    pub fn set_sync_domain(&self, domain: Arc<dyn SyncDomain>) -> MachineResult<()> {
        if !domain.is_dummy() && self.is_host_driven() {
            return Err(MachineError::SyncDomainWithHostClock);
        }
        let paused = self.is_paused();
        let mut current = self.domain.lock();
        let mut synchronizer = self.sync_point.synchronizer.lock();
        synchronizer.exit();
        *synchronizer = domain.provide_synchronizer();
        if paused {
            synchronizer.cancel_sync();
        }
        *current = domain;
        debug!("{}: joined a new synchronization domain", self.config.name);
        Ok(())
    }

    /// Ticks between two synchronization points.
    pub fn sync_unit(&self) -> MachineResult<i64> {
        Ok(-self.get_clock_entry(self.sync_handler)?.ratio())
    }

    pub fn set_sync_unit(&self, ticks: i64) -> MachineResult<()> {
        if ticks <= 0 {
            return Err(MachineError::InvalidSyncUnit(ticks));
        }
        self.exchange_clock_entry_with(self.sync_handler, &mut |entry| entry.with_ratio(-ticks), None)?;
        self.sync_point.sync_unit.store(ticks, Ordering::Release);
        Ok(())
    }

    /// Runs `action` at the first sync point at least `delay` ticks from now.
    pub fn execute_in<F>(&self, action: F, delay: i64) -> MachineResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_host_driven() {
            return Err(MachineError::HostDriven);
        }
        self.sync_point.delayed.lock().push(delay.max(0), Box::new(action));
        Ok(())
    }

    /// Virtual time elapsed with millisecond resolution.
    pub fn elapsed_virtual_time(&self) -> MachineResult<Duration> {
        let millis = self.get_clock_entry(self.indicator)?.value();
        Ok(Duration::from_millis(u64::try_from(millis).unwrap_or(0)))
    }

    pub fn is_paused(&self) -> bool {
        *self.state.lock() == RunState::Paused
    }

    pub fn start(&self) {
        let mut state = self.state.lock();
        match *state {
            RunState::Started => return,
            RunState::NotStarted => self.host.start(),
            RunState::Paused => {
                self.sync_point.synchronizer.lock().restore_sync();
                self.host.resume();
            }
        }
        *state = RunState::Started;
        info!("{}: started", self.config.name);
    }

    /// Releases a pending sync and stops host time.
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if *state != RunState::Started {
            return;
        }
        self.sync_point.synchronizer.lock().cancel_sync();
        self.host.pause();
        *state = RunState::Paused;
        info!("{}: paused", self.config.name);
    }

    /// Checks that a device ticking at `frequency` Hz can be served between
    /// two sync points, applying the configured [`SyncUnitPolicy`] if not.
    pub fn check_frequency(&self, owner: &str, frequency: i64) -> MachineResult<()> {
        if frequency <= 0 {
            return Err(vtime::ClockError::InvalidFrequency(frequency).into());
        }
        let sync_unit = self.sync_unit()?;
        let maximal_frequency = TICKS_PER_SECOND / sync_unit;
        if maximal_frequency >= frequency {
            return Ok(());
        }
        match self.config.sync_unit_policy {
            SyncUnitPolicy::ShowWarning => {
                warn!(
                    "{}: desired frequency of '{owner}' is {frequency}Hz while maximal allowed by current sync unit is {maximal_frequency}Hz",
                    self.config.name
                );
                Ok(())
            }
            SyncUnitPolicy::Adjust => {
                let mut desired = TICKS_PER_SECOND / frequency;
                if desired == 0 {
                    desired = 1;
                    warn!(
                        "{}: desired frequency of '{owner}' is {frequency}Hz which is unattainable even with sync unit = 1",
                        self.config.name
                    );
                } else {
                    info!(
                        "{}: setting sync unit to {desired} due to frequency {frequency}Hz of '{owner}'",
                        self.config.name
                    );
                }
                self.set_sync_unit(desired)
            }
        }
    }
}

impl Drop for MachineClock {
    fn drop(&mut self) {
        self.sync_point.synchronizer.lock().exit();
    }
}

impl ClockSource for MachineClock {
    fn add_clock_entry(&self, entry: ClockEntry) -> ClockResult<()> {
        self.clock_source().add_clock_entry(entry)
    }

    fn get_clock_entry(&self, handler: HandlerId) -> ClockResult<ClockEntry> {
        self.clock_source().get_clock_entry(handler)
    }

    fn get_clock_entry_in_lock(
        &self,
        handler: HandlerId,
        visitor: &mut dyn FnMut(&ClockEntry),
    ) -> ClockResult<()> {
        self.clock_source().get_clock_entry_in_lock(handler, visitor)
    }

    fn get_all_clock_entries(&self) -> Vec<ClockEntry> {
        self.clock_source().get_all_clock_entries()
    }

    fn exchange_clock_entry_with(
        &self,
        handler: HandlerId,
        visitor: EntryVisitor<'_>,
        factory_if_absent: Option<EntryFactory<'_>>,
    ) -> ClockResult<()> {
        self.clock_source()
            .exchange_clock_entry_with(handler, visitor, factory_if_absent)
    }

    fn remove_clock_entry(&self, handler: HandlerId) -> bool {
        self.clock_source().remove_clock_entry(handler)
    }

    fn eject_clock_entries(&self) -> Vec<ClockEntry> {
        self.clock_source().eject_clock_entries()
    }

    fn add_clock_entries(&self, entries: Vec<ClockEntry>) -> ClockResult<()> {
        self.clock_source().add_clock_entries(entries)
    }

    fn current_value(&self) -> i64 {
        self.clock_source().current_value()
    }

    fn has_entries(&self) -> bool {
        self.clock_source().has_entries()
    }

    fn execute_in_lock(&self, action: &mut dyn FnMut()) {
        self.clock_source().execute_in_lock(action);
    }

    fn is_host_driven(&self) -> bool {
        self.clock_source().is_host_driven()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_tasks_run_in_due_then_submission_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = DelayedTasks::default();
        for (label, delay) in [("late", 20), ("first", 5), ("second", 5), ("now", 0)] {
            let order = Arc::clone(&order);
            tasks.push(delay, Box::new(move || order.lock().push(label)));
        }

        tasks.synced_ticks = 10;
        for task in tasks.take_due() {
            task();
        }
        assert_eq!(*order.lock(), vec!["now", "first", "second"]);

        tasks.synced_ticks = 20;
        for task in tasks.take_due() {
            task();
        }
        assert_eq!(order.lock().last(), Some(&"late"));
        assert!(tasks.queue.is_empty());
    }

    #[test]
    fn new_machine_runs_on_host_time() {
        let clock = MachineClock::new(MachineClockConfig::default()).unwrap();

        assert!(clock.is_host_driven());
        assert_eq!(clock.sync_unit().unwrap(), crate::DEFAULT_SYNC_UNIT);
        assert_eq!(clock.get_all_clock_entries().len(), 2);
        assert!(clock.sync_domain().is_dummy());
        assert_eq!(
            clock.execute_in(|| {}, 10),
            Err(MachineError::HostDriven)
        );
    }

    #[test]
    fn rejects_non_positive_sync_unit() {
        let config = MachineClockConfig::builder().sync_unit(0).build();
        assert_eq!(
            MachineClock::new(config).err(),
            Some(MachineError::InvalidSyncUnit(0))
        );
    }
}
