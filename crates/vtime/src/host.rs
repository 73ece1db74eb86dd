//! Clock source driven by host wall-clock time.
//!
//! A dedicated driver thread sleeps until the nearest entry is due (bounded by
//! [`HostClockConfig::max_wait_ticks`]) and then advances the underlying
//! [`BaseClockSource`] by the number of quanta that elapsed on the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error};

use crate::base::BaseClockSource;
use crate::entry::{ClockEntry, HandlerId};
use crate::error::ClockResult;
use crate::source::{ClockSource, EntriesChangedHook, EntryFactory, EntryVisitor};
use crate::sync::{Arc, Mutex, Signal};
use crate::units::{duration_to_ticks, ticks_to_duration, TICKS_PER_SECOND};

/// Configuration of a [`HostTimeClockSource`].
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HostClockConfig {
    /// Upper bound of a single driver sleep, in ticks.
    pub max_wait_ticks: i64,
    pub thread_name: String,
}

impl Default for HostClockConfig {
    fn default() -> Self {
        Self {
            max_wait_ticks: 10 * TICKS_PER_SECOND,
            thread_name: String::from("HostTimeClockSource"),
        }
    }
}

impl HostClockConfig {
    pub fn builder() -> HostClockConfigBuilder {
        HostClockConfigBuilder::default()
    }
}

/// Builder for [`HostClockConfig`].
#[derive(Debug, Clone, Default)]
pub struct HostClockConfigBuilder {
    config: HostClockConfig,
}

impl HostClockConfigBuilder {
    /// Sets the longest time the driver sleeps before re-checking entries.
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.config.max_wait_ticks = duration_to_ticks(wait).max(1);
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    pub fn build(self) -> HostClockConfig {
        self.config
    }
}

/// Pausable measure of host time.
#[derive(Debug, Default)]
struct Stopwatch {
    started_at: Option<Instant>,
    accumulated: Duration,
}

impl Stopwatch {
    fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    fn stop(&mut self) {
        if let Some(started_at) = self.started_at.take() {
            self.accumulated += started_at.elapsed();
        }
    }

    fn reset(&mut self) {
        self.started_at = None;
        self.accumulated = Duration::ZERO;
    }

    fn elapsed(&self) -> Duration {
        self.accumulated + self.started_at.map_or(Duration::ZERO, |at| at.elapsed())
    }
}

struct Progress {
    stopwatch: Stopwatch,
    /// Host ticks already turned into virtual time since the last pause.
    last_value: i64,
}

struct Driver {
    cancel: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Driver {
    fn stop(self, wake: &Signal) {
        self.cancel.store(true, Ordering::Release);
        wake.notify();
        // A handler running on the driver thread may stop its own driver.
        if self.handle.thread().id() == thread::current().id() {
            return;
        }
        if self.handle.join().is_err() {
            error!("host clock driver thread panicked");
        }
    }
}

struct Control {
    paused: bool,
    driver: Option<Driver>,
}

struct HostInner {
    base: BaseClockSource,
    config: HostClockConfig,
    quick_progress: Signal,
    /// Serializes whole `pause`/`resume` calls, host time bookkeeping included.
    start_stop: Mutex<()>,
    control: Mutex<Control>,
    progress: Mutex<Progress>,
}

impl HostInner {
    fn quickly_restart(&self) {
        self.quick_progress.notify();
    }

    /// Starts or stops the driver so that it runs exactly when not paused and
    /// at least one entry is registered.
    fn check_thread(self: &Arc<Self>) {
        let stale = {
            let mut control = self.control.lock();
            let to_be_started = !control.paused && self.base.has_entries();
            match (control.driver.is_some(), to_be_started) {
                (false, true) => {
                    control.driver = self.spawn_driver();
                    None
                }
                (true, false) => control.driver.take(),
                _ => None,
            }
        };
        if let Some(driver) = stale {
            debug!("{}: stopping driver", self.config.thread_name);
            driver.stop(&self.quick_progress);
        }
    }

    fn spawn_driver(self: &Arc<Self>) -> Option<Driver> {
        let cancel = Arc::new(AtomicBool::new(false));
        let inner = Arc::clone(self);
        let token = Arc::clone(&cancel);
        let spawned = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || inner.drive(&token));
        match spawned {
            Ok(handle) => {
                debug!("{}: driver started", self.config.thread_name);
                Some(Driver { cancel, handle })
            }
            Err(err) => {
                error!("{}: cannot spawn driver: {err}", self.config.thread_name);
                None
            }
        }
    }

    fn drive(&self, cancel: &AtomicBool) {
        while !cancel.load(Ordering::Acquire) {
            let wait = self.base.nearest_tick_in().clamp(1, self.config.max_wait_ticks);
            self.quick_progress.wait(ticks_to_duration(wait));
            let difference = {
                let mut progress = self.progress.lock();
                let current = duration_to_ticks(progress.stopwatch.elapsed());
                let difference = current - progress.last_value;
                progress.last_value = current;
                difference
            };
            if difference > 0 {
                if let Err(err) = self.base.advance(difference, false) {
                    error!("{}: advance failed: {err}", self.config.thread_name);
                }
            }
        }
    }
}

/// [`BaseClockSource`] advanced by a background thread following host time.
///
/// Created paused: virtual time only starts flowing after [`start`](Self::start).
pub struct HostTimeClockSource {
    inner: Arc<HostInner>,
}

impl Default for HostTimeClockSource {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTimeClockSource {
    pub fn new() -> Self {
        Self::with_config(HostClockConfig::default())
    }

    pub fn with_config(config: HostClockConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                base: BaseClockSource::new(),
                config,
                quick_progress: Signal::new(),
                start_stop: Mutex::new(()),
                control: Mutex::new(Control {
                    paused: true,
                    driver: None,
                }),
                progress: Mutex::new(Progress {
                    stopwatch: Stopwatch::default(),
                    last_value: 0,
                }),
            }),
        }
    }

    pub fn config(&self) -> &HostClockConfig {
        &self.inner.config
    }

    pub fn start(&self) {
        self.resume();
    }

    pub fn resume(&self) {
        let _start_stop = self.inner.start_stop.lock();
        {
            let mut control = self.inner.control.lock();
            control.paused = false;
            self.inner.progress.lock().stopwatch.start();
        }
        self.inner.check_thread();
    }

    /// Stops the flow of virtual time and waits for the driver to finish.
    ///
    /// Host time spent paused is never caught up after [`resume`](Self::resume).
    /// Must not be called from a handler of this source.
    pub fn pause(&self) {
        let _start_stop = self.inner.start_stop.lock();
        {
            let mut control = self.inner.control.lock();
            control.paused = true;
            self.inner.progress.lock().stopwatch.stop();
        }
        self.inner.check_thread();
        let mut progress = self.inner.progress.lock();
        progress.last_value = 0;
        progress.stopwatch.reset();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.control.lock().paused
    }

    /// Whether the driver thread is currently alive.
    pub fn is_running(&self) -> bool {
        self.inner.control.lock().driver.is_some()
    }

    pub fn nearest_tick_in(&self) -> i64 {
        self.inner.base.nearest_tick_in()
    }

    pub fn set_entries_changed_hook(&self, hook: Option<EntriesChangedHook>) {
        self.inner.base.set_entries_changed_hook(hook);
    }
}

impl Drop for HostTimeClockSource {
    fn drop(&mut self) {
        let driver = self.inner.control.lock().driver.take();
        if let Some(driver) = driver {
            driver.stop(&self.inner.quick_progress);
        }
    }
}

impl ClockSource for HostTimeClockSource {
    fn add_clock_entry(&self, entry: ClockEntry) -> ClockResult<()> {
        self.inner.base.add_clock_entry(entry)?;
        self.inner.quickly_restart();
        self.inner.check_thread();
        Ok(())
    }

    fn get_clock_entry(&self, handler: HandlerId) -> ClockResult<ClockEntry> {
        self.inner.quickly_restart();
        self.inner.base.get_clock_entry(handler)
    }

    fn get_clock_entry_in_lock(
        &self,
        handler: HandlerId,
        visitor: &mut dyn FnMut(&ClockEntry),
    ) -> ClockResult<()> {
        self.inner.base.get_clock_entry_in_lock(handler, visitor)
    }

    fn get_all_clock_entries(&self) -> Vec<ClockEntry> {
        self.inner.base.get_all_clock_entries()
    }

    fn exchange_clock_entry_with(
        &self,
        handler: HandlerId,
        visitor: EntryVisitor<'_>,
        factory_if_absent: Option<EntryFactory<'_>>,
    ) -> ClockResult<()> {
        let result = self
            .inner
            .base
            .exchange_clock_entry_with(handler, visitor, factory_if_absent);
        self.inner.quickly_restart();
        self.inner.check_thread();
        result
    }

    fn remove_clock_entry(&self, handler: HandlerId) -> bool {
        let removed = self.inner.base.remove_clock_entry(handler);
        self.inner.quickly_restart();
        self.inner.check_thread();
        removed
    }

    fn eject_clock_entries(&self) -> Vec<ClockEntry> {
        let entries = self.inner.base.eject_clock_entries();
        self.inner.check_thread();
        entries
    }

    fn add_clock_entries(&self, entries: Vec<ClockEntry>) -> ClockResult<()> {
        let result = self.inner.base.add_clock_entries(entries);
        self.inner.quickly_restart();
        self.inner.check_thread();
        result
    }

    fn current_value(&self) -> i64 {
        self.inner.base.current_value()
    }

    fn has_entries(&self) -> bool {
        self.inner.base.has_entries()
    }

    fn execute_in_lock(&self, action: &mut dyn FnMut()) {
        self.inner.base.execute_in_lock(action);
    }

    fn is_host_driven(&self) -> bool {
        true
    }
}
