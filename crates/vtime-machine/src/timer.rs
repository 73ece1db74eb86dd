//! General purpose limit timer.
//!
//! The timer counts towards a limit at `frequency / divider` Hz using a single
//! clock entry whose period is the limit. Reaching the limit raises the raw
//! interrupt and, when events are enabled, calls the limit-reached hook.

use std::sync::Arc;

use parking_lot::Mutex;
use vtime::{ClockEntry, ClockSource, Direction, EntryFactory, Handler, HandlerId, WorkMode};

use crate::error::{MachineError, MachineResult};

/// Callback run on the advancing thread whenever the limit is reached.
pub type LimitReachedHook = Arc<dyn Fn() + Send + Sync>;

/// Initial configuration, restored by [`LimitTimer::reset`].
#[derive(Debug, Clone)]
pub struct LimitTimerConfig {
    pub frequency: i64,
    pub limit: i64,
    pub direction: Direction,
    pub enabled: bool,
    pub work_mode: WorkMode,
    pub event_enabled: bool,
    pub auto_update: bool,
    pub divider: i64,
}

impl LimitTimerConfig {
    pub fn new(frequency: i64) -> Self {
        Self {
            frequency,
            limit: i64::from(i32::MAX),
            direction: Direction::Descending,
            enabled: false,
            work_mode: WorkMode::Periodic,
            event_enabled: false,
            auto_update: false,
            divider: 1,
        }
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn work_mode(mut self, work_mode: WorkMode) -> Self {
        self.work_mode = work_mode;
        self
    }

    pub fn event_enabled(mut self, event_enabled: bool) -> Self {
        self.event_enabled = event_enabled;
        self
    }

    pub fn auto_update(mut self, auto_update: bool) -> Self {
        self.auto_update = auto_update;
        self
    }

    pub fn divider(mut self, divider: i64) -> Self {
        self.divider = divider;
        self
    }
}

#[derive(Default)]
struct Irq {
    event_enabled: bool,
    raw_interrupt: bool,
    hook: Option<LimitReachedHook>,
}

impl Irq {
    fn limit_reached(irq: &Mutex<Irq>) {
        let hook = {
            let mut irq = irq.lock();
            irq.raw_interrupt = true;
            if !irq.event_enabled {
                return;
            }
            irq.hook.clone()
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}

struct Rate {
    frequency: i64,
    divider: i64,
    auto_update: bool,
}

pub struct LimitTimer {
    clock: Arc<dyn ClockSource>,
    handler: Handler,
    initial: LimitTimerConfig,
    rate: Mutex<Rate>,
    irq: Arc<Mutex<Irq>>,
}

impl LimitTimer {
    pub fn new(clock: Arc<dyn ClockSource>, config: LimitTimerConfig) -> MachineResult<Self> {
        if config.limit == 0 {
            return Err(MachineError::ZeroLimit);
        }
        if config.divider == 0 {
            return Err(MachineError::ZeroDivider);
        }
        let irq = Arc::new(Mutex::new(Irq::default()));
        let handler = {
            let irq = Arc::clone(&irq);
            Handler::new(move || Irq::limit_reached(&irq))
        };
        let timer = Self {
            clock,
            handler,
            rate: Mutex::new(Rate {
                frequency: config.frequency,
                divider: config.divider,
                auto_update: config.auto_update,
            }),
            initial: config,
            irq,
        };
        timer.reset()?;
        Ok(timer)
    }

    fn id(&self) -> HandlerId {
        self.handler.id()
    }

    fn entry(&self) -> MachineResult<ClockEntry> {
        Ok(self.clock.get_clock_entry(self.id())?)
    }

    fn exchange(&self, visitor: &mut dyn FnMut(ClockEntry) -> ClockEntry) -> MachineResult<()> {
        Ok(self.clock.exchange_clock_entry_with(self.id(), visitor, None)?)
    }

    fn ratio_for(frequency: i64, divider: i64) -> MachineResult<i64> {
        Ok(ClockEntry::frequency_to_ratio(frequency / divider)?.ratio)
    }

    /// Restores the initial configuration and clears the interrupt.
    pub fn reset(&self) -> MachineResult<()> {
        let initial = &self.initial;
        let ratio = Self::ratio_for(initial.frequency, initial.divider)?;
        let entry = ClockEntry::builder(initial.limit, ratio, self.handler.clone())
            .enabled(initial.enabled)
            .direction(initial.direction)
            .work_mode(initial.work_mode)
            .build();
        {
            let mut rate = self.rate.lock();
            rate.frequency = initial.frequency;
            rate.divider = initial.divider;
            rate.auto_update = initial.auto_update;
        }
        let factory: EntryFactory<'_> = &mut || entry.clone();
        self.clock
            .exchange_clock_entry_with(self.id(), &mut |_| entry.clone(), Some(factory))?;
        let mut irq = self.irq.lock();
        irq.event_enabled = initial.event_enabled;
        irq.raw_interrupt = false;
        Ok(())
    }

    /// Current counter value and limit, read atomically.
    pub fn value_and_limit(&self) -> MachineResult<(i64, i64)> {
        let entry = self.entry()?;
        Ok((entry.value(), entry.period()))
    }

    pub fn frequency(&self) -> i64 {
        self.rate.lock().frequency
    }

    pub fn set_frequency(&self, frequency: i64) -> MachineResult<()> {
        let divider = self.rate.lock().divider;
        let ratio = Self::ratio_for(frequency, divider)?;
        self.rate.lock().frequency = frequency;
        self.exchange(&mut |entry| entry.with_ratio(ratio))
    }

    pub fn divider(&self) -> i64 {
        self.rate.lock().divider
    }

    pub fn set_divider(&self, divider: i64) -> MachineResult<()> {
        if divider == 0 {
            return Err(MachineError::ZeroDivider);
        }
        let frequency = {
            let rate = self.rate.lock();
            if rate.divider == divider {
                return Ok(());
            }
            rate.frequency
        };
        let ratio = Self::ratio_for(frequency, divider)?;
        self.rate.lock().divider = divider;
        self.exchange(&mut |entry| entry.with_ratio(ratio))
    }

    pub fn value(&self) -> MachineResult<i64> {
        Ok(self.entry()?.value())
    }

    pub fn set_value(&self, value: i64) -> MachineResult<()> {
        self.exchange(&mut |entry| entry.with_value(value))
    }

    pub fn limit(&self) -> MachineResult<i64> {
        Ok(self.entry()?.period())
    }

    /// Changes the limit; with auto-update the counter restarts as well,
    /// otherwise it is clamped to the new limit.
    pub fn set_limit(&self, limit: i64) -> MachineResult<()> {
        if limit == 0 {
            return Err(MachineError::ZeroLimit);
        }
        let auto_update = self.auto_update();
        self.exchange(&mut |entry| {
            let value = match (auto_update, entry.direction()) {
                (true, Direction::Ascending) => 0,
                (true, Direction::Descending) => limit,
                (false, _) => entry.value().min(limit),
            };
            entry.with_period(limit).with_value(value)
        })
    }

    pub fn auto_update(&self) -> bool {
        self.rate.lock().auto_update
    }

    pub fn set_auto_update(&self, auto_update: bool) {
        self.rate.lock().auto_update = auto_update;
    }

    pub fn enabled(&self) -> MachineResult<bool> {
        Ok(self.entry()?.enabled())
    }

    pub fn set_enabled(&self, enabled: bool) -> MachineResult<()> {
        self.exchange(&mut |entry| entry.with_enabled(enabled))
    }

    pub fn mode(&self) -> MachineResult<WorkMode> {
        Ok(self.entry()?.work_mode())
    }

    pub fn set_mode(&self, mode: WorkMode) -> MachineResult<()> {
        self.exchange(&mut |entry| entry.with_work_mode(mode))
    }

    pub fn direction(&self) -> MachineResult<Direction> {
        Ok(self.entry()?.direction())
    }

    pub fn set_direction(&self, direction: Direction) -> MachineResult<()> {
        self.exchange(&mut |entry| entry.with_direction(direction))
    }

    /// Moves the counter back to its starting point for the current direction.
    pub fn reset_value(&self) -> MachineResult<()> {
        self.exchange(&mut |entry| {
            let start = match entry.direction() {
                Direction::Ascending => 0,
                Direction::Descending => entry.period(),
            };
            entry.with_value(start)
        })
    }

    pub fn event_enabled(&self) -> bool {
        self.irq.lock().event_enabled
    }

    pub fn set_event_enabled(&self, enabled: bool) {
        self.irq.lock().event_enabled = enabled;
    }

    /// Raw interrupt masked by the event enable bit.
    pub fn interrupt(&self) -> bool {
        let irq = self.irq.lock();
        irq.raw_interrupt && irq.event_enabled
    }

    pub fn raw_interrupt(&self) -> bool {
        self.irq.lock().raw_interrupt
    }

    pub fn clear_interrupt(&self) {
        self.irq.lock().raw_interrupt = false;
    }

    pub fn set_limit_reached_hook(&self, hook: Option<LimitReachedHook>) {
        self.irq.lock().hook = hook;
    }
}

impl Drop for LimitTimer {
    fn drop(&mut self) {
        self.clock.remove_clock_entry(self.id());
    }
}
