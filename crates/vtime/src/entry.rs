//! Clock entries: the value type describing a single virtual timer.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;

use crate::error::{ClockError, ClockResult};
use crate::sync::Arc;
use crate::units::MAX_HZ;

/// Relative error above which a frequency conversion is reported.
const FREQUENCY_ERROR_THRESHOLD: f64 = 0.1;

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a registered handler, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type HandlerFn = dyn Fn() + Send + Sync;

/// Action invoked when a clock entry fires, keyed by a generated [`HandlerId`].
///
/// Clones share both the action and the identity; two handlers built from the
/// same closure are still distinct.
#[derive(Clone)]
pub struct Handler {
    id: HandlerId,
    action: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F>(action: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            id: HandlerId::next(),
            action: Arc::new(action),
        }
    }

    /// Handler that does nothing; useful as a pure identity key.
    pub fn marker() -> Self {
        Self::new(|| {})
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn invoke(&self) {
        (self.action)();
    }
}

impl PartialEq for Handler {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Handler {}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handler").field(&self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WorkMode {
    #[default]
    Periodic,
    OneShot,
}

/// A virtual timer registered with a clock source.
///
/// `ratio` relates global ticks to entry ticks: when positive one global tick
/// advances the entry by `ratio`, when negative `-ratio` global ticks are
/// needed for one entry tick and the remainder is kept in `value_residuum`.
#[derive(Debug, Clone)]
pub struct ClockEntry {
    pub(crate) period: i64,
    pub(crate) ratio: i64,
    pub(crate) value: i64,
    pub(crate) value_residuum: i64,
    pub(crate) direction: Direction,
    pub(crate) work_mode: WorkMode,
    pub(crate) enabled: bool,
    pub(crate) handler: Handler,
}

impl ClockEntry {
    /// Enabled, ascending, periodic entry starting at zero.
    pub fn new(period: i64, ratio: i64, handler: Handler) -> Self {
        Self::builder(period, ratio, handler).build()
    }

    pub fn builder(period: i64, ratio: i64, handler: Handler) -> ClockEntryBuilder {
        ClockEntryBuilder::new(period, ratio, handler)
    }

    pub fn period(&self) -> i64 {
        self.period
    }

    pub fn ratio(&self) -> i64 {
        self.ratio
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn value_residuum(&self) -> i64 {
        self.value_residuum
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn work_mode(&self) -> WorkMode {
        self.work_mode
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn handler_id(&self) -> HandlerId {
        self.handler.id
    }

    pub fn with_period(mut self, period: i64) -> Self {
        self.period = period;
        self
    }

    pub fn with_ratio(mut self, ratio: i64) -> Self {
        self.ratio = ratio;
        self
    }

    pub fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Changes the counting direction without touching the current value.
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_work_mode(mut self, work_mode: WorkMode) -> Self {
        self.work_mode = work_mode;
        self
    }

    /// Frequency of entry ticks in Hz.
    pub fn frequency(&self) -> f64 {
        if self.ratio > 0 {
            MAX_HZ as f64 * self.ratio as f64
        } else {
            -(MAX_HZ as f64) / self.ratio as f64
        }
    }

    /// Picks the ratio whose frequency is closest to `desired_hz`.
    pub fn frequency_to_ratio(desired_hz: i64) -> ClockResult<FrequencyRatio> {
        if desired_hz <= 0 {
            return Err(ClockError::InvalidFrequency(desired_hz));
        }
        let max_hz = MAX_HZ as f64;
        let desired = desired_hz as f64;
        // Below the tick rate the ratio is negative, matching the meaning of
        // a slower-than-global entry.
        let (ratio, actual) = if desired_hz > MAX_HZ {
            let ratio = (desired / max_hz).round() as i64;
            (ratio, ratio as f64 * max_hz)
        } else {
            let ratio = (-max_hz / desired).round() as i64;
            (ratio, max_hz / -ratio as f64)
        };
        let conversion = FrequencyRatio {
            ratio,
            relative_error: ((actual - desired) / desired).abs(),
        };
        if conversion.is_significant_loss() {
            warn!(
                "set frequency differs from intended {desired_hz}Hz by {:.2}%",
                conversion.relative_error * 100.0
            );
        }
        Ok(conversion)
    }

    pub(crate) fn validate(&self) -> ClockResult<()> {
        if self.period <= 0 {
            return Err(ClockError::InvalidEntry("period must be positive"));
        }
        if self.ratio == 0 {
            return Err(ClockError::InvalidEntry("ratio cannot be zero"));
        }
        Ok(())
    }
}

/// Result of converting a frequency to an entry ratio.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyRatio {
    pub ratio: i64,
    pub relative_error: f64,
}

impl FrequencyRatio {
    pub fn is_significant_loss(&self) -> bool {
        self.relative_error > FREQUENCY_ERROR_THRESHOLD
    }
}

/// Builder for entries that need a non-default direction, mode or state.
#[derive(Debug, Clone)]
pub struct ClockEntryBuilder {
    period: i64,
    ratio: i64,
    handler: Handler,
    enabled: bool,
    direction: Direction,
    work_mode: WorkMode,
    value: Option<i64>,
}

impl ClockEntryBuilder {
    fn new(period: i64, ratio: i64, handler: Handler) -> Self {
        Self {
            period,
            ratio,
            handler,
            enabled: true,
            direction: Direction::Ascending,
            work_mode: WorkMode::Periodic,
            value: None,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn work_mode(mut self, work_mode: WorkMode) -> Self {
        self.work_mode = work_mode;
        self
    }

    /// Overrides the starting value (zero when ascending, `period` otherwise).
    pub fn value(mut self, value: i64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn build(self) -> ClockEntry {
        let value = self.value.unwrap_or(match self.direction {
            Direction::Ascending => 0,
            Direction::Descending => self.period,
        });
        ClockEntry {
            period: self.period,
            ratio: self.ratio,
            value,
            value_residuum: 0,
            direction: self.direction,
            work_mode: self.work_mode,
            enabled: self.enabled,
            handler: self.handler,
        }
    }
}
