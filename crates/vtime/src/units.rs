//! Conversions between virtual ticks, wall-clock durations and frequencies.
//!
//! One tick is one time quantum of one microsecond.

use std::time::Duration;

use log::warn;

use crate::error::{ClockError, ClockResult};

/// Number of virtual ticks in one second.
pub const TICKS_PER_SECOND: i64 = 1_000_000;

/// Wall-clock length of a single tick.
pub const TIME_QUANTUM: Duration = Duration::from_micros(1);

/// Highest frequency a clock entry with ratio 1 can express.
pub const MAX_HZ: i64 = TICKS_PER_SECOND;

/// Relative error above which [`hz_to_ticks_safe`] complains.
const MAXIMAL_DIFFERENCE: f64 = 0.33;

pub fn seconds_to_ticks(seconds: f64) -> i64 {
    (seconds * TICKS_PER_SECOND as f64).round() as i64
}

/// Whole seconds contained in `ticks`, truncated.
pub fn ticks_to_seconds(ticks: i64) -> i64 {
    ticks / TICKS_PER_SECOND
}

pub fn ticks_to_duration(ticks: i64) -> Duration {
    let quantum_nanos = TIME_QUANTUM.as_nanos() as u64;
    Duration::from_nanos((ticks.max(0) as u64).saturating_mul(quantum_nanos))
}

/// Converts a wall-clock duration to ticks, saturating at `i64::MAX`.
pub fn duration_to_ticks(duration: Duration) -> i64 {
    let ticks = duration.as_nanos() / TIME_QUANTUM.as_nanos();
    i64::try_from(ticks).unwrap_or(i64::MAX)
}

/// Frequency of an event that happens every `ticks` ticks.
///
/// Zero ticks saturates to `i64::MAX`.
pub fn ticks_to_hz(ticks: i64) -> i64 {
    (TICKS_PER_SECOND as f64 / ticks as f64).round() as i64
}

pub fn hz_to_ticks(hz: i64) -> f64 {
    TICKS_PER_SECOND as f64 / hz as f64
}

/// Rounds the tick period of `hz` to a whole number of ticks, never zero.
///
/// Logs a warning when the rounded period no longer represents the requested
/// frequency within a third of its value.
pub fn hz_to_ticks_safe(hz: i64) -> ClockResult<i64> {
    if hz <= 0 {
        return Err(ClockError::InvalidFrequency(hz));
    }
    let ticks = (hz_to_ticks(hz).round() as i64).max(1);
    let again_in_hz = ticks_to_hz(ticks);
    if (again_in_hz - hz).abs() as f64 / hz as f64 > MAXIMAL_DIFFERENCE {
        warn!("significant difference between desired and actual frequency: {hz}Hz vs {again_in_hz}Hz");
    }
    Ok(ticks)
}
