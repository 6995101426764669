use chrono::{DateTime, Duration, Utc};
use crate::engine_core::errors::{EngineError, EngineResult};

/// Engine clock.
///
/// Holds the current logical instant. Only moves forward: the tick driver
/// calls [`EngineClock::advance_to`] and a regression is rejected, so every
/// reader on the same timeline sees a monotonically advancing "now".
/// Live drivers feed wall-clock instants, backtests feed simulated ones.
pub struct EngineClock {
    cur: parking_lot::RwLock<DateTime<Utc>>,
}

impl EngineClock {
    /// Construct a new `EngineClock` starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self { Self { cur: parking_lot::RwLock::new(start) } }

    /// Move to `t`. Equal instants are accepted (repeated ticks).
    pub fn advance_to(&self, t: DateTime<Utc>) -> EngineResult<DateTime<Utc>> {
        let mut w = self.cur.write();
        if t < *w {
            return Err(EngineError::ClockRegression { now: t, current: *w });
        }
        *w = t;
        Ok(t)
    }

    /// Advance the clock forward by `d`.
    pub fn advance_by(&self, d: Duration) -> EngineResult<DateTime<Utc>> {
        let next = self.now() + d;
        self.advance_to(next)
    }

    #[inline]
    pub fn now(&self) -> DateTime<Utc> { *self.cur.read() }
}
