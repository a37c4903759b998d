//! Fire-time oracles.
//!
//! The manager never computes schedules itself: it asks a [`TriggerOracle`]
//! for the first fire time on submission and for the next one after every
//! round, then applies its misfire policy to the answer.

use std::fmt;
use std::time::{Duration, Instant};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Decides when a task runs.
pub trait TriggerOracle: Send + Sync {
    /// Next fire time after `last_fire_time` (`None` before the first run),
    /// or `None` when no further runs remain.
    fn next_fire_time(&self, last_fire_time: Option<Instant>, now: Instant) -> Option<Instant>;

    /// Time after which the trigger stops producing fire times.
    fn end_time(&self) -> Option<Instant> {
        None
    }

    /// Whether a round that misfired at `now` must be the last one.
    fn is_final_round(&self, now: Instant, end_time: Instant) -> bool {
        now >= end_time
    }

    /// Whether the trigger fires exactly once.
    fn is_single_execution(&self) -> bool {
        false
    }
}

/// Fires once, at a fixed instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OneShotTrigger {
    at: Instant,
}

impl OneShotTrigger {
    /// Fire as soon as submitted.
    #[must_use]
    pub fn now() -> Self {
        Self { at: Instant::now() }
    }

    /// Fire once `delay` has elapsed.
    #[must_use]
    pub fn after(delay: Duration) -> Self {
        Self {
            at: Instant::now() + delay,
        }
    }

    /// Fire at `at`.
    #[must_use]
    pub const fn at(at: Instant) -> Self {
        Self { at }
    }
}

impl TriggerOracle for OneShotTrigger {
    fn next_fire_time(&self, last_fire_time: Option<Instant>, _now: Instant) -> Option<Instant> {
        match last_fire_time {
            None => Some(self.at),
            Some(_) => None,
        }
    }

    fn is_single_execution(&self) -> bool {
        true
    }
}

/// Fires every `period` starting at `start`, optionally bounded by an end
/// time and a total run count.
///
/// Fire times stay on the `start + n * period` grid: the next fire time is
/// the first grid point after the previous one, so a late round does not
/// shift the rounds that follow it.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedRateTrigger {
    start: Instant,
    period: Duration,
    end: Option<Instant>,
    repeat_count: Option<u64>,
}

impl FixedRateTrigger {
    /// Smallest accepted period; shorter periods are raised to it.
    pub const MIN_PERIOD: Duration = Duration::from_millis(1);

    /// Create an unbounded trigger.
    #[must_use]
    pub fn new(start: Instant, period: Duration) -> Self {
        Self {
            start,
            period: period.max(Self::MIN_PERIOD),
            end: None,
            repeat_count: None,
        }
    }

    /// Unbounded trigger whose first fire time is now.
    #[must_use]
    pub fn starting_now(period: Duration) -> Self {
        Self::new(Instant::now(), period)
    }

    /// Produce no fire times after `end`.
    #[must_use]
    pub const fn with_end_time(mut self, end: Instant) -> Self {
        self.end = Some(end);
        self
    }

    /// Run at most `count` times in total.
    #[must_use]
    pub const fn with_repeat_count(mut self, count: u64) -> Self {
        self.repeat_count = Some(count);
        self
    }

    /// Configured period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    fn within_end(&self, candidate: Instant) -> bool {
        self.end.is_none_or(|end| candidate <= end)
    }
}

impl TriggerOracle for FixedRateTrigger {
    fn next_fire_time(&self, last_fire_time: Option<Instant>, _now: Instant) -> Option<Instant> {
        if self.repeat_count == Some(0) {
            return None;
        }
        let index = match last_fire_time {
            None => 0,
            Some(last) => last.saturating_duration_since(self.start).as_nanos() / self.period.as_nanos() + 1,
        };
        if self.repeat_count.is_some_and(|limit| index >= u128::from(limit)) {
            return None;
        }
        let offset = self.period.as_nanos().checked_mul(index)?;
        let secs = u64::try_from(offset / NANOS_PER_SEC).ok()?;
        let subsec = u32::try_from(offset % NANOS_PER_SEC).ok()?;
        let candidate = self.start.checked_add(Duration::new(secs, subsec))?;
        self.within_end(candidate).then_some(candidate)
    }

    fn end_time(&self) -> Option<Instant> {
        self.end
    }

    fn is_single_execution(&self) -> bool {
        self.repeat_count == Some(1)
    }
}

impl fmt::Debug for FixedRateTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedRateTrigger")
            .field("period", &self.period)
            .field("bounded_by_end", &self.end.is_some())
            .field("repeat_count", &self.repeat_count)
            .finish_non_exhaustive()
    }
}
