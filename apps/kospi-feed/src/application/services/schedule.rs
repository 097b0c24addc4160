//! Daily session transition triggers.

use chrono::{Days, NaiveDateTime, NaiveTime};

/// Default trigger times: shortly before the day and night sessions open.
pub const DEFAULT_TRIGGER_TIMES: [(u32, u32); 2] = [(8, 40), (17, 55)];

/// Exchange-local times of day at which the supervisor re-evaluates the
/// session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionSchedule {
    times: Vec<NaiveTime>,
}

impl Default for TransitionSchedule {
    fn default() -> Self {
        Self::new(
            DEFAULT_TRIGGER_TIMES
                .iter()
                .filter_map(|&(h, m)| NaiveTime::from_hms_opt(h, m, 0)),
        )
    }
}

impl TransitionSchedule {
    /// Build a schedule. Times are sorted and deduplicated.
    pub fn new(times: impl IntoIterator<Item = NaiveTime>) -> Self {
        let mut times: Vec<NaiveTime> = times.into_iter().collect();
        times.sort_unstable();
        times.dedup();
        Self { times }
    }

    /// Trigger times in order.
    #[must_use]
    pub fn times(&self) -> &[NaiveTime] {
        &self.times
    }

    /// First trigger strictly after `local`.
    ///
    /// Returns `None` for an empty schedule.
    #[must_use]
    pub fn next_trigger_after(&self, local: NaiveDateTime) -> Option<NaiveDateTime> {
        let today = local.date();
        if let Some(time) = self.times.iter().find(|t| **t > local.time()) {
            return Some(today.and_time(*time));
        }
        let first = self.times.first()?;
        today
            .checked_add_days(Days::new(1))
            .map(|tomorrow| tomorrow.and_time(*first))
    }
}

// =============================================================================
// Tests
// =============================================================================
