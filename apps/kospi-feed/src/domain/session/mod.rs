//! Market Session Clock
//!
//! Derives the current derivatives-market session from exchange-local wall
//! clock time, the weekday, and the [`TradingCalendar`].
//!
//! # Sessions
//!
//! | Session | Window (exchange local) |
//! |---------|-------------------------|
//! | Day     | 08:45 – 15:45 (exclusive) |
//! | Night   | 18:00 – 05:00 next morning |
//!
//! The state is always recomputed on demand and never stored.

use std::fmt;
use std::sync::Arc;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDateTime, NaiveTime, Offset, Utc, Weekday,
};
use serde::Serialize;

use super::calendar::TradingCalendar;

/// Exchange-local offset from UTC (Korea Standard Time).
pub const EXCHANGE_UTC_OFFSET_SECS: i32 = 9 * 3600;

// =============================================================================
// Session State
// =============================================================================

/// Trading session derived from the clock and calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSessionState {
    /// Regular day session.
    DaySession,
    /// Night session, including its carry-over past midnight.
    NightSession,
    /// Weekday gap between the day and night sessions.
    ClosedBetweenSessions,
    /// Saturday after the night carry-over, and Sunday.
    ClosedWeekend,
    /// Exchange holiday.
    ClosedHoliday,
}

impl MarketSessionState {
    /// Whether quotes are expected to move in this state.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::DaySession | Self::NightSession)
    }

    /// Stable identifier for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DaySession => "day_session",
            Self::NightSession => "night_session",
            Self::ClosedBetweenSessions => "closed_between_sessions",
            Self::ClosedWeekend => "closed_weekend",
            Self::ClosedHoliday => "closed_holiday",
        }
    }

    /// Human readable description.
    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::DaySession => "Day session (08:45-15:45)",
            Self::NightSession => "Night session (18:00-05:00)",
            Self::ClosedBetweenSessions => "Closed between day and night sessions",
            Self::ClosedWeekend => "Closed for the weekend",
            Self::ClosedHoliday => "Closed for an exchange holiday",
        }
    }
}

impl fmt::Display for MarketSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Session Hours
// =============================================================================

/// Session boundaries in exchange-local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHours {
    /// Day session opens strictly after this time.
    pub day_open: NaiveTime,
    /// Day session closes at this time (exclusive).
    pub day_close: NaiveTime,
    /// Night session opens at this time (inclusive).
    pub night_open: NaiveTime,
    /// Night carry-over ends at this time (exclusive) the next morning.
    pub night_close: NaiveTime,
}

impl Default for SessionHours {
    fn default() -> Self {
        Self {
            day_open: NaiveTime::from_hms_opt(8, 45, 0).unwrap_or(NaiveTime::MIN),
            day_close: NaiveTime::from_hms_opt(15, 45, 0).unwrap_or(NaiveTime::MIN),
            night_open: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or(NaiveTime::MIN),
            night_close: NaiveTime::from_hms_opt(5, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Computes [`MarketSessionState`] for a point in time.
#[derive(Debug, Clone)]
pub struct MarketSessionClock {
    calendar: Arc<TradingCalendar>,
    hours: SessionHours,
    night_carries_into_holiday: bool,
    exchange_offset: FixedOffset,
}

impl MarketSessionClock {
    /// Create a clock with the default session hours.
    #[must_use]
    pub fn new(calendar: Arc<TradingCalendar>) -> Self {
        Self {
            calendar,
            hours: SessionHours::default(),
            night_carries_into_holiday: true,
            exchange_offset: FixedOffset::east_opt(EXCHANGE_UTC_OFFSET_SECS)
                .unwrap_or_else(|| Utc.fix()),
        }
    }

    /// Override the session hours.
    #[must_use]
    pub const fn with_hours(mut self, hours: SessionHours) -> Self {
        self.hours = hours;
        self
    }

    /// Whether a night session opened on the eve of a holiday keeps running
    /// into the holiday morning.
    #[must_use]
    pub const fn with_night_into_holiday(mut self, enabled: bool) -> Self {
        self.night_carries_into_holiday = enabled;
        self
    }

    /// The calendar backing this clock.
    #[must_use]
    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    /// Current exchange-local time.
    #[must_use]
    pub fn now_local(&self) -> NaiveDateTime {
        self.to_local(Utc::now())
    }

    /// Convert a UTC instant to exchange-local time.
    #[must_use]
    pub fn to_local(&self, instant: DateTime<Utc>) -> NaiveDateTime {
        instant.with_timezone(&self.exchange_offset).naive_local()
    }

    /// Session state right now.
    #[must_use]
    pub fn current_state(&self) -> MarketSessionState {
        self.state_at(self.now_local())
    }

    /// Session state at an exchange-local time.
    #[must_use]
    pub fn state_at(&self, local: NaiveDateTime) -> MarketSessionState {
        let date = local.date();
        let time = local.time();
        let hours = &self.hours;

        match date.weekday() {
            Weekday::Sun => return MarketSessionState::ClosedWeekend,
            Weekday::Sat => {
                return if time < hours.night_close {
                    MarketSessionState::NightSession
                } else {
                    MarketSessionState::ClosedWeekend
                };
            }
            _ => {}
        }

        let after_trading_day = date
            .pred_opt()
            .is_some_and(|prev| self.calendar.is_trading_day(prev));

        if self.calendar.is_holiday(date) {
            let carried_over =
                time < hours.night_close && self.night_carries_into_holiday && after_trading_day;
            return if carried_over {
                MarketSessionState::NightSession
            } else {
                MarketSessionState::ClosedHoliday
            };
        }

        // only a trading day's evening carries a night session past midnight
        if time > hours.day_open && time < hours.day_close {
            MarketSessionState::DaySession
        } else if time >= hours.night_open || (time < hours.night_close && after_trading_day) {
            MarketSessionState::NightSession
        } else {
            MarketSessionState::ClosedBetweenSessions
        }
    }

    /// Session to prepare for at `local`.
    ///
    /// Between sessions this looks `lead` ahead so that a pre-open trigger
    /// activates the coming session; otherwise it is [`Self::state_at`].
    #[must_use]
    pub fn upcoming_state(&self, local: NaiveDateTime, lead: Duration) -> MarketSessionState {
        let now = self.state_at(local);
        if now != MarketSessionState::ClosedBetweenSessions {
            return now;
        }
        let ahead = self.state_at(local + lead);
        if ahead.is_open() { ahead } else { now }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use test_case::test_case;

    fn clock() -> MarketSessionClock {
        MarketSessionClock::new(Arc::new(TradingCalendar::krx()))
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    // 2025-01-06 is a Monday, 2025-01-07 a Tuesday.
    #[test_case(at(2025, 1, 7, 9, 0), MarketSessionState::DaySession ; "tuesday morning")]
    #[test_case(at(2025, 1, 7, 8, 45), MarketSessionState::ClosedBetweenSessions ; "day open is exclusive")]
    #[test_case(at(2025, 1, 7, 15, 45), MarketSessionState::ClosedBetweenSessions ; "day close is exclusive")]
    #[test_case(at(2025, 1, 7, 18, 0), MarketSessionState::NightSession ; "night open is inclusive")]
    #[test_case(at(2025, 1, 7, 3, 0), MarketSessionState::NightSession ; "tuesday night carry over")]
    #[test_case(at(2025, 1, 6, 3, 0), MarketSessionState::ClosedBetweenSessions ; "monday early morning")]
    #[test_case(at(2025, 1, 7, 5, 0), MarketSessionState::ClosedBetweenSessions ; "night close is exclusive")]
    #[test_case(at(2025, 1, 11, 4, 59), MarketSessionState::NightSession ; "saturday bleed through")]
    #[test_case(at(2025, 1, 11, 5, 0), MarketSessionState::ClosedWeekend ; "saturday after night close")]
    #[test_case(at(2025, 1, 12, 20, 0), MarketSessionState::ClosedWeekend ; "sunday evening")]
    #[test_case(at(2025, 1, 28, 10, 0), MarketSessionState::ClosedHoliday ; "holiday day window")]
    #[test_case(at(2025, 1, 28, 2, 0), MarketSessionState::NightSession ; "holiday morning carry over")]
    #[test_case(at(2025, 1, 29, 2, 0), MarketSessionState::ClosedHoliday ; "second holiday has no carry over")]
    #[test_case(at(2025, 1, 28, 19, 0), MarketSessionState::ClosedHoliday ; "holiday evening")]
    #[test_case(at(2025, 1, 31, 2, 0), MarketSessionState::ClosedBetweenSessions ; "first morning after holiday block")]
    #[test_case(at(2025, 1, 31, 18, 30), MarketSessionState::NightSession ; "first evening after holiday block")]
    #[test_case(at(2025, 10, 10, 4, 0), MarketSessionState::ClosedBetweenSessions ; "friday after chuseok block")]
    fn state_cases(local: NaiveDateTime, expected: MarketSessionState) {
        assert_eq!(clock().state_at(local), expected);
    }

    #[test]
    fn holiday_carry_over_can_be_disabled() {
        let clock = clock().with_night_into_holiday(false);
        assert_eq!(
            clock.state_at(at(2025, 1, 28, 2, 0)),
            MarketSessionState::ClosedHoliday
        );
    }

    #[test]
    fn upcoming_state_looks_ahead_between_sessions() {
        let clock = clock();
        let lead = Duration::minutes(15);
        assert_eq!(
            clock.upcoming_state(at(2025, 1, 7, 8, 40), lead),
            MarketSessionState::DaySession
        );
        assert_eq!(
            clock.upcoming_state(at(2025, 1, 7, 17, 55), lead),
            MarketSessionState::NightSession
        );
        assert_eq!(
            clock.upcoming_state(at(2025, 1, 7, 16, 0), lead),
            MarketSessionState::ClosedBetweenSessions
        );
        assert_eq!(
            clock.upcoming_state(at(2025, 1, 7, 10, 0), lead),
            MarketSessionState::DaySession
        );
    }

    #[test]
    fn to_local_applies_exchange_offset() {
        let clock = clock();
        let utc = DateTime::parse_from_rfc3339("2025-01-07T00:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(clock.to_local(utc), at(2025, 1, 7, 9, 30));
    }

    #[test]
    fn open_states() {
        assert!(MarketSessionState::DaySession.is_open());
        assert!(MarketSessionState::NightSession.is_open());
        assert!(!MarketSessionState::ClosedHoliday.is_open());
        assert_eq!(MarketSessionState::ClosedWeekend.as_str(), "closed_weekend");
    }

    fn weekday_trading_date() -> impl Strategy<Value = NaiveDate> {
        (0i64..730).prop_filter_map("weekday non-holiday", |offset| {
            let date = NaiveDate::from_ymd_opt(2025, 1, 1)? + Duration::days(offset);
            TradingCalendar::krx().is_trading_day(date).then_some(date)
        })
    }

    proptest! {
        #[test]
        fn day_window_is_day_session(date in weekday_trading_date(), minute in 1u32..420) {
            let local = date.and_hms_opt(8, 45, 0).unwrap() + Duration::minutes(i64::from(minute));
            prop_assert_eq!(clock().state_at(local), MarketSessionState::DaySession);
        }

        #[test]
        fn evening_is_night_session(date in weekday_trading_date(), minute in 0u32..360) {
            let local = date.and_hms_opt(18, 0, 0).unwrap() + Duration::minutes(i64::from(minute));
            prop_assume!(local.date() == date);
            prop_assert_eq!(clock().state_at(local), MarketSessionState::NightSession);
        }

        #[test]
        fn early_morning_is_night_only_after_a_trading_day(date in weekday_trading_date(), minute in 0u32..300) {
            let local = date.and_hms_opt(0, 0, 0).unwrap() + Duration::minutes(i64::from(minute));
            let prev = date.pred_opt().unwrap();
            let expected = if TradingCalendar::krx().is_trading_day(prev) {
                MarketSessionState::NightSession
            } else {
                MarketSessionState::ClosedBetweenSessions
            };
            prop_assert_eq!(clock().state_at(local), expected);
        }

        #[test]
        fn sunday_is_always_closed(week in 0i64..100, minute in 0i64..1440) {
            // 2025-01-05 is a Sunday.
            let local = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap().and_hms_opt(0, 0, 0).unwrap()
                + Duration::weeks(week)
                + Duration::minutes(minute);
            prop_assert_eq!(clock().state_at(local), MarketSessionState::ClosedWeekend);
        }
    }
}
