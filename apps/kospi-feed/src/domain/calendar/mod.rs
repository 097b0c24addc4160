//! Trading Calendar
//!
//! Weekend and exchange-holiday lookup for the Korea Exchange derivatives
//! market. A day is a trading day unless it falls on a weekend or is listed
//! in the holiday set.

use std::collections::HashSet;

use chrono::{Datelike, NaiveDate, Weekday};

/// KRX market holidays for 2025.
const KRX_HOLIDAYS_2025: [(u32, u32); 17] = [
    (1, 1),
    (1, 28),
    (1, 29),
    (1, 30),
    (3, 1),
    (3, 3),
    (5, 5),
    (5, 6),
    (6, 6),
    (8, 15),
    (10, 3),
    (10, 6),
    (10, 7),
    (10, 8),
    (10, 9),
    (12, 25),
    (12, 31),
];

/// KRX market holidays for 2026.
const KRX_HOLIDAYS_2026: [(u32, u32); 17] = [
    (1, 1),
    (2, 16),
    (2, 17),
    (2, 18),
    (3, 1),
    (3, 2),
    (5, 5),
    (6, 6),
    (6, 8),
    (8, 15),
    (9, 24),
    (9, 25),
    (9, 26),
    (10, 3),
    (10, 5),
    (10, 9),
    (12, 25),
];

/// Holiday and weekend calendar.
#[derive(Debug, Clone, Default)]
pub struct TradingCalendar {
    holidays: HashSet<NaiveDate>,
}

impl TradingCalendar {
    /// Create a calendar from an explicit holiday set.
    pub fn new(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    /// Calendar preloaded with the built-in KRX holidays.
    #[must_use]
    pub fn krx() -> Self {
        let holidays = [(2025, &KRX_HOLIDAYS_2025), (2026, &KRX_HOLIDAYS_2026)]
            .into_iter()
            .flat_map(|(year, days)| {
                days.iter()
                    .filter_map(move |&(month, day)| NaiveDate::from_ymd_opt(year, month, day))
            });
        Self::new(holidays)
    }

    /// Add holidays on top of the existing set.
    #[must_use]
    pub fn with_extra_holidays(mut self, extra: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(extra);
        self
    }

    /// Whether `date` is listed as an exchange holiday.
    #[must_use]
    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    /// Whether the exchange trades on `date`.
    #[must_use]
    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !is_weekend(date) && !self.is_holiday(date)
    }

    /// The closest trading day strictly before `date`.
    ///
    /// Terminates because the holiday set is finite and weekdays recur.
    #[must_use]
    pub fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut candidate = date.pred_opt().unwrap_or(NaiveDate::MIN);
        while !self.is_trading_day(candidate) {
            match candidate.pred_opt() {
                Some(prev) => candidate = prev,
                None => break,
            }
        }
        candidate
    }

    /// The closest trading day strictly after `date`.
    #[must_use]
    pub fn next_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut candidate = date.succ_opt().unwrap_or(NaiveDate::MAX);
        while !self.is_trading_day(candidate) {
            match candidate.succ_opt() {
                Some(next) => candidate = next,
                None => break,
            }
        }
        candidate
    }

    /// Number of holidays known to this calendar.
    #[must_use]
    pub fn holiday_count(&self) -> usize {
        self.holidays.len()
    }
}

/// Saturday or Sunday.
#[must_use]
pub fn is_weekend(date: NaiveDate) -> bool {
    matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn krx_calendar_loads_both_years() {
        let calendar = TradingCalendar::krx();
        assert_eq!(calendar.holiday_count(), 34);
        assert!(calendar.is_holiday(date(2025, 1, 28)));
        assert!(calendar.is_holiday(date(2026, 9, 25)));
    }

    #[test_case(date(2025, 1, 6), date(2025, 1, 3) ; "monday rolls back over the weekend")]
    #[test_case(date(2025, 1, 7), date(2025, 1, 6) ; "tuesday to monday")]
    #[test_case(date(2025, 1, 2), date(2024, 12, 31) ; "new year holiday is skipped")]
    #[test_case(date(2025, 1, 31), date(2025, 1, 27) ; "lunar new year block")]
    fn previous_trading_day_cases(input: NaiveDate, expected: NaiveDate) {
        let calendar = TradingCalendar::krx();
        assert_eq!(calendar.previous_trading_day(input), expected);
    }

    #[test]
    fn next_trading_day_skips_chuseok() {
        let calendar = TradingCalendar::krx();
        assert_eq!(calendar.next_trading_day(date(2025, 10, 2)), date(2025, 10, 10));
    }

    #[test]
    fn weekends_are_not_trading_days() {
        let calendar = TradingCalendar::default();
        assert!(!calendar.is_trading_day(date(2025, 1, 4)));
        assert!(!calendar.is_trading_day(date(2025, 1, 5)));
        assert!(calendar.is_trading_day(date(2025, 1, 6)));
    }

    #[test]
    fn extra_holidays_are_merged() {
        let calendar = TradingCalendar::krx().with_extra_holidays([date(2027, 1, 1)]);
        assert!(!calendar.is_trading_day(date(2027, 1, 1)));
        assert!(calendar.is_holiday(date(2025, 12, 31)));
    }

    proptest! {
        #[test]
        fn previous_trading_day_is_earlier_and_trading(offset in 0i64..2_000) {
            let calendar = TradingCalendar::krx();
            let start = date(2023, 1, 1) + chrono::Duration::days(offset);
            let previous = calendar.previous_trading_day(start);
            prop_assert!(previous < start);
            prop_assert!(calendar.is_trading_day(previous));
        }
    }
}
