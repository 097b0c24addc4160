//! Instrument Codes
//!
//! Value types for KOSPI200 futures and options and their exchange short
//! codes. Formatting is a pure function of the contract terms, so deriving
//! the same contract twice always yields the same code.
//!
//! # Code Layout
//!
//! ```text
//! Futures:  101 Y MM            e.g. 101S03   (Y = KRX year letter)
//! Options:  B|C 01 Y MM SSS     e.g. B01601577  (B = call, C = put, Y = year - 2020)
//! ```
//!
//! The option strike is carried as its integer part. On the 2.5 point grid
//! an integer part congruent to 2 modulo 5 denotes a half-point strike
//! (`577` → 577.5).

use std::fmt;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Serialize, Serializer};

/// KRX year letters used in futures short codes.
const FUTURES_YEAR_CODES: [(i32, char); 4] = [(2025, 'V'), (2026, 'S'), (2027, 'U'), (2028, 'W')];

/// Futures product prefix.
const FUTURES_PREFIX: &str = "101";

/// Option product infix following the side letter.
const OPTION_PRODUCT: &str = "01";

/// Largest strike integer part representable in three digits.
const MAX_STRIKE_CODE: u32 = 999;

/// Decade the single option year digit counts from.
const OPTION_YEAR_BASE: i32 = 2020;

/// Length of an option short code.
const OPTION_CODE_LEN: usize = 9;

// =============================================================================
// Error Type
// =============================================================================

/// Errors raised while building or parsing instrument codes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeError {
    /// Month outside 1..=12.
    #[error("invalid month: {0}")]
    InvalidMonth(u32),

    /// Futures only list in March, June, September and December.
    #[error("futures expire in quarter months only, got month {0}")]
    NotQuarterMonth(u32),

    /// Year has no futures year letter or no single-digit option form.
    #[error("unsupported contract year: {0}")]
    UnsupportedYear(i32),

    /// Strike is negative or does not fit the three digit code.
    #[error("strike out of range: {0}")]
    StrikeOutOfRange(Decimal),

    /// Code string does not match any known layout.
    #[error("unparseable instrument code: {0}")]
    Unparseable(String),
}

// =============================================================================
// Building Blocks
// =============================================================================

/// Futures or options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Index futures.
    Future,
    /// Index options.
    Option,
}

impl InstrumentKind {
    /// Stable identifier for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Future => "future",
            Self::Option => "option",
        }
    }
}

/// Option side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionSide {
    /// Call option.
    Call,
    /// Put option.
    Put,
}

impl OptionSide {
    const fn code_letter(self) -> char {
        match self {
            Self::Call => 'B',
            Self::Put => 'C',
        }
    }

    const fn from_code_letter(letter: char) -> Option<Self> {
        match letter {
            'B' => Some(Self::Call),
            'C' => Some(Self::Put),
            _ => None,
        }
    }
}

/// Contract expiry month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExpiryMonth {
    year: i32,
    month: u32,
}

impl ExpiryMonth {
    /// Create an expiry month.
    ///
    /// # Errors
    ///
    /// Returns [`CodeError::InvalidMonth`] if `month` is not in 1..=12.
    pub const fn new(year: i32, month: u32) -> Result<Self, CodeError> {
        if month == 0 || month > 12 {
            return Err(CodeError::InvalidMonth(month));
        }
        Ok(Self { year, month })
    }

    /// Month containing `date`.
    #[must_use]
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Calendar year.
    #[must_use]
    pub const fn year(self) -> i32 {
        self.year
    }

    /// Calendar month (1..=12).
    #[must_use]
    pub const fn month(self) -> u32 {
        self.month
    }

    /// The following month.
    #[must_use]
    pub const fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// March, June, September or December.
    #[must_use]
    pub const fn is_quarter(self) -> bool {
        self.month % 3 == 0
    }

    /// This month if it is a quarter month, otherwise the next one.
    #[must_use]
    pub const fn quarter_at_or_after(self) -> Self {
        let mut candidate = self;
        while !candidate.is_quarter() {
            candidate = candidate.next();
        }
        candidate
    }

    /// `YYYYMM` form used by the REST API.
    #[must_use]
    pub fn yyyymm(self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

impl fmt::Display for ExpiryMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

// =============================================================================
// Contracts
// =============================================================================

/// KOSPI200 futures contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FutureContract {
    expiry: ExpiryMonth,
    code: String,
}

impl FutureContract {
    /// Create a futures contract for a quarter month.
    ///
    /// # Errors
    ///
    /// Fails if the month is not a quarter month or the year has no letter.
    pub fn new(expiry: ExpiryMonth) -> Result<Self, CodeError> {
        if !expiry.is_quarter() {
            return Err(CodeError::NotQuarterMonth(expiry.month));
        }
        let letter = FUTURES_YEAR_CODES
            .iter()
            .find(|(year, _)| *year == expiry.year)
            .map(|(_, letter)| *letter)
            .ok_or(CodeError::UnsupportedYear(expiry.year))?;
        Ok(Self {
            expiry,
            code: format!("{FUTURES_PREFIX}{letter}{:02}", expiry.month),
        })
    }

    /// Expiry month.
    #[must_use]
    pub const fn expiry(&self) -> ExpiryMonth {
        self.expiry
    }
}

/// KOSPI200 option contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OptionContract {
    side: OptionSide,
    strike: Decimal,
    expiry: ExpiryMonth,
    code: String,
}

impl OptionContract {
    /// Create an option contract.
    ///
    /// # Errors
    ///
    /// Fails if the strike does not fit three digits or the year is outside
    /// 2020..=2029.
    pub fn new(side: OptionSide, strike: Decimal, expiry: ExpiryMonth) -> Result<Self, CodeError> {
        if !(OPTION_YEAR_BASE..OPTION_YEAR_BASE + 10).contains(&expiry.year) {
            return Err(CodeError::UnsupportedYear(expiry.year));
        }
        let strike_code = strike
            .trunc()
            .to_u32()
            .filter(|code| *code <= MAX_STRIKE_CODE && !strike.is_sign_negative())
            .ok_or(CodeError::StrikeOutOfRange(strike))?;
        let code = format!(
            "{}{OPTION_PRODUCT}{}{:02}{strike_code:03}",
            side.code_letter(),
            expiry.year - OPTION_YEAR_BASE,
            expiry.month,
        );
        Ok(Self {
            side,
            strike: strike.normalize(),
            expiry,
            code,
        })
    }

    /// Call or put.
    #[must_use]
    pub const fn side(&self) -> OptionSide {
        self.side
    }

    /// Strike price.
    #[must_use]
    pub const fn strike(&self) -> Decimal {
        self.strike
    }

    /// Expiry month.
    #[must_use]
    pub const fn expiry(&self) -> ExpiryMonth {
        self.expiry
    }
}

// =============================================================================
// Instrument Code
// =============================================================================

/// A tradable instrument identified by its exchange short code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstrumentCode {
    /// Index futures contract.
    Future(FutureContract),
    /// Index option contract.
    Option(OptionContract),
}

impl InstrumentCode {
    /// Futures code for a quarter month.
    ///
    /// # Errors
    ///
    /// See [`FutureContract::new`].
    pub fn future(expiry: ExpiryMonth) -> Result<Self, CodeError> {
        FutureContract::new(expiry).map(Self::Future)
    }

    /// Option code.
    ///
    /// # Errors
    ///
    /// See [`OptionContract::new`].
    pub fn option(side: OptionSide, strike: Decimal, expiry: ExpiryMonth) -> Result<Self, CodeError> {
        OptionContract::new(side, strike, expiry).map(Self::Option)
    }

    /// Parse a short code back into its contract terms.
    ///
    /// # Errors
    ///
    /// Returns [`CodeError::Unparseable`] for codes that match neither layout.
    pub fn parse(code: &str) -> Result<Self, CodeError> {
        let unparseable = || CodeError::Unparseable(code.to_string());
        if !code.is_ascii() {
            return Err(unparseable());
        }

        if let Some(rest) = code.strip_prefix(FUTURES_PREFIX) {
            if rest.len() != 3 {
                return Err(unparseable());
            }
            let letter = rest.chars().next().ok_or_else(unparseable)?;
            let year = FUTURES_YEAR_CODES
                .iter()
                .find(|(_, l)| *l == letter)
                .map(|(year, _)| *year)
                .ok_or_else(unparseable)?;
            let month: u32 = rest[1..].parse().map_err(|_| unparseable())?;
            return Self::future(ExpiryMonth::new(year, month)?);
        }

        if code.len() != OPTION_CODE_LEN {
            return Err(unparseable());
        }
        let side = code
            .chars()
            .next()
            .and_then(OptionSide::from_code_letter)
            .ok_or_else(unparseable)?;
        if &code[1..3] != OPTION_PRODUCT {
            return Err(unparseable());
        }
        let year: i32 = code[3..4].parse().map_err(|_| unparseable())?;
        let month: u32 = code[4..6].parse().map_err(|_| unparseable())?;
        let strike_code: u32 = code[6..9].parse().map_err(|_| unparseable())?;
        let mut strike = Decimal::from(strike_code);
        if strike_code % 5 == 2 {
            strike += Decimal::new(5, 1);
        }
        Self::option(side, strike, ExpiryMonth::new(OPTION_YEAR_BASE + year, month)?)
    }

    /// Exchange short code.
    #[must_use]
    pub fn code(&self) -> &str {
        match self {
            Self::Future(contract) => &contract.code,
            Self::Option(contract) => &contract.code,
        }
    }

    /// Futures or options.
    #[must_use]
    pub const fn kind(&self) -> InstrumentKind {
        match self {
            Self::Future(_) => InstrumentKind::Future,
            Self::Option(_) => InstrumentKind::Option,
        }
    }

    /// Expiry month of the underlying contract.
    #[must_use]
    pub const fn expiry(&self) -> ExpiryMonth {
        match self {
            Self::Future(contract) => contract.expiry,
            Self::Option(contract) => contract.expiry,
        }
    }

    /// Human readable name, e.g. `KOSPI200 C 2026-01 577.5`.
    #[must_use]
    pub fn display_name(&self) -> String {
        match self {
            Self::Future(contract) => format!("KOSPI200 F {}", contract.expiry),
            Self::Option(contract) => {
                let side = match contract.side {
                    OptionSide::Call => 'C',
                    OptionSide::Put => 'P',
                };
                format!("KOSPI200 {side} {} {:.1}", contract.expiry, contract.strike)
            }
        }
    }
}

impl fmt::Display for InstrumentCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl Serialize for InstrumentCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use test_case::test_case;

    fn month(year: i32, month: u32) -> ExpiryMonth {
        ExpiryMonth::new(year, month).unwrap()
    }

    #[test_case(2025, 3, "101V03")]
    #[test_case(2026, 12, "101S12")]
    #[test_case(2027, 6, "101U06")]
    fn futures_codes(year: i32, m: u32, expected: &str) {
        let code = InstrumentCode::future(month(year, m)).unwrap();
        assert_eq!(code.code(), expected);
        assert_eq!(code.kind(), InstrumentKind::Future);
    }

    #[test]
    fn futures_reject_non_quarter_months() {
        assert_eq!(
            InstrumentCode::future(month(2026, 1)),
            Err(CodeError::NotQuarterMonth(1))
        );
        assert_eq!(
            InstrumentCode::future(month(2031, 3)),
            Err(CodeError::UnsupportedYear(2031))
        );
    }

    #[test_case(OptionSide::Call, dec!(580), "B01601580")]
    #[test_case(OptionSide::Call, dec!(577.5), "B01601577")]
    #[test_case(OptionSide::Put, dec!(585.0), "C01601585")]
    #[test_case(OptionSide::Call, dec!(97.5), "B01601097")]
    fn option_codes(side: OptionSide, strike: Decimal, expected: &str) {
        let code = InstrumentCode::option(side, strike, month(2026, 1)).unwrap();
        assert_eq!(code.code(), expected);
        assert_eq!(code.code().len(), 9);
    }

    #[test]
    fn option_month_code_uses_single_year_digit() {
        let december = InstrumentCode::option(OptionSide::Put, dec!(560), month(2025, 12)).unwrap();
        assert_eq!(december.code(), "C01512560");
    }

    #[test_case(2019 ; "before the decade")]
    #[test_case(2030 ; "after the decade")]
    fn option_rejects_years_outside_the_decade(year: i32) {
        assert_eq!(
            InstrumentCode::option(OptionSide::Call, dec!(580), month(year, 1)),
            Err(CodeError::UnsupportedYear(year))
        );
    }

    #[test]
    fn option_rejects_four_digit_strike() {
        let err = InstrumentCode::option(OptionSide::Call, dec!(1000), month(2026, 1));
        assert_eq!(err, Err(CodeError::StrikeOutOfRange(dec!(1000))));
    }

    #[test]
    fn parse_recovers_half_point_strikes() {
        let parsed = InstrumentCode::parse("B01601577").unwrap();
        let InstrumentCode::Option(contract) = &parsed else {
            panic!("expected option");
        };
        assert_eq!(contract.strike(), dec!(577.5));
        assert_eq!(contract.side(), OptionSide::Call);
        assert_eq!(contract.expiry(), month(2026, 1));

        let parsed = InstrumentCode::parse("C01601575").unwrap();
        let InstrumentCode::Option(contract) = &parsed else {
            panic!("expected option");
        };
        assert_eq!(contract.strike(), dec!(575));
        assert_eq!(contract.side(), OptionSide::Put);
    }

    #[test]
    fn parse_futures() {
        let parsed = InstrumentCode::parse("101S06").unwrap();
        assert_eq!(parsed.expiry(), month(2026, 6));
        assert_eq!(parsed.code(), "101S06");
    }

    #[test_case("" ; "empty")]
    #[test_case("A01603" ; "rest code")]
    #[test_case("X01601577" ; "unknown side")]
    #[test_case("B0160157" ; "too short")]
    #[test_case("B012601577" ; "two digit year")]
    #[test_case("101Z03" ; "unknown year letter")]
    fn parse_rejects_garbage(code: &str) {
        assert!(InstrumentCode::parse(code).is_err());
    }

    #[test]
    fn display_names() {
        let call = InstrumentCode::option(OptionSide::Call, dec!(577.5), month(2026, 1)).unwrap();
        assert_eq!(call.display_name(), "KOSPI200 C 2026-01 577.5");
        let future = InstrumentCode::future(month(2026, 3)).unwrap();
        assert_eq!(future.display_name(), "KOSPI200 F 2026-03");
    }

    #[test]
    fn expiry_month_navigation() {
        assert_eq!(month(2025, 12).next(), month(2026, 1));
        assert_eq!(month(2025, 10).quarter_at_or_after(), month(2025, 12));
        assert_eq!(month(2025, 12).quarter_at_or_after(), month(2025, 12));
        assert_eq!(month(2026, 1).yyyymm(), "202601");
        assert!(ExpiryMonth::new(2026, 13).is_err());
    }
}
