//! Symbol Master
//!
//! Derives the active KOSPI200 futures and options universe for a trading
//! date. The option strike window is centred on an at-the-money strike
//! computed from the latest underlying estimate and widens or narrows with
//! trailing implied volatility, keeping the subscription count under the
//! upstream per-connection cap.

use std::collections::VecDeque;
use std::fmt;

use chrono::{Datelike, NaiveDate, Weekday};
use parking_lot::{Mutex, RwLock};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use super::instrument::{CodeError, ExpiryMonth, InstrumentCode, OptionSide};

// =============================================================================
// Error Type
// =============================================================================

/// Errors raised while deriving the instrument universe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SymbolError {
    /// Code formatting failed.
    #[error(transparent)]
    Code(#[from] CodeError),

    /// Strike grid must be positive.
    #[error("strike grid must be positive, got {0}")]
    InvalidGrid(Decimal),
}

// =============================================================================
// Expiry Rules
// =============================================================================

/// Chooses the first contract month still worth subscribing on a date.
pub trait ExpiryRule: Send + Sync + fmt::Debug {
    /// Month from which the front contract is searched.
    fn front_month(&self, date: NaiveDate) -> ExpiryMonth;
}

/// Roll to the next month once the day of month reaches a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayOfMonthRollover {
    /// First day of month that belongs to the next contract.
    pub threshold_day: u32,
}

impl Default for DayOfMonthRollover {
    fn default() -> Self {
        Self { threshold_day: 10 }
    }
}

impl ExpiryRule for DayOfMonthRollover {
    fn front_month(&self, date: NaiveDate) -> ExpiryMonth {
        let month = ExpiryMonth::of(date);
        if date.day() >= self.threshold_day {
            month.next()
        } else {
            month
        }
    }
}

/// Roll to the next month the day after the second Thursday, the KRX
/// expiry day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecondThursdayRollover;

impl SecondThursdayRollover {
    /// Second Thursday of the month containing `date`.
    #[must_use]
    pub fn expiry_day(date: NaiveDate) -> NaiveDate {
        let first = date.with_day(1).unwrap_or(date);
        let offset = (7 + Weekday::Thu.num_days_from_monday()
            - first.weekday().num_days_from_monday())
            % 7;
        first + chrono::Duration::days(i64::from(offset) + 7)
    }
}

impl ExpiryRule for SecondThursdayRollover {
    fn front_month(&self, date: NaiveDate) -> ExpiryMonth {
        let month = ExpiryMonth::of(date);
        if date > Self::expiry_day(date) {
            month.next()
        } else {
            month
        }
    }
}

// =============================================================================
// Strike Range
// =============================================================================

/// Scales the strike half-width with trailing implied volatility.
///
/// `range = clamp(base × avgIV / referenceIV, min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrikeRangePolicy {
    /// Half-width in index points at the reference volatility.
    pub base: Decimal,
    /// Volatility at which `base` applies.
    pub reference_iv: Decimal,
    /// Smallest half-width.
    pub min: Decimal,
    /// Largest half-width.
    pub max: Decimal,
}

impl Default for StrikeRangePolicy {
    fn default() -> Self {
        Self {
            base: dec!(15),
            reference_iv: dec!(15),
            min: dec!(7.5),
            max: dec!(30),
        }
    }
}

impl StrikeRangePolicy {
    /// Half-width to use for the given trailing average volatility.
    #[must_use]
    pub fn range_for(&self, average_iv: Option<Decimal>) -> Decimal {
        match average_iv {
            Some(iv) if iv > Decimal::ZERO && self.reference_iv > Decimal::ZERO => {
                (self.base * iv / self.reference_iv).max(self.min).min(self.max)
            }
            _ => self.base,
        }
    }
}

/// Trailing window of observed implied volatilities.
#[derive(Debug)]
pub struct ImpliedVolWindow {
    capacity: usize,
    values: Mutex<VecDeque<Decimal>>,
}

impl ImpliedVolWindow {
    /// Create a window holding at most `capacity` observations.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            values: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Record an observation. Non-positive values are ignored.
    pub fn observe(&self, iv: Decimal) {
        if iv <= Decimal::ZERO {
            return;
        }
        let mut values = self.values.lock();
        if values.len() == self.capacity {
            values.pop_front();
        }
        values.push_back(iv);
    }

    /// Mean of the window, if anything was observed.
    #[must_use]
    pub fn average(&self) -> Option<Decimal> {
        let values = self.values.lock();
        if values.is_empty() {
            return None;
        }
        let sum: Decimal = values.iter().copied().sum();
        Some(sum / Decimal::from(values.len()))
    }
}

// =============================================================================
// Symbol Master
// =============================================================================

/// Tunables for universe derivation.
#[derive(Debug, Clone)]
pub struct SymbolMasterConfig {
    /// Distance between listed strikes.
    pub strike_grid: Decimal,
    /// Strike window policy.
    pub strike_range: StrikeRangePolicy,
    /// Underlying estimate used before any price is observed.
    pub default_underlying: Decimal,
    /// Size of the trailing implied volatility window.
    pub iv_window: usize,
    /// Most option codes one universe may hold (0 = unlimited). The strike
    /// range shrinks symmetrically so the window stays centred on ATM.
    pub max_codes: usize,
}

impl Default for SymbolMasterConfig {
    fn default() -> Self {
        Self {
            strike_grid: dec!(2.5),
            strike_range: StrikeRangePolicy::default(),
            default_underlying: dec!(585.0),
            iv_window: 200,
            max_codes: 40,
        }
    }
}

/// Derives the instrument universe.
#[derive(Debug)]
pub struct SymbolMaster {
    config: SymbolMasterConfig,
    futures_rule: Box<dyn ExpiryRule>,
    options_rule: Box<dyn ExpiryRule>,
    underlying: RwLock<Option<Decimal>>,
    implied_vol: ImpliedVolWindow,
}

impl SymbolMaster {
    /// Create a symbol master with day-of-month rollover rules.
    #[must_use]
    pub fn new(config: SymbolMasterConfig) -> Self {
        let implied_vol = ImpliedVolWindow::new(config.iv_window);
        Self {
            config,
            futures_rule: Box::new(DayOfMonthRollover::default()),
            options_rule: Box::new(DayOfMonthRollover::default()),
            underlying: RwLock::new(None),
            implied_vol,
        }
    }

    /// Replace the futures rollover rule.
    #[must_use]
    pub fn with_futures_rule(mut self, rule: impl ExpiryRule + 'static) -> Self {
        self.futures_rule = Box::new(rule);
        self
    }

    /// Replace the options rollover rule.
    #[must_use]
    pub fn with_options_rule(mut self, rule: impl ExpiryRule + 'static) -> Self {
        self.options_rule = Box::new(rule);
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &SymbolMasterConfig {
        &self.config
    }

    /// Front quarterly futures contract for `date`.
    ///
    /// # Errors
    ///
    /// Fails if the contract year has no futures code.
    pub fn active_futures(&self, date: NaiveDate) -> Result<Vec<InstrumentCode>, SymbolError> {
        let expiry = self.futures_rule.front_month(date).quarter_at_or_after();
        Ok(vec![InstrumentCode::future(expiry)?])
    }

    /// Front monthly option expiry for `date`.
    #[must_use]
    pub fn active_option_month(&self, date: NaiveDate) -> ExpiryMonth {
        self.options_rule.front_month(date)
    }

    /// Calls and puts on every grid strike within `range` of at-the-money.
    ///
    /// Strikes are emitted ascending with the call before the put.
    ///
    /// # Errors
    ///
    /// Fails on a non-positive grid or a strike that cannot be encoded.
    pub fn active_options(
        &self,
        expiry: ExpiryMonth,
        underlying_price: Decimal,
        strike_range: Decimal,
        strike_grid: Decimal,
    ) -> Result<Vec<InstrumentCode>, SymbolError> {
        let (lower, upper) = strike_window(underlying_price, strike_range, strike_grid)?;
        let mut codes = Vec::new();
        let mut strike = lower.max(strike_grid);
        while strike <= upper {
            codes.push(InstrumentCode::option(OptionSide::Call, strike, expiry)?);
            codes.push(InstrumentCode::option(OptionSide::Put, strike, expiry)?);
            strike += strike_grid;
        }
        Ok(codes)
    }

    /// Option universe for `date` using the current underlying estimate and
    /// the volatility-scaled range.
    ///
    /// # Errors
    ///
    /// See [`Self::active_options`].
    pub fn option_universe(&self, date: NaiveDate) -> Result<Vec<InstrumentCode>, SymbolError> {
        let expiry = self.active_option_month(date);
        let underlying = self.underlying_estimate();
        let range = self.strike_range();
        tracing::debug!(
            expiry = %expiry,
            underlying = %underlying,
            range = %range,
            "Deriving option universe"
        );
        self.active_options(expiry, underlying, range, self.config.strike_grid)
    }

    /// Record the latest underlying price (front futures or index).
    pub fn observe_underlying(&self, price: Decimal) {
        if price > Decimal::ZERO {
            *self.underlying.write() = Some(price);
        }
    }

    /// Record an implied volatility observation.
    pub fn observe_implied_vol(&self, iv: Decimal) {
        self.implied_vol.observe(iv);
    }

    /// Latest observed underlying price, or the configured default.
    #[must_use]
    pub fn underlying_estimate(&self) -> Decimal {
        self.underlying
            .read()
            .unwrap_or(self.config.default_underlying)
    }

    /// Current strike half-width, capped so both wings fit `max_codes`.
    #[must_use]
    pub fn strike_range(&self) -> Decimal {
        let range = self
            .config
            .strike_range
            .range_for(self.implied_vol.average());
        match self.max_half_width() {
            Some(cap) if range > cap => cap,
            _ => range,
        }
    }

    /// Widest half-width whose call/put pairs, ATM included, fit the cap.
    fn max_half_width(&self) -> Option<Decimal> {
        if self.config.max_codes == 0 {
            return None;
        }
        let strikes = self.config.max_codes / 2;
        let steps_per_wing = strikes.saturating_sub(1) / 2;
        Some(self.config.strike_grid * Decimal::from(steps_per_wing))
    }
}

/// At-the-money strike: `underlying` rounded half-up to the grid.
///
/// # Errors
///
/// Fails on a non-positive grid.
pub fn at_the_money(underlying: Decimal, grid: Decimal) -> Result<Decimal, SymbolError> {
    if grid <= Decimal::ZERO {
        return Err(SymbolError::InvalidGrid(grid));
    }
    let steps = (underlying / grid).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    Ok((steps * grid).normalize())
}

/// Inclusive strike window around at-the-money, rounded outward to the grid.
///
/// # Errors
///
/// Fails on a non-positive grid.
pub fn strike_window(
    underlying: Decimal,
    range: Decimal,
    grid: Decimal,
) -> Result<(Decimal, Decimal), SymbolError> {
    let atm = at_the_money(underlying, grid)?;
    let range = range.max(Decimal::ZERO);
    let lower = ((atm - range) / grid).floor() * grid;
    let upper = ((atm + range) / grid).ceil() * grid;
    Ok((lower.normalize(), upper.normalize()))
}
