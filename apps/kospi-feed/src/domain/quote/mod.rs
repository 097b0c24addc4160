//! Normalized Quote Updates
//!
//! Canonical representation of one real-time tick after projection from
//! the wire format. Every field except the symbol and price is optional:
//! a missing field means "not reported", which is distinct from zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Option price sensitivities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Greeks {
    /// Delta.
    pub delta: Option<Decimal>,
    /// Gamma.
    pub gamma: Option<Decimal>,
    /// Vega.
    pub vega: Option<Decimal>,
    /// Theta.
    pub theta: Option<Decimal>,
    /// Rho.
    pub rho: Option<Decimal>,
}

impl Greeks {
    /// True when no greek was reported.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.delta.is_none()
            && self.gamma.is_none()
            && self.vega.is_none()
            && self.theta.is_none()
            && self.rho.is_none()
    }

    /// True when every reported greek is exactly zero and at least one was
    /// reported.
    #[must_use]
    pub fn all_zero(&self) -> bool {
        let values = [self.delta, self.gamma, self.vega, self.theta, self.rho];
        !self.is_empty() && values.iter().flatten().all(Decimal::is_zero)
    }
}

/// How greeks reported as exactly zero are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GreeksZeroPolicy {
    /// Zero is a real value.
    #[default]
    Preserve,
    /// All-zero greeks outside an open session mean "no data".
    AbsentWhenClosed,
}

impl GreeksZeroPolicy {
    /// Parse a policy name, falling back to [`Self::Preserve`].
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "absent-when-closed" | "absent_when_closed" => Self::AbsentWhenClosed,
            _ => Self::Preserve,
        }
    }

    /// Apply the policy to projected greeks.
    #[must_use]
    pub fn apply(self, greeks: Greeks, session_open: bool) -> Greeks {
        match self {
            Self::AbsentWhenClosed if !session_open && greeks.all_zero() => Greeks::default(),
            _ => greeks,
        }
    }
}

/// A normalized tick applied to the quote sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuoteUpdate {
    /// Instrument short code.
    pub symbol: String,
    /// Last traded price.
    pub price: Decimal,
    /// Change from the previous close.
    pub change: Option<Decimal>,
    /// Accumulated volume (contracts).
    pub volume: Option<u64>,
    /// Accumulated trading value, in thousands of KRW as reported.
    pub trading_value: Option<Decimal>,
    /// Open interest (contracts).
    pub open_interest: Option<u64>,
    /// Open interest change.
    pub open_interest_change: Option<i64>,
    /// Best bid price.
    pub bid_price: Option<Decimal>,
    /// Best ask price.
    pub ask_price: Option<Decimal>,
    /// Best bid size.
    pub bid_size: Option<u64>,
    /// Best ask size.
    pub ask_size: Option<u64>,
    /// Option greeks.
    pub greeks: Greeks,
    /// Implied volatility (percent).
    pub implied_volatility: Option<Decimal>,
    /// Theoretical price.
    pub theoretical_price: Option<Decimal>,
    /// Intrinsic value.
    pub intrinsic_value: Option<Decimal>,
    /// Time value.
    pub time_value: Option<Decimal>,
    /// Underlying index price.
    pub underlying_price: Option<Decimal>,
    /// When the tick was parsed.
    pub observed_at: DateTime<Utc>,
}

impl QuoteUpdate {
    /// A quote carrying only symbol and price.
    #[must_use]
    pub fn new(symbol: impl Into<String>, price: Decimal, observed_at: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            change: None,
            volume: None,
            trading_value: None,
            open_interest: None,
            open_interest_change: None,
            bid_price: None,
            ask_price: None,
            bid_size: None,
            ask_size: None,
            greeks: Greeks::default(),
            implied_volatility: None,
            theoretical_price: None,
            intrinsic_value: None,
            time_value: None,
            underlying_price: None,
            observed_at,
        }
    }
}
