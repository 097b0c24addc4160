//! KIS Real-Time Frame Codec
//!
//! Decodes inbound socket text into either a pipe-delimited data frame or a
//! JSON control frame, and projects data frames into [`QuoteUpdate`]s using
//! a per-channel field offset table.
//!
//! # Data Frame
//!
//! ```text
//! 0|H0IOCNT0|001|B01601577^093015^0.05^42.50^...
//! │    │      │   └── symbol ^ field0 ^ field1 ^ ...
//! │    │      └── record count
//! │    └── channel id
//! └── 0 = plain, 1 = encrypted
//! ```
//!
//! Offsets index the fields following the symbol. The upstream schema is
//! positional, so every index lives in [`FieldOffsets`] and nowhere else.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use super::messages::ControlMessage;
use crate::domain::quote::{Greeks, QuoteUpdate};
use crate::domain::streaming::{
    ChannelId, DAY_FUTURES_CHANNEL, DAY_OPTIONS_CHANNEL, NIGHT_FUTURES_CHANNEL,
    NIGHT_OPTIONS_CHANNEL,
};

/// Envelope separator.
const ENVELOPE_SEPARATOR: char = '|';

/// Field separator inside the payload.
const FIELD_SEPARATOR: char = '^';

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur while decoding frames.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Empty frame.
    #[error("empty frame")]
    Empty,

    /// Envelope does not have four segments or a valid header.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Payload has no symbol.
    #[error("payload has no symbol")]
    MissingSymbol,

    /// Price field missing or unparseable.
    #[error("no valid price for {symbol}")]
    MissingPrice {
        /// Instrument the frame was for.
        symbol: String,
    },

    /// No offset table configured for the channel.
    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelId),

    /// JSON control frame could not be parsed.
    #[error("invalid control frame: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// Short label for metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::InvalidEnvelope(_) => "invalid_envelope",
            Self::MissingSymbol => "missing_symbol",
            Self::MissingPrice { .. } => "missing_price",
            Self::UnknownChannel(_) => "unknown_channel",
            Self::Json(_) => "invalid_json",
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Payload encoding flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// Plain text tick.
    Plain,
    /// Encrypted payload (order notifications); not decodable here.
    Encrypted,
}

/// Transient field set of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTick {
    /// Instrument short code.
    pub symbol: String,
    /// Fields following the symbol.
    pub fields: Vec<String>,
}

impl RawTick {
    /// Field at `index`, or `None` if out of range or blank.
    #[must_use]
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields
            .get(index)
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
    }

    fn decimal(&self, index: Option<usize>) -> Option<Decimal> {
        index
            .and_then(|i| self.field(i))
            .and_then(|f| Decimal::from_str(f).ok())
    }

    fn unsigned(&self, index: Option<usize>) -> Option<u64> {
        let raw = index.and_then(|i| self.field(i))?;
        raw.parse::<u64>()
            .ok()
            .or_else(|| Decimal::from_str(raw).ok().and_then(|d| d.to_u64()))
    }

    fn signed(&self, index: Option<usize>) -> Option<i64> {
        let raw = index.and_then(|i| self.field(i))?;
        raw.parse::<i64>()
            .ok()
            .or_else(|| Decimal::from_str(raw).ok().and_then(|d| d.to_i64()))
    }
}

/// Pipe-delimited data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Encoding flag.
    pub response_type: ResponseType,
    /// Channel the frame arrived on.
    pub channel: ChannelId,
    /// Record count declared in the envelope.
    pub record_count: u32,
    /// First record.
    pub tick: RawTick,
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Tick data.
    Data(DataFrame),
    /// Ack or keepalive.
    Control(ControlMessage),
}

// =============================================================================
// Offset Tables
// =============================================================================

/// Positions of quote fields within a channel's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldOffsets {
    /// Last price (required).
    pub price: usize,
    /// Change from previous close.
    pub change: Option<usize>,
    /// Accumulated volume.
    pub volume: Option<usize>,
    /// Accumulated trading value.
    pub trading_value: Option<usize>,
    /// Open interest.
    pub open_interest: Option<usize>,
    /// Open interest change.
    pub open_interest_change: Option<usize>,
    /// Theoretical price.
    pub theoretical_price: Option<usize>,
    /// Intrinsic value.
    pub intrinsic_value: Option<usize>,
    /// Time value.
    pub time_value: Option<usize>,
    /// Delta.
    pub delta: Option<usize>,
    /// Gamma.
    pub gamma: Option<usize>,
    /// Vega.
    pub vega: Option<usize>,
    /// Theta.
    pub theta: Option<usize>,
    /// Rho.
    pub rho: Option<usize>,
    /// Implied volatility.
    pub implied_volatility: Option<usize>,
    /// Underlying price.
    pub underlying_price: Option<usize>,
    /// Best ask price.
    pub ask_price: Option<usize>,
    /// Best bid price.
    pub bid_price: Option<usize>,
    /// Best ask size.
    pub ask_size: Option<usize>,
    /// Best bid size.
    pub bid_size: Option<usize>,
}

impl FieldOffsets {
    /// Index futures tick layout.
    pub const FUTURES_TICK: Self = Self {
        price: 5,
        change: Some(2),
        volume: Some(10),
        trading_value: Some(11),
        open_interest: Some(18),
        open_interest_change: Some(19),
        theoretical_price: None,
        intrinsic_value: None,
        time_value: None,
        delta: None,
        gamma: None,
        vega: None,
        theta: None,
        rho: None,
        implied_volatility: None,
        underlying_price: None,
        ask_price: Some(35),
        bid_price: Some(36),
        ask_size: Some(37),
        bid_size: Some(38),
    };

    /// Index options tick layout.
    pub const OPTIONS_TICK: Self = Self {
        price: 2,
        change: Some(4),
        volume: Some(10),
        trading_value: Some(11),
        open_interest: Some(13),
        open_interest_change: Some(14),
        theoretical_price: Some(12),
        intrinsic_value: Some(26),
        time_value: Some(27),
        delta: Some(28),
        gamma: Some(29),
        vega: Some(30),
        theta: Some(31),
        rho: Some(32),
        implied_volatility: Some(33),
        underlying_price: None,
        ask_price: Some(41),
        bid_price: Some(42),
        ask_size: Some(43),
        bid_size: Some(44),
    };

    /// Project a tick into a quote.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::MissingPrice`] if the price field is absent or
    /// unparseable. Every other field degrades to `None`.
    pub fn project(
        &self,
        tick: &RawTick,
        observed_at: DateTime<Utc>,
    ) -> Result<QuoteUpdate, CodecError> {
        let price = tick
            .decimal(Some(self.price))
            .ok_or_else(|| CodecError::MissingPrice {
                symbol: tick.symbol.clone(),
            })?;

        Ok(QuoteUpdate {
            symbol: tick.symbol.clone(),
            price,
            change: tick.decimal(self.change),
            volume: tick.unsigned(self.volume),
            trading_value: tick.decimal(self.trading_value),
            open_interest: tick.unsigned(self.open_interest),
            open_interest_change: tick.signed(self.open_interest_change),
            bid_price: tick.decimal(self.bid_price),
            ask_price: tick.decimal(self.ask_price),
            bid_size: tick.unsigned(self.bid_size),
            ask_size: tick.unsigned(self.ask_size),
            greeks: Greeks {
                delta: tick.decimal(self.delta),
                gamma: tick.decimal(self.gamma),
                vega: tick.decimal(self.vega),
                theta: tick.decimal(self.theta),
                rho: tick.decimal(self.rho),
            },
            implied_volatility: tick.decimal(self.implied_volatility),
            theoretical_price: tick.decimal(self.theoretical_price),
            intrinsic_value: tick.decimal(self.intrinsic_value),
            time_value: tick.decimal(self.time_value),
            underlying_price: tick.decimal(self.underlying_price),
            observed_at,
        })
    }
}

/// Field offsets keyed by channel.
#[derive(Debug, Clone)]
pub struct OffsetTable {
    by_channel: HashMap<ChannelId, FieldOffsets>,
}

impl Default for OffsetTable {
    fn default() -> Self {
        Self::empty()
            .with(DAY_FUTURES_CHANNEL, FieldOffsets::FUTURES_TICK)
            .with(NIGHT_FUTURES_CHANNEL, FieldOffsets::FUTURES_TICK)
            .with(DAY_OPTIONS_CHANNEL, FieldOffsets::OPTIONS_TICK)
            .with(NIGHT_OPTIONS_CHANNEL, FieldOffsets::OPTIONS_TICK)
    }
}

impl OffsetTable {
    /// Table with no channels.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            by_channel: HashMap::new(),
        }
    }

    /// Add or replace a channel layout.
    #[must_use]
    pub fn with(mut self, channel: impl Into<ChannelId>, offsets: FieldOffsets) -> Self {
        self.by_channel.insert(channel.into(), offsets);
        self
    }

    /// Layout for `channel`.
    #[must_use]
    pub fn get(&self, channel: &ChannelId) -> Option<&FieldOffsets> {
        self.by_channel.get(channel)
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Decoder for the KIS real-time socket.
#[derive(Debug, Clone)]
pub struct KisCodec {
    offsets: Arc<OffsetTable>,
}

impl Default for KisCodec {
    fn default() -> Self {
        Self::new(Arc::new(OffsetTable::default()))
    }
}

impl KisCodec {
    /// Create a codec over an offset table.
    #[must_use]
    pub const fn new(offsets: Arc<OffsetTable>) -> Self {
        Self { offsets }
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] for empty, malformed or truncated frames.
    pub fn decode(&self, text: &str) -> Result<InboundFrame, CodecError> {
        let text = text.trim();
        match text.chars().next() {
            None => Err(CodecError::Empty),
            Some('{') => Ok(InboundFrame::Control(ControlMessage::from_json(text)?)),
            Some(_) => decode_data(text).map(InboundFrame::Data),
        }
    }

    /// Project a data frame using its channel's offsets.
    ///
    /// # Errors
    ///
    /// Fails for channels without an offset table or frames without price.
    pub fn project(
        &self,
        frame: &DataFrame,
        observed_at: DateTime<Utc>,
    ) -> Result<QuoteUpdate, CodecError> {
        let offsets = self
            .offsets
            .get(&frame.channel)
            .ok_or_else(|| CodecError::UnknownChannel(frame.channel.clone()))?;
        offsets.project(&frame.tick, observed_at)
    }
}

fn decode_data(text: &str) -> Result<DataFrame, CodecError> {
    let parts: Vec<&str> = text.splitn(4, ENVELOPE_SEPARATOR).collect();
    let [flag, channel, count, payload] = parts.as_slice() else {
        return Err(CodecError::InvalidEnvelope(format!(
            "expected 4 segments, got {}",
            parts.len()
        )));
    };

    let response_type = match *flag {
        "0" => ResponseType::Plain,
        "1" => ResponseType::Encrypted,
        other => {
            return Err(CodecError::InvalidEnvelope(format!(
                "unknown response type {other:?}"
            )));
        }
    };
    if channel.is_empty() {
        return Err(CodecError::InvalidEnvelope("empty channel".to_string()));
    }
    let record_count = count
        .trim()
        .parse::<u32>()
        .map_err(|_| CodecError::InvalidEnvelope(format!("bad record count {count:?}")))?;

    let mut fields = payload.split(FIELD_SEPARATOR);
    let symbol = fields
        .next()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(CodecError::MissingSymbol)?
        .to_string();

    Ok(DataFrame {
        response_type,
        channel: ChannelId::new(*channel),
        record_count,
        tick: RawTick {
            symbol,
            fields: fields.map(str::to_string).collect(),
        },
    })
}
