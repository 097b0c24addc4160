//! Feed Channels and Connection State
//!
//! A channel id names one real-time multiplex on the upstream feed (for
//! example day-session futures ticks). Which channels must be open depends
//! on the market session.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::instrument::InstrumentKind;
use super::session::MarketSessionState;
use super::subscription::BatchReport;

/// Day-session futures tick channel.
pub const DAY_FUTURES_CHANNEL: &str = "H0IFCNT0";
/// Day-session options tick channel.
pub const DAY_OPTIONS_CHANNEL: &str = "H0IOCNT0";
/// Night-session futures tick channel.
pub const NIGHT_FUTURES_CHANNEL: &str = "H0MFCNT0";
/// Night-session options tick channel.
pub const NIGHT_OPTIONS_CHANNEL: &str = "H0EUCNT0";

// =============================================================================
// Channels
// =============================================================================

/// Opaque upstream channel identifier (`tr_id`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Wrap a channel identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A channel and the instrument kind it carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelSpec {
    /// Channel identifier.
    pub id: ChannelId,
    /// Instruments streamed on this channel.
    pub kind: InstrumentKind,
}

impl ChannelSpec {
    /// Create a channel spec.
    pub fn new(id: impl Into<ChannelId>, kind: InstrumentKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }
}

/// Channels required per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPlan {
    /// Channels opened during the day session.
    pub day: Vec<ChannelSpec>,
    /// Channels opened during the night session.
    pub night: Vec<ChannelSpec>,
}

impl Default for ChannelPlan {
    fn default() -> Self {
        Self {
            day: vec![
                ChannelSpec::new(DAY_FUTURES_CHANNEL, InstrumentKind::Future),
                ChannelSpec::new(DAY_OPTIONS_CHANNEL, InstrumentKind::Option),
            ],
            night: vec![
                ChannelSpec::new(NIGHT_FUTURES_CHANNEL, InstrumentKind::Future),
                ChannelSpec::new(NIGHT_OPTIONS_CHANNEL, InstrumentKind::Option),
            ],
        }
    }
}

impl ChannelPlan {
    /// Channels that must be open in `state`.
    #[must_use]
    pub fn channels_for(&self, state: MarketSessionState) -> &[ChannelSpec] {
        match state {
            MarketSessionState::DaySession => &self.day,
            MarketSessionState::NightSession => &self.night,
            MarketSessionState::ClosedBetweenSessions
            | MarketSessionState::ClosedWeekend
            | MarketSessionState::ClosedHoliday => &[],
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Lifecycle phase of one feed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    /// Created, not yet started.
    #[default]
    Idle,
    /// Opening the transport.
    Connecting,
    /// Transport open, approval key in hand.
    Authenticating,
    /// Sending paced subscribe frames.
    SubscribingBatch,
    /// All subscribe frames sent; ticks flowing.
    Streaming,
    /// Teardown requested.
    Closing,
    /// Transport closed.
    Closed,
}

impl ConnectionPhase {
    /// Stable identifier for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::SubscribingBatch => "subscribing_batch",
            Self::Streaming => "streaming",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Whether the transport is up.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(
            self,
            Self::Authenticating | Self::SubscribingBatch | Self::Streaming
        )
    }
}

/// Point-in-time view of one feed connection.
#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    /// Channel served by the connection.
    pub channel: ChannelId,
    /// Current phase.
    pub phase: ConnectionPhase,
    /// Instruments requested on this channel.
    pub instruments: usize,
    /// Data frames projected into quotes.
    pub frames_parsed: u64,
    /// Frames dropped (malformed, unknown channel, encrypted).
    pub frames_dropped: u64,
    /// Reconnect attempts since activation.
    pub reconnects: u64,
    /// Last time a data frame was applied.
    pub last_frame_at: Option<DateTime<Utc>>,
    /// Outcome of the most recent subscription pass.
    pub last_batch: Option<BatchReport>,
}
