#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! KOSPI Feed - Derivatives Real-Time Feed Gateway
//!
//! Keeps one KIS WebSocket connection per active real-time channel for
//! KOSPI200 futures and options, derives which contracts to stream from the
//! exchange calendar, and republishes normalized quotes to in-process
//! subscribers.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Calendar, session and instrument rules
//!   - `calendar`: Trading days and holidays
//!   - `session`: Market session state machine
//!   - `instrument` / `symbol_master`: Contract codes and the active universe
//!   - `quote`, `streaming`, `subscription`, `credential`: Value types
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Quote sink, snapshot loader, credential issuer, feed launcher
//!   - `services`: Feed supervisor, transition schedule, tracking sink
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `kis`: Credentials, wire codec, subscriber, connection, snapshot
//!   - `broadcast`: In-process quote fan-out
//!   - `config`: Configuration and dependency injection
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!  session clock ──► FeedSupervisor ──► KisFeedLauncher
//!                         │                   │
//!                    SymbolMaster       FeedConnection (one per channel)
//!                                             │  ticks
//!                                             ▼
//!                                    TrackingSink ──► QuoteBroadcast ──► subscribers
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Market rules and value types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::calendar::TradingCalendar;
pub use domain::instrument::{ExpiryMonth, InstrumentCode, InstrumentKind, OptionSide};
pub use domain::quote::{Greeks, GreeksZeroPolicy, QuoteUpdate};
pub use domain::session::{MarketSessionClock, MarketSessionState};
pub use domain::streaming::{ChannelId, ChannelPlan, ChannelSpec, ConnectionPhase, FeedStatus};
pub use domain::symbol_master::{SymbolMaster, SymbolMasterConfig};

// Ports and services
pub use application::ports::{
    FeedHandle, FeedLauncher, LaunchError, QuoteSink, SinkError, SnapshotError, SnapshotLoader,
    UpsertOutcome,
};
pub use application::services::{
    FeedSupervisor, SupervisorConfig, TrackingSink, TransitionReport, TransitionSchedule,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, FeedConfig};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Quote fan-out
pub use infrastructure::broadcast::{BroadcastStats, QuoteBroadcast, SharedQuoteBroadcast};

// KIS adapters (for integration tests)
pub use infrastructure::kis::{
    ConnectionConfig, ConnectionDeps, CredentialCache, CredentialStore, CredentialTtls,
    FeedConnection, HttpCredentialIssuer, KisCodec, KisFeedLauncher, KisSnapshotLoader,
    ReconnectConfig, SubscribePacing,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
