//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `QuoteSink`: Idempotent quote store keyed by instrument code
//! - `SnapshotLoader`: REST snapshot source for initial/fallback population
//! - `CredentialIssuer`: Broker endpoint issuing tokens and approval keys
//! - `FeedLauncher`: Opens one real-time connection per channel

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::domain::credential::CredentialKind;
use crate::domain::instrument::InstrumentCode;
use crate::domain::quote::QuoteUpdate;
use crate::domain::streaming::{ChannelId, ChannelSpec, FeedStatus};

// =============================================================================
// Quote Sink
// =============================================================================

/// Result of applying one quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The quote was stored.
    Applied,
    /// The symbol is not part of the known universe; nothing was stored.
    UnknownSymbol,
}

/// Errors from a quote sink.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    /// Backing store rejected the write.
    #[error("storage error: {0}")]
    Storage(String),
    /// The sink is shut down.
    #[error("sink closed")]
    Closed,
}

/// Destination for normalized quotes.
///
/// Implementations must treat repeated upserts for a symbol as overwrites.
#[async_trait]
pub trait QuoteSink: Send + Sync {
    /// Apply one quote.
    async fn upsert(&self, update: QuoteUpdate) -> Result<UpsertOutcome, SinkError>;

    /// Announce the instruments about to be streamed.
    fn register_instruments(&self, _instruments: &[InstrumentCode]) {}
}

// =============================================================================
// Snapshot Loader
// =============================================================================

/// Errors from a snapshot source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SnapshotError {
    /// Upstream request failed.
    #[error("snapshot request failed: {0}")]
    Request(String),
    /// No data for the requested date.
    #[error("no snapshot for {0}")]
    NotFound(NaiveDate),
}

/// REST snapshot source used to seed quotes when the feed is silent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    /// Latest quotes for the current universe.
    async fn load_current(&self) -> Result<Vec<QuoteUpdate>, SnapshotError>;

    /// Closing quotes for a past trading date.
    async fn load_historical(&self, date: NaiveDate) -> Result<Vec<QuoteUpdate>, SnapshotError>;
}

// =============================================================================
// Credential Issuer
// =============================================================================

/// A credential as returned by the issuing endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCredential {
    /// Secret value.
    pub value: String,
    /// Lifetime reported by the issuer, if any.
    pub ttl: Option<Duration>,
}

impl std::fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("value", &"[REDACTED]")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Errors from the credential endpoint.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IssueError {
    /// Upstream throttled the request.
    #[error("credential issuance rate limited: {0}")]
    RateLimited(String),
    /// Upstream answered with an error status.
    #[error("credential issuance rejected with status {status}: {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// Request could not be sent or the body could not be read.
    #[error("credential request failed: {0}")]
    Network(String),
    /// Response did not contain a credential.
    #[error("malformed credential response: {0}")]
    Malformed(String),
}

impl IssueError {
    /// Whether the failure is upstream throttling.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }
}

/// Broker endpoint issuing session credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Request a fresh credential of `kind`.
    async fn issue(&self, kind: CredentialKind) -> Result<IssuedCredential, IssueError>;
}

// =============================================================================
// Feed Launcher
// =============================================================================

/// Errors raised while bringing a channel up.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LaunchError {
    /// No usable approval key.
    #[error("credential unavailable: {0}")]
    Credential(String),
    /// Transport could not be opened.
    #[error("transport failed: {0}")]
    Transport(String),
    /// Transport did not open in time.
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
}

/// A live feed connection owned by the supervisor.
pub trait FeedHandle: Send + Sync {
    /// Channel served.
    fn channel(&self) -> &ChannelId;

    /// Instruments requested on the channel.
    fn instruments(&self) -> Vec<InstrumentCode>;

    /// Current status snapshot.
    fn status(&self) -> FeedStatus;

    /// Request teardown. The connection must not reconnect afterwards.
    fn close(&self);
}

/// Opens feed connections.
#[async_trait]
pub trait FeedLauncher: Send + Sync {
    /// Connect `channel` and start subscribing `instruments`.
    ///
    /// Returns once the transport is open; subscription continues in the
    /// background.
    async fn launch(
        &self,
        channel: ChannelSpec,
        instruments: Vec<InstrumentCode>,
    ) -> Result<Arc<dyn FeedHandle>, LaunchError>;
}
