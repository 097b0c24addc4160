//! Prometheus Metrics Module
//!
//! Exposes feed metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: Data frames received and dropped per channel
//! - **Quotes**: Upsert outcomes at the sink
//! - **Subscriptions**: Subscribe results per channel
//! - **Connections**: Active connections, reconnects, session state
//! - **Credentials**: Credential lookups by tier
//! - **Latency**: Frame processing time
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::domain::session::MarketSessionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "kospi_feed_frames_received_total",
        "Data frames received per channel"
    );
    describe_counter!(
        "kospi_feed_frames_dropped_total",
        "Frames dropped per channel and reason"
    );
    describe_counter!(
        "kospi_feed_quotes_upserted_total",
        "Quote upserts by outcome"
    );
    describe_counter!(
        "kospi_feed_subscriptions_total",
        "Subscribe requests by channel and result"
    );
    describe_counter!(
        "kospi_feed_reconnects_total",
        "Reconnect attempts per channel"
    );
    describe_counter!(
        "kospi_feed_credential_lookups_total",
        "Credential lookups by kind and serving tier"
    );

    describe_gauge!(
        "kospi_feed_active_connections",
        "Feed connections currently owned by the supervisor"
    );
    describe_gauge!(
        "kospi_feed_session_open",
        "1 while a trading session is open, labelled by state"
    );

    describe_histogram!(
        "kospi_feed_frame_processing_seconds",
        "Time from frame receipt to sink upsert"
    );
}

// =============================================================================
// Labels
// =============================================================================

/// Sink outcome label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteOutcome {
    /// Stored.
    Applied,
    /// Symbol outside the registered universe.
    UnknownSymbol,
    /// Sink error.
    Failed,
}

impl QuoteOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::UnknownSymbol => "unknown_symbol",
            Self::Failed => "failed",
        }
    }
}

/// Subscription result label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionResult {
    /// Acknowledged.
    Acked,
    /// Upstream rejected.
    Rejected,
    /// No ack in time.
    Timeout,
    /// Send failure or abandoned.
    Failed,
}

impl SubscriptionResult {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Failed => "failed",
        }
    }
}

/// Tier that served a credential lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Memory tier.
    Memory,
    /// File tier.
    File,
    /// Freshly issued.
    Issued,
    /// Expired file credential served while throttled.
    StaleFallback,
    /// Nothing could be served.
    Failed,
}

impl CredentialSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::File => "file",
            Self::Issued => "issued",
            Self::StaleFallback => "stale_fallback",
            Self::Failed => "failed",
        }
    }
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a data frame received on a channel.
pub fn record_frame_received(channel: &str) {
    counter!(
        "kospi_feed_frames_received_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record a dropped frame.
pub fn record_frame_dropped(channel: &str, reason: &'static str) {
    counter!(
        "kospi_feed_frames_dropped_total",
        "channel" => channel.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Record a sink upsert.
pub fn record_quote_upsert(outcome: QuoteOutcome) {
    counter!(
        "kospi_feed_quotes_upserted_total",
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

/// Record a resolved subscription.
pub fn record_subscription(channel: &str, result: SubscriptionResult) {
    counter!(
        "kospi_feed_subscriptions_total",
        "channel" => channel.to_string(),
        "result" => result.as_str()
    )
    .increment(1);
}

/// Record a reconnect attempt.
pub fn record_reconnect(channel: &str) {
    counter!(
        "kospi_feed_reconnects_total",
        "channel" => channel.to_string()
    )
    .increment(1);
}

/// Record which tier served a credential.
pub fn record_credential_lookup(kind: &'static str, source: CredentialSource) {
    counter!(
        "kospi_feed_credential_lookups_total",
        "kind" => kind,
        "source" => source.as_str()
    )
    .increment(1);
}

/// Update the active connection count.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_connections(count: usize) {
    gauge!("kospi_feed_active_connections").set(count as f64);
}

/// Publish the current session state.
pub fn set_session_state(state: MarketSessionState) {
    gauge!(
        "kospi_feed_session_open",
        "state" => state.as_str()
    )
    .set(if state.is_open() { 1.0 } else { 0.0 });
}

/// Record frame processing duration.
pub fn record_frame_latency(channel: &str, duration: Duration) {
    histogram!(
        "kospi_feed_frame_processing_seconds",
        "channel" => channel.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_values() {
        assert_eq!(QuoteOutcome::UnknownSymbol.as_str(), "unknown_symbol");
        assert_eq!(SubscriptionResult::Timeout.as_str(), "timeout");
        assert_eq!(CredentialSource::StaleFallback.as_str(), "stale_fallback");
    }

    #[test]
    fn recording_without_recorder_is_a_no_op() {
        record_frame_received("H0IFCNT0");
        record_frame_dropped("H0IFCNT0", "encrypted");
        record_quote_upsert(QuoteOutcome::Applied);
        set_active_connections(2);
        set_session_state(MarketSessionState::DaySession);
        record_frame_latency("H0IFCNT0", Duration::from_micros(40));
    }
}
