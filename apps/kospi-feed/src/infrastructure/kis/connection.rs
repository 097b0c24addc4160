//! Feed Connection
//!
//! One WebSocket connection serving one channel. Owns its reconnect loop,
//! its subscription pass and its stats.
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Connecting → Authenticating → SubscribingBatch → Streaming
//!            ▲                                               │
//!            └──────── Closed ◄── (transport lost) ◄─────────┘
//!
//! close(): any phase → Closing → Closed (never reconnects)
//! ```
//!
//! Three tasks run per transport session: the reader (this connection's run
//! loop), a writer draining the outbound queue, and the subscriber sending
//! paced subscribe frames. The reader never waits on subscription.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{InboundFrame, KisCodec, ResponseType};
use super::credentials::{CredentialCache, CredentialError};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::subscriber::{AckRegistry, BatchSubscriber, SubscribePacing};
use crate::application::ports::{FeedHandle, LaunchError, QuoteSink, UpsertOutcome};
use crate::domain::credential::CredentialKind;
use crate::domain::instrument::InstrumentCode;
use crate::domain::quote::GreeksZeroPolicy;
use crate::domain::session::MarketSessionClock;
use crate::domain::streaming::{ChannelId, ChannelSpec, ConnectionPhase, FeedStatus};
use crate::domain::subscription::BatchReport;
use crate::infrastructure::metrics::{
    QuoteOutcome, record_frame_dropped, record_frame_latency, record_frame_received,
    record_quote_upsert, record_reconnect,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

// =============================================================================
// Error Type
// =============================================================================

/// Errors that end a transport session.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// No approval key available.
    #[error("approval key unavailable: {0}")]
    Credential(#[from] CredentialError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport did not open in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Peer closed the transport.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<ConnectionError> for LaunchError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Credential(e) => Self::Credential(e.to_string()),
            ConnectionError::ConnectTimeout(timeout) => Self::Timeout(timeout),
            other => Self::Transport(other.to_string()),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Settings shared by every feed connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Real-time endpoint, without query string.
    pub ws_url: String,
    /// Customer type sent with every request.
    pub custtype: String,
    /// Limit on opening the transport.
    pub connect_timeout: Duration,
    /// Subscription pacing.
    pub pacing: SubscribePacing,
    /// Delay schedule between reconnects.
    pub reconnect: ReconnectConfig,
    /// Upstream cap on subscriptions per connection.
    pub max_subscriptions: usize,
    /// Interpretation of zero greeks.
    pub greeks_policy: GreeksZeroPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://ops.koreainvestment.com:21000".to_string(),
            custtype: "P".to_string(),
            connect_timeout: Duration::from_secs(10),
            pacing: SubscribePacing::default(),
            reconnect: ReconnectConfig::default(),
            max_subscriptions: 40,
            greeks_policy: GreeksZeroPolicy::default(),
        }
    }
}

// =============================================================================
// Connection
// =============================================================================

#[derive(Debug, Default)]
struct ConnectionStats {
    frames_parsed: AtomicU64,
    frames_dropped: AtomicU64,
    reconnects: AtomicU64,
}

/// Shared collaborators of a connection.
#[derive(Clone)]
pub struct ConnectionDeps {
    /// Approval key source.
    pub credentials: Arc<CredentialCache>,
    /// Destination for projected quotes.
    pub sink: Arc<dyn QuoteSink>,
    /// Frame decoder.
    pub codec: KisCodec,
    /// Session clock, consulted by the greeks policy.
    pub clock: Arc<MarketSessionClock>,
}

/// One channel's real-time connection.
pub struct FeedConnection {
    channel: ChannelSpec,
    instruments: Vec<InstrumentCode>,
    config: ConnectionConfig,
    deps: ConnectionDeps,
    acks: AckRegistry,
    phase: RwLock<ConnectionPhase>,
    stats: ConnectionStats,
    last_frame_at: RwLock<Option<DateTime<Utc>>>,
    last_batch: RwLock<Option<BatchReport>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for FeedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedConnection")
            .field("channel", &self.channel.id)
            .field("instruments", &self.instruments.len())
            .field("phase", &*self.phase.read())
            .finish_non_exhaustive()
    }
}

impl FeedConnection {
    /// Create an idle connection. Instruments beyond the subscription cap
    /// are dropped with a warning.
    #[must_use]
    pub fn new(
        channel: ChannelSpec,
        mut instruments: Vec<InstrumentCode>,
        config: ConnectionConfig,
        deps: ConnectionDeps,
    ) -> Self {
        if config.max_subscriptions > 0 && instruments.len() > config.max_subscriptions {
            tracing::warn!(
                channel = %channel.id,
                requested = instruments.len(),
                cap = config.max_subscriptions,
                "Instrument list exceeds per-connection subscription cap, truncating"
            );
            instruments.truncate(config.max_subscriptions);
        }

        Self {
            channel,
            instruments,
            config,
            deps,
            acks: AckRegistry::new(),
            phase: RwLock::new(ConnectionPhase::Idle),
            stats: ConnectionStats::default(),
            last_frame_at: RwLock::new(None),
            last_batch: RwLock::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Open the transport, then hand the connection to its own task.
    ///
    /// # Errors
    ///
    /// Returns the first connect failure; the connection is left closed.
    pub async fn activate(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let session = match self.open().await {
            Ok(session) => session,
            Err(e) => {
                self.set_phase(ConnectionPhase::Closed);
                return Err(e);
            }
        };

        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(Some(session)).await });
        Ok(())
    }

    /// Reconnect loop. Runs until closed or reconnect attempts run out.
    async fn run(self: Arc<Self>, mut first: Option<(WsStream, String)>) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let session = match first.take() {
                Some(session) => Ok(session),
                None => self.open().await,
            };

            let result = match session {
                Ok((ws, approval_key)) => {
                    policy.reset();
                    self.stream_session(ws, approval_key).await
                }
                Err(e) => Err(e),
            };

            if self.cancel.is_cancelled() {
                break;
            }

            let error = match result {
                Ok(()) => break,
                Err(e) => e,
            };
            self.set_phase(ConnectionPhase::Closed);
            tracing::warn!(channel = %self.channel.id, error = %error, "Feed connection lost");

            let Some(delay) = policy.next_delay() else {
                tracing::error!(
                    channel = %self.channel.id,
                    attempts = policy.attempt_count(),
                    "Reconnect attempts exhausted, giving up"
                );
                break;
            };

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            record_reconnect(self.channel.id.as_str());
            tracing::info!(
                channel = %self.channel.id,
                attempt = policy.attempt_count(),
                delay_ms = delay.as_millis(),
                "Reconnecting feed"
            );

            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.acks.clear();
        self.set_phase(ConnectionPhase::Closed);
        tracing::info!(channel = %self.channel.id, "Feed connection stopped");
    }

    async fn open(&self) -> Result<(WsStream, String), ConnectionError> {
        self.set_phase(ConnectionPhase::Connecting);
        let approval_key = self.deps.credentials.approval_key().await?;

        tracing::info!(
            channel = %self.channel.id,
            url = %self.config.ws_url,
            instruments = self.instruments.len(),
            "Connecting feed"
        );
        let url = format!(
            "{}?approval_key={}&custtype={}&tr_type=1&content-type=utf-8",
            self.config.ws_url,
            approval_key.value(),
            self.config.custtype
        );

        let (ws, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async(url),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout(self.config.connect_timeout))??;

        self.set_phase(ConnectionPhase::Authenticating);
        Ok((ws, approval_key.value().to_string()))
    }

    /// Run one transport session until it drops or the connection closes.
    async fn stream_session(
        self: &Arc<Self>,
        ws: WsStream,
        approval_key: String,
    ) -> Result<(), ConnectionError> {
        let (mut write, mut read) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        let session_cancel = self.cancel.child_token();

        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                write.send(message).await?;
            }
            write.close().await
        });

        let subscriber = {
            let this = Arc::clone(self);
            let outbound = out_tx.clone();
            let cancel = session_cancel.clone();
            tokio::spawn(async move {
                this.set_phase(ConnectionPhase::SubscribingBatch);
                let report = BatchSubscriber::new(
                    &this.channel.id,
                    &approval_key,
                    &this.config.custtype,
                    this.config.pacing,
                    &this.acks,
                )
                .subscribe_all(&outbound, &this.instruments, &cancel)
                .await;
                if !cancel.is_cancelled() {
                    this.set_phase(ConnectionPhase::Streaming);
                }
                *this.last_batch.write() = Some(report);
            })
        };

        let result = loop {
            tokio::select! {
                () = session_cancel.cancelled() => break Ok(()),
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_text(text.as_str(), &out_tx).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if out_tx.send(Message::Pong(data)).await.is_err() {
                            break Err(ConnectionError::ConnectionClosed);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(channel = %self.channel.id, frame = ?frame, "Server sent close frame");
                        break Err(ConnectionError::ConnectionClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                    None => break Err(ConnectionError::ConnectionClosed),
                },
            }
        };

        session_cancel.cancel();
        self.acks.clear();
        if let Err(e) = subscriber.await {
            tracing::warn!(channel = %self.channel.id, error = %e, "Subscriber task failed");
        }
        drop(out_tx);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(channel = %self.channel.id, error = %e, "Writer closed with error"),
            Err(e) => tracing::warn!(channel = %self.channel.id, error = %e, "Writer task failed"),
        }

        result
    }

    async fn handle_text(&self, text: &str, outbound: &mpsc::Sender<Message>) {
        let started = Instant::now();
        let channel = self.channel.id.as_str();

        let frame = match self.deps.codec.decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(channel, error = %e, "Dropping undecodable frame");
                self.drop_frame(e.reason());
                return;
            }
        };

        let data = match frame {
            InboundFrame::Control(control) => {
                if control.is_pingpong() {
                    tracing::trace!(channel, "Echoing keepalive");
                    let _ = outbound.send(Message::text(text.to_string())).await;
                } else if let Some((key, outcome)) = control.ack() {
                    if outcome.is_invalid_approval() {
                        tracing::warn!(channel, symbol = key, "Approval key rejected, discarding cached key");
                        self.deps.credentials.invalidate(CredentialKind::ApprovalKey).await;
                    }
                    if !self.acks.resolve(key, outcome) {
                        tracing::debug!(channel, symbol = key, "Ack with no waiter");
                    }
                }
                return;
            }
            InboundFrame::Data(data) => data,
        };

        record_frame_received(data.channel.as_str());
        if data.response_type == ResponseType::Encrypted {
            self.drop_frame("encrypted");
            return;
        }

        let mut quote = match self.deps.codec.project(&data, Utc::now()) {
            Ok(quote) => quote,
            Err(e) => {
                tracing::debug!(channel, error = %e, "Dropping unparseable frame");
                self.drop_frame(e.reason());
                return;
            }
        };
        quote.greeks = self
            .config
            .greeks_policy
            .apply(quote.greeks, self.deps.clock.current_state().is_open());

        self.stats.frames_parsed.fetch_add(1, Ordering::Relaxed);
        *self.last_frame_at.write() = Some(quote.observed_at);

        let symbol = quote.symbol.clone();
        match self.deps.sink.upsert(quote).await {
            Ok(UpsertOutcome::Applied) => record_quote_upsert(QuoteOutcome::Applied),
            Ok(UpsertOutcome::UnknownSymbol) => {
                tracing::warn!(channel, symbol = %symbol, "Quote for unknown symbol");
                record_quote_upsert(QuoteOutcome::UnknownSymbol);
            }
            Err(e) => {
                tracing::warn!(channel, symbol = %symbol, error = %e, "Quote sink rejected update");
                record_quote_upsert(QuoteOutcome::Failed);
            }
        }
        record_frame_latency(channel, started.elapsed());
    }

    fn drop_frame(&self, reason: &'static str) {
        self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        record_frame_dropped(self.channel.id.as_str(), reason);
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        let mut current = self.phase.write();
        // closing is terminal apart from the final Closed
        if *current == ConnectionPhase::Closing && phase != ConnectionPhase::Closed {
            return;
        }
        if *current != phase {
            tracing::debug!(channel = %self.channel.id, from = current.as_str(), to = phase.as_str(), "Phase change");
            *current = phase;
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        *self.phase.read()
    }

    /// Outcome of the latest subscription pass.
    #[must_use]
    pub fn last_batch(&self) -> Option<BatchReport> {
        self.last_batch.read().clone()
    }

    /// Whether teardown was requested.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl FeedHandle for FeedConnection {
    fn channel(&self) -> &ChannelId {
        &self.channel.id
    }

    fn instruments(&self) -> Vec<InstrumentCode> {
        self.instruments.clone()
    }

    fn status(&self) -> FeedStatus {
        FeedStatus {
            channel: self.channel.id.clone(),
            phase: self.phase(),
            instruments: self.instruments.len(),
            frames_parsed: self.stats.frames_parsed.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            last_frame_at: *self.last_frame_at.read(),
            last_batch: self.last_batch(),
        }
    }

    fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::info!(channel = %self.channel.id, "Closing feed connection");
        self.set_phase(ConnectionPhase::Closing);
        self.cancel.cancel();
    }
}
