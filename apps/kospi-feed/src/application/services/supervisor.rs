//! Feed Supervisor
//!
//! Owns the set of live feed connections and reconciles it against the
//! market session on every transition: channels the session no longer needs
//! are closed, missing ones are launched, and channels whose instrument
//! universe moved are restarted.
//!
//! Launch failures are isolated per channel. A failed channel is simply
//! absent from the active set and is retried on the next transition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::schedule::TransitionSchedule;
use crate::application::ports::{
    FeedHandle, FeedLauncher, QuoteSink, SnapshotError, SnapshotLoader, UpsertOutcome,
};
use crate::domain::instrument::{InstrumentCode, InstrumentKind};
use crate::domain::session::{MarketSessionClock, MarketSessionState};
use crate::domain::streaming::{ChannelId, ChannelPlan, ChannelSpec, ConnectionPhase, FeedStatus};
use crate::domain::symbol_master::{SymbolError, SymbolMaster};
use crate::infrastructure::metrics::{set_active_connections, set_session_state};

/// Default look-ahead used when a trigger fires between sessions.
pub const DEFAULT_ACTIVATION_LEAD: Duration = Duration::from_secs(15 * 60);

/// Default pause between two channel launches.
pub const DEFAULT_ACTIVATION_STAGGER: Duration = Duration::from_secs(2);

// =============================================================================
// Configuration
// =============================================================================

/// Supervisor tunables.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Channels per session.
    pub plan: ChannelPlan,
    /// How far ahead a between-sessions trigger looks.
    pub activation_lead: Duration,
    /// Pause between consecutive launches.
    pub activation_stagger: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            plan: ChannelPlan::default(),
            activation_lead: DEFAULT_ACTIVATION_LEAD,
            activation_stagger: DEFAULT_ACTIVATION_STAGGER,
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// What one transition did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionReport {
    /// Session the supervisor prepared for.
    pub state: MarketSessionState,
    /// Channels launched.
    pub opened: Vec<ChannelId>,
    /// Channels torn down because the session no longer needs them.
    pub closed: Vec<ChannelId>,
    /// Channels left running untouched.
    pub kept: Vec<ChannelId>,
    /// Channels that could not be brought up, with the reason.
    pub failed: Vec<(ChannelId, String)>,
}

impl TransitionReport {
    const fn new(state: MarketSessionState) -> Self {
        Self {
            state,
            opened: Vec::new(),
            closed: Vec::new(),
            kept: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// What a snapshot seed applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    /// Snapshot date, when the historical fallback was used.
    pub fallback_date: Option<NaiveDate>,
    /// Quotes in the snapshot.
    pub loaded: usize,
    /// Quotes the sink stored.
    pub applied: usize,
}

// =============================================================================
// Supervisor
// =============================================================================

struct ActiveFeed {
    handle: Arc<dyn FeedHandle>,
    universe: Vec<InstrumentCode>,
}

/// Reconciles live feed connections with the market session.
pub struct FeedSupervisor {
    clock: Arc<MarketSessionClock>,
    symbols: Arc<SymbolMaster>,
    launcher: Arc<dyn FeedLauncher>,
    sink: Arc<dyn QuoteSink>,
    config: SupervisorConfig,
    active: RwLock<BTreeMap<ChannelId, ActiveFeed>>,
    transition_gate: Mutex<()>,
    last_state: RwLock<Option<MarketSessionState>>,
}

impl FeedSupervisor {
    /// Create a supervisor with nothing running.
    pub fn new(
        clock: Arc<MarketSessionClock>,
        symbols: Arc<SymbolMaster>,
        launcher: Arc<dyn FeedLauncher>,
        sink: Arc<dyn QuoteSink>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            clock,
            symbols,
            launcher,
            sink,
            config,
            active: RwLock::new(BTreeMap::new()),
            transition_gate: Mutex::new(()),
            last_state: RwLock::new(None),
        }
    }

    /// Reconcile against the session as of now.
    pub async fn on_session_transition(&self) -> TransitionReport {
        self.on_session_transition_at(self.clock.now_local()).await
    }

    /// Reconcile against the session as of exchange-local `local`.
    ///
    /// Transitions are serialized; a second caller waits for the first.
    pub async fn on_session_transition_at(&self, local: NaiveDateTime) -> TransitionReport {
        let _gate = self.transition_gate.lock().await;

        let lead = chrono::Duration::from_std(self.config.activation_lead)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let state = self.clock.upcoming_state(local, lead);
        *self.last_state.write() = Some(state);
        set_session_state(state);

        let required = self.config.plan.channels_for(state).to_vec();
        let mut report = TransitionReport::new(state);

        for feed in self.take_unneeded(&required) {
            feed.handle.close();
            report.closed.push(feed.handle.channel().clone());
        }

        let universe_date = (local + lead).date();
        let mut launched = 0usize;

        for spec in required {
            let universe = match self.universe_for(&spec, universe_date) {
                Ok(universe) => universe,
                Err(e) => {
                    tracing::warn!(channel = %spec.id, error = %e, "Cannot derive universe");
                    report.failed.push((spec.id.clone(), e.to_string()));
                    continue;
                }
            };
            self.sink.register_instruments(&universe);

            if let Some(previous) = self.take_replaceable(&spec.id, &universe) {
                previous.close();
            } else if self.active.read().contains_key(&spec.id) {
                report.kept.push(spec.id.clone());
                continue;
            }

            if launched > 0 && !self.config.activation_stagger.is_zero() {
                tokio::time::sleep(self.config.activation_stagger).await;
            }
            launched += 1;

            match self.launcher.launch(spec.clone(), universe.clone()).await {
                Ok(handle) => {
                    tracing::info!(
                        channel = %spec.id,
                        kind = spec.kind.as_str(),
                        instruments = universe.len(),
                        "Feed channel activated"
                    );
                    self.active
                        .write()
                        .insert(spec.id.clone(), ActiveFeed { handle, universe });
                    report.opened.push(spec.id);
                }
                Err(e) => {
                    tracing::warn!(
                        channel = %spec.id,
                        error = %e,
                        "Feed channel activation failed, will retry on next transition"
                    );
                    report.failed.push((spec.id, e.to_string()));
                }
            }
        }

        let active = self.active.read().len();
        set_active_connections(active);
        tracing::info!(
            state = state.as_str(),
            opened = report.opened.len(),
            closed = report.closed.len(),
            kept = report.kept.len(),
            failed = report.failed.len(),
            active,
            "Session transition applied"
        );
        report
    }

    /// Push a REST snapshot through the sink.
    ///
    /// Falls back to the previous trading day's closing snapshot when the
    /// current one is empty or unavailable. Futures prices in the snapshot
    /// update the underlying estimate.
    ///
    /// # Errors
    ///
    /// Fails only if the historical fallback fails as well.
    pub async fn seed_from_snapshot(
        &self,
        loader: &dyn SnapshotLoader,
    ) -> Result<SeedReport, SnapshotError> {
        let mut report = SeedReport::default();

        let quotes = match loader.load_current().await {
            Ok(quotes) if !quotes.is_empty() => quotes,
            current => {
                if let Err(e) = current {
                    tracing::warn!(error = %e, "Current snapshot unavailable");
                }
                let today = self.clock.now_local().date();
                let date = self.clock.calendar().previous_trading_day(today);
                tracing::info!(%date, "Seeding from previous trading day");
                report.fallback_date = Some(date);
                loader.load_historical(date).await?
            }
        };
        report.loaded = quotes.len();

        let codes: Vec<InstrumentCode> = quotes
            .iter()
            .filter_map(|q| InstrumentCode::parse(&q.symbol).ok())
            .collect();
        self.sink.register_instruments(&codes);

        for code in codes.iter().filter(|c| c.kind() == InstrumentKind::Future) {
            if let Some(quote) = quotes.iter().find(|q| q.symbol == code.code()) {
                self.symbols.observe_underlying(quote.price);
            }
        }

        for quote in quotes {
            let symbol = quote.symbol.clone();
            match self.sink.upsert(quote).await {
                Ok(UpsertOutcome::Applied) => report.applied += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!(%symbol, error = %e, "Snapshot upsert failed"),
            }
        }

        tracing::info!(
            loaded = report.loaded,
            applied = report.applied,
            fallback = report.fallback_date.is_some(),
            "Snapshot seeded"
        );
        Ok(report)
    }

    /// Status of every active channel.
    #[must_use]
    pub fn statuses(&self) -> Vec<FeedStatus> {
        self.active
            .read()
            .values()
            .map(|feed| feed.handle.status())
            .collect()
    }

    /// Session the supervisor last prepared for, or the clock's view if no
    /// transition has run yet.
    #[must_use]
    pub fn current_state(&self) -> MarketSessionState {
        (*self.last_state.read()).unwrap_or_else(|| self.clock.current_state())
    }

    /// Number of channels the current session calls for.
    #[must_use]
    pub fn required_channels(&self) -> usize {
        self.config.plan.channels_for(self.current_state()).len()
    }

    /// Close every connection.
    pub async fn shutdown(&self) {
        let _gate = self.transition_gate.lock().await;
        let feeds: Vec<ActiveFeed> = {
            let mut active = self.active.write();
            std::mem::take(&mut *active).into_values().collect()
        };
        for feed in &feeds {
            feed.handle.close();
        }
        set_active_connections(0);
        tracing::info!(closed = feeds.len(), "Feed supervisor shut down");
    }

    /// Fire [`Self::on_session_transition`] at every scheduled time until
    /// `cancel` fires.
    pub async fn run_schedule(&self, schedule: TransitionSchedule, cancel: CancellationToken) {
        loop {
            let now = self.clock.now_local();
            let Some(next) = schedule.next_trigger_after(now) else {
                tracing::warn!("Transition schedule is empty");
                cancel.cancelled().await;
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tracing::info!(next = %next, wait_secs = wait.as_secs(), "Next session transition");

            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Transition schedule stopped");
                    return;
                }
                () = tokio::time::sleep(wait) => {
                    self.on_session_transition().await;
                }
            }
        }
    }

    fn universe_for(
        &self,
        spec: &ChannelSpec,
        date: NaiveDate,
    ) -> Result<Vec<InstrumentCode>, SymbolError> {
        match spec.kind {
            InstrumentKind::Future => self.symbols.active_futures(date),
            InstrumentKind::Option => self.symbols.option_universe(date),
        }
    }

    /// Remove and return feeds not in `required`.
    fn take_unneeded(&self, required: &[ChannelSpec]) -> Vec<ActiveFeed> {
        let mut active = self.active.write();
        let stale: Vec<ChannelId> = active
            .keys()
            .filter(|id| !required.iter().any(|spec| &spec.id == *id))
            .cloned()
            .collect();
        stale.into_iter().filter_map(|id| active.remove(&id)).collect()
    }

    /// If `channel` is active but must be replaced, remove it and return its
    /// handle. A channel is replaced when its universe changed or its
    /// connection has stopped.
    fn take_replaceable(
        &self,
        channel: &ChannelId,
        universe: &[InstrumentCode],
    ) -> Option<Arc<dyn FeedHandle>> {
        let mut active = self.active.write();
        let feed = active.get(channel)?;
        let stopped = feed.handle.status().phase == ConnectionPhase::Closed;
        let moved = feed.universe != universe;
        if !stopped && !moved {
            return None;
        }
        tracing::info!(%channel, stopped, universe_changed = moved, "Restarting feed channel");
        active.remove(channel).map(|feed| feed.handle)
    }
}

// =============================================================================
// Tests
// =============================================================================
