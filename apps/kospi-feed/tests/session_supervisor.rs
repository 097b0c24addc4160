//! Session Supervisor Integration Tests
//!
//! Drives a `FeedSupervisor` through a trading week with a scripted
//! launcher, a snapshot seed and the health endpoint on a real socket.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio::net::TcpListener;

use kospi_feed::domain::streaming::{
    DAY_FUTURES_CHANNEL, DAY_OPTIONS_CHANNEL, NIGHT_FUTURES_CHANNEL, NIGHT_OPTIONS_CHANNEL,
};
use kospi_feed::{
    ChannelId, ChannelSpec, ConnectionPhase, FeedHandle, FeedLauncher, FeedStatus, FeedSupervisor,
    HealthServer, HealthServerState, InstrumentCode, LaunchError, MarketSessionClock,
    MarketSessionState, QuoteBroadcast, QuoteSink, QuoteUpdate, SnapshotError, SnapshotLoader,
    SupervisorConfig, SymbolMaster, SymbolMasterConfig, TrackingSink, TradingCalendar,
};

// =============================================================================
// Fakes
// =============================================================================

struct ScriptedHandle {
    channel: ChannelId,
    instruments: Vec<InstrumentCode>,
    phase: Mutex<ConnectionPhase>,
}

impl FeedHandle for ScriptedHandle {
    fn channel(&self) -> &ChannelId {
        &self.channel
    }

    fn instruments(&self) -> Vec<InstrumentCode> {
        self.instruments.clone()
    }

    fn status(&self) -> FeedStatus {
        FeedStatus {
            channel: self.channel.clone(),
            phase: *self.phase.lock(),
            instruments: self.instruments.len(),
            frames_parsed: 0,
            frames_dropped: 0,
            reconnects: 0,
            last_frame_at: None,
            last_batch: None,
        }
    }

    fn close(&self) {
        *self.phase.lock() = ConnectionPhase::Closed;
    }
}

#[derive(Default)]
struct ScriptedLauncher {
    refuse: Mutex<HashSet<String>>,
    launched: Mutex<Vec<Arc<ScriptedHandle>>>,
}

impl ScriptedLauncher {
    fn launched_on(&self, channel: &str) -> Vec<Arc<ScriptedHandle>> {
        self.launched
            .lock()
            .iter()
            .filter(|h| h.channel.as_str() == channel)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl FeedLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        channel: ChannelSpec,
        instruments: Vec<InstrumentCode>,
    ) -> Result<Arc<dyn FeedHandle>, LaunchError> {
        if self.refuse.lock().contains(channel.id.as_str()) {
            return Err(LaunchError::Transport("connection refused".into()));
        }
        let handle = Arc::new(ScriptedHandle {
            channel: channel.id,
            instruments,
            phase: Mutex::new(ConnectionPhase::Streaming),
        });
        self.launched.lock().push(Arc::clone(&handle));
        Ok(handle)
    }
}

struct FixedSnapshot {
    current: Vec<QuoteUpdate>,
    historical_requests: Mutex<Vec<NaiveDate>>,
}

#[async_trait]
impl SnapshotLoader for FixedSnapshot {
    async fn load_current(&self) -> Result<Vec<QuoteUpdate>, SnapshotError> {
        Ok(self.current.clone())
    }

    async fn load_historical(&self, date: NaiveDate) -> Result<Vec<QuoteUpdate>, SnapshotError> {
        self.historical_requests.lock().push(date);
        Err(SnapshotError::NotFound(date))
    }
}

// =============================================================================
// Fixtures
// =============================================================================

struct Desk {
    supervisor: Arc<FeedSupervisor>,
    launcher: Arc<ScriptedLauncher>,
    symbols: Arc<SymbolMaster>,
    broadcast: Arc<QuoteBroadcast>,
    sink: Arc<dyn QuoteSink>,
}

fn desk(config: SupervisorConfig) -> Desk {
    let calendar = Arc::new(TradingCalendar::new([]));
    let clock = Arc::new(MarketSessionClock::new(calendar));
    let symbols = Arc::new(SymbolMaster::new(SymbolMasterConfig::default()));
    let broadcast = Arc::new(QuoteBroadcast::new(64));
    let sink: Arc<dyn QuoteSink> = Arc::new(TrackingSink::new(
        Arc::clone(&broadcast) as Arc<dyn QuoteSink>,
        Arc::clone(&symbols),
    ));
    let launcher = Arc::new(ScriptedLauncher::default());
    let supervisor = Arc::new(FeedSupervisor::new(
        clock,
        Arc::clone(&symbols),
        Arc::clone(&launcher) as Arc<dyn FeedLauncher>,
        Arc::clone(&sink),
        config,
    ));
    Desk {
        supervisor,
        launcher,
        symbols,
        broadcast,
        sink,
    }
}

// 2026-03-16 is a Monday
fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 3, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

fn names(channels: &[ChannelId]) -> Vec<&str> {
    channels.iter().map(ChannelId::as_str).collect()
}

// =============================================================================
// Trading week
// =============================================================================

#[tokio::test(start_paused = true)]
async fn seeded_week_follows_the_session_clock() {
    let d = desk(SupervisorConfig::default());
    let monday = at(16, 0, 0).date();

    let futures = d.symbols.active_futures(monday).unwrap().remove(0);
    let mut option = QuoteUpdate::new(
        d.symbols.option_universe(monday).unwrap()[0].code(),
        dec!(4.2),
        Utc::now(),
    );
    option.implied_volatility = Some(dec!(18.5));
    let loader = FixedSnapshot {
        current: vec![QuoteUpdate::new(futures.code(), dec!(600.1), Utc::now()), option],
        historical_requests: Mutex::new(Vec::new()),
    };

    let seed = d.supervisor.seed_from_snapshot(&loader).await.unwrap();
    assert_eq!(seed.fallback_date, None);
    assert_eq!(seed.applied, 2);
    assert!(loader.historical_requests.lock().is_empty());
    assert_eq!(d.symbols.underlying_estimate(), dec!(600.1));

    // pre-open: day channels on the seeded universe
    let report = d.supervisor.on_session_transition_at(at(16, 8, 40)).await;
    assert_eq!(report.state, MarketSessionState::DaySession);
    assert_eq!(names(&report.opened), vec![DAY_FUTURES_CHANNEL, DAY_OPTIONS_CHANNEL]);
    let day_options = d.launcher.launched_on(DAY_OPTIONS_CHANNEL);
    assert_eq!(day_options[0].instruments, d.symbols.option_universe(monday).unwrap());
    assert_eq!(d.supervisor.required_channels(), 2);

    // a live futures tick moves the market far enough to re-center options
    d.sink
        .upsert(QuoteUpdate::new(futures.code(), dec!(612.4), Utc::now()))
        .await
        .unwrap();
    assert_eq!(d.symbols.underlying_estimate(), dec!(612.4));
    assert_eq!(d.broadcast.latest(futures.code()).unwrap().price, dec!(612.4));

    let report = d.supervisor.on_session_transition_at(at(16, 12, 0)).await;
    assert_eq!(names(&report.kept), vec![DAY_FUTURES_CHANNEL]);
    assert_eq!(names(&report.opened), vec![DAY_OPTIONS_CHANNEL]);
    let day_options = d.launcher.launched_on(DAY_OPTIONS_CHANNEL);
    assert_eq!(day_options.len(), 2);
    assert_eq!(*day_options[0].phase.lock(), ConnectionPhase::Closed);
    assert_ne!(day_options[0].instruments, day_options[1].instruments);

    // evening: day closes, night opens
    let report = d.supervisor.on_session_transition_at(at(16, 17, 55)).await;
    assert_eq!(report.state, MarketSessionState::NightSession);
    assert_eq!(report.closed.len(), 2);
    assert_eq!(names(&report.opened), vec![NIGHT_FUTURES_CHANNEL, NIGHT_OPTIONS_CHANNEL]);

    // Friday night carries into Saturday morning, then the weekend closes it
    let report = d.supervisor.on_session_transition_at(at(20, 17, 55)).await;
    assert_eq!(report.state, MarketSessionState::NightSession);
    assert_eq!(report.kept.len(), 2);

    let report = d.supervisor.on_session_transition_at(at(21, 8, 40)).await;
    assert_eq!(report.state, MarketSessionState::ClosedWeekend);
    assert!(report.opened.is_empty());
    assert_eq!(report.closed.len(), 2);
    assert!(d.supervisor.statuses().is_empty());
    assert_eq!(d.supervisor.required_channels(), 0);
}

#[tokio::test(start_paused = true)]
async fn refused_channel_does_not_block_its_sibling() {
    let d = desk(SupervisorConfig::default());
    d.launcher
        .refuse
        .lock()
        .insert(DAY_OPTIONS_CHANNEL.to_string());

    let report = d.supervisor.on_session_transition_at(at(17, 8, 40)).await;
    assert_eq!(names(&report.opened), vec![DAY_FUTURES_CHANNEL]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0.as_str(), DAY_OPTIONS_CHANNEL);

    d.launcher.refuse.lock().clear();
    let report = d.supervisor.on_session_transition_at(at(17, 9, 30)).await;
    assert_eq!(names(&report.kept), vec![DAY_FUTURES_CHANNEL]);
    assert_eq!(names(&report.opened), vec![DAY_OPTIONS_CHANNEL]);
    assert_eq!(d.supervisor.statuses().len(), 2);
}

// =============================================================================
// Health endpoint
// =============================================================================

async fn serve_health(d: &Desk) -> String {
    let state = Arc::new(HealthServerState::new(
        "test".to_string(),
        Arc::clone(&d.supervisor),
        Arc::clone(&d.broadcast),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, HealthServer::router(state)).await.unwrap();
    });
    base
}

async fn get(client: &reqwest::Client, url: &str) -> (u16, String) {
    let response = client.get(url).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.text().await.unwrap())
}

#[tokio::test]
async fn health_tracks_connected_channels() {
    let d = desk(SupervisorConfig {
        activation_stagger: Duration::ZERO,
        ..SupervisorConfig::default()
    });
    d.launcher
        .refuse
        .lock()
        .insert(DAY_OPTIONS_CHANNEL.to_string());
    d.supervisor.on_session_transition_at(at(18, 10, 0)).await;

    let base = serve_health(&d).await;
    let client = reqwest::Client::new();

    let (code, body) = get(&client, &format!("{base}/health")).await;
    assert_eq!(code, 200);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["version"], "test");
    assert_eq!(body["session"]["state"], "day_session");
    assert_eq!(body["session"]["required_channels"], 2);
    assert_eq!(body["session"]["connected_channels"], 1);
    assert_eq!(body["feeds"].as_array().unwrap().len(), 1);

    let (code, body) = get(&client, &format!("{base}/readyz")).await;
    assert_eq!((code, body.as_str()), (200, "READY"));

    // nothing connected during an open session
    d.supervisor.shutdown().await;
    let (code, body) = get(&client, &format!("{base}/health")).await;
    assert_eq!(code, 503);
    let body: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(body["status"], "unhealthy");

    let (code, body) = get(&client, &format!("{base}/readyz")).await;
    assert_eq!((code, body.as_str()), (503, "NOT READY"));

    let (code, _) = get(&client, &format!("{base}/healthz")).await;
    assert_eq!(code, 200);
}
