//! KOSPI Feed Binary
//!
//! Starts the KOSPI200 derivatives real-time feed gateway.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin kospi-feed
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `KIS_APP_KEY`: KIS application key
//! - `KIS_APP_SECRET`: KIS application secret
//!
//! ## Optional
//! - `KIS_REST_URL` / `KIS_WS_URL`: Broker endpoints
//! - `FEED_CREDENTIAL_DIR`: Directory for cached credentials (default: .)
//! - `FEED_TRIGGER_TIMES`: Session transition times (default: 08:40,17:55)
//! - `FEED_SEED_SNAPSHOT`: Seed quotes from REST at startup (default: true)
//! - `FEED_HEALTH_PORT`: Health check HTTP port (default: 8082)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `OTEL_SERVICE_NAME`: Service name (default: kospi-feed)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use kospi_feed::application::ports::{FeedLauncher, QuoteSink};
use kospi_feed::infrastructure::health::{HealthServer, HealthServerState};
use kospi_feed::infrastructure::kis::{
    ConnectionDeps, CredentialCache, CredentialStore, HttpCredentialIssuer, KisCodec,
    KisFeedLauncher, KisSnapshotLoader,
};
use kospi_feed::infrastructure::telemetry;
use kospi_feed::{
    FeedConfig, FeedSupervisor, MarketSessionClock, QuoteBroadcast, SymbolMaster, TrackingSink,
    TradingCalendar, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
#[allow(clippy::expect_used)]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting KOSPI feed");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = FeedConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Calendar, session clock and universe
    let calendar = Arc::new(
        TradingCalendar::krx().with_extra_holidays(config.session.extra_holidays.iter().copied()),
    );
    let next_day = calendar.next_trading_day(chrono::Utc::now().date_naive());
    let clock = Arc::new(
        MarketSessionClock::new(Arc::clone(&calendar))
            .with_night_into_holiday(config.session.night_into_holiday),
    );
    let symbols = Arc::new(SymbolMaster::new(config.symbol_master_config()));
    tracing::info!(
        session = %clock.current_state(),
        next_trading_day = %next_day,
        holidays = calendar.holiday_count(),
        "Session clock ready"
    );

    // Quote fan-out, wrapped so observed prices steer the universe
    let broadcast = Arc::new(QuoteBroadcast::new(config.server.broadcast_capacity));
    let sink: Arc<dyn QuoteSink> = Arc::new(TrackingSink::new(
        Arc::clone(&broadcast) as Arc<dyn QuoteSink>,
        Arc::clone(&symbols),
    ));

    // Credentials
    let issuer = HttpCredentialIssuer::new(
        config.broker.rest_url.clone(),
        config.credentials.clone(),
        config.credential_cache.request_timeout,
    )?;
    let credentials = Arc::new(CredentialCache::new(
        Arc::new(issuer),
        CredentialStore::new(config.credential_cache.dir.clone()),
        config.credential_ttls(),
    ));

    // Feed launcher and supervisor
    let deps = ConnectionDeps {
        credentials: Arc::clone(&credentials),
        sink: Arc::clone(&sink),
        codec: KisCodec::default(),
        clock: Arc::clone(&clock),
    };
    let launcher: Arc<dyn FeedLauncher> =
        Arc::new(KisFeedLauncher::new(config.connection_config(), deps));
    let supervisor = Arc::new(FeedSupervisor::new(
        Arc::clone(&clock),
        Arc::clone(&symbols),
        launcher,
        Arc::clone(&sink),
        config.supervisor_config(),
    ));

    // Seed quotes and the underlying estimate before the first transition
    if config.schedule.seed_snapshot {
        let loader = KisSnapshotLoader::new(
            config.broker.rest_url.clone(),
            config.credentials.clone(),
            Arc::clone(&credentials),
            Arc::clone(&symbols),
            Arc::clone(&clock),
            config.credential_cache.request_timeout,
        )?;
        if let Err(e) = supervisor.seed_from_snapshot(&loader).await {
            tracing::warn!(error = %e, "Snapshot seed failed, continuing with defaults");
        }
    }

    // Initialize health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&supervisor),
        Arc::clone(&broadcast),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        Arc::clone(&health_state),
        shutdown_token.clone(),
    );

    // Spawn health server
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    // Bring up whatever the current session needs, then follow the schedule
    let report = supervisor.on_session_transition().await;
    tracing::info!(
        state = report.state.as_str(),
        opened = report.opened.len(),
        failed = report.failed.len(),
        "Initial session transition"
    );

    let schedule_supervisor = Arc::clone(&supervisor);
    let schedule = config.transition_schedule();
    let schedule_token = shutdown_token.clone();
    let schedule_task = tokio::spawn(async move {
        schedule_supervisor
            .run_schedule(schedule, schedule_token)
            .await;
    });

    tracing::info!("KOSPI feed ready");

    await_shutdown(shutdown_token).await;

    supervisor.shutdown().await;
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, schedule_task).await.is_err() {
        tracing::warn!("Transition schedule did not stop in time");
    }

    tracing::info!("KOSPI feed stopped");
    Ok(())
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &FeedConfig) {
    tracing::info!(
        rest_url = %config.broker.rest_url,
        ws_url = %config.broker.ws_url,
        health_port = config.server.health_port,
        max_subscriptions = config.subscription.max_subscriptions,
        triggers = config.schedule.trigger_times.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        batch_size = config.subscription.batch_size,
        ack_timeout_ms = config.subscription.ack_timeout.as_millis(),
        reconnect_delay_ms = config.websocket.reconnect_delay.as_millis(),
        strike_range = %config.universe.strike_range,
        "Feed tuning"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
