//! Feed Connection Integration Tests
//!
//! Runs a `FeedConnection` against a local WebSocket server that plays the
//! broker: it acknowledges or rejects subscribe requests, pushes tick frames
//! and drops the socket on demand.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use kospi_feed::application::ports::{
    CredentialIssuer, FeedHandle, FeedLauncher, IssueError, IssuedCredential, LaunchError,
};
use kospi_feed::domain::credential::CredentialKind;
use kospi_feed::{
    ChannelSpec, ConnectionConfig, ConnectionDeps, ConnectionPhase, CredentialCache,
    CredentialStore, CredentialTtls, ExpiryMonth, FeedConnection, InstrumentCode, InstrumentKind,
    KisCodec, KisFeedLauncher, MarketSessionClock, OptionSide, QuoteBroadcast, QuoteSink,
    ReconnectConfig, SubscribePacing, TradingCalendar,
};

const CHANNEL: &str = "H0IOCNT0";

// =============================================================================
// Broker stand-in
// =============================================================================

#[derive(Default)]
struct Script {
    reject: HashSet<String>,
    silent: HashSet<String>,
    frames: Vec<String>,
    drop_first_connection: bool,
}

#[derive(Default)]
struct Observed {
    connections: AtomicUsize,
    uris: Mutex<Vec<String>>,
    requests: Mutex<Vec<(usize, String)>>,
    keepalives: AtomicUsize,
}

struct MockBroker {
    url: String,
    observed: Arc<Observed>,
}

impl MockBroker {
    async fn start(script: Script, expected_per_connection: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let observed = Arc::new(Observed::default());
        let script = Arc::new(script);

        let accept_observed = Arc::clone(&observed);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = accept_observed.connections.fetch_add(1, Ordering::SeqCst);
                let observed = Arc::clone(&accept_observed);
                let script = Arc::clone(&script);
                tokio::spawn(serve(stream, index, expected_per_connection, script, observed));
            }
        });

        Self { url, observed }
    }

    fn requests_on(&self, connection: usize) -> Vec<String> {
        self.observed
            .requests
            .lock()
            .iter()
            .filter(|(c, _)| *c == connection)
            .map(|(_, key)| key.clone())
            .collect()
    }
}

async fn serve(
    stream: TcpStream,
    index: usize,
    expected: usize,
    script: Arc<Script>,
    observed: Arc<Observed>,
) {
    let uri_log = Arc::clone(&observed);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        uri_log.uris.lock().push(request.uri().to_string());
        Ok(response)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut tx, mut rx) = ws.split();

    tx.send(Message::text(
        json!({"header": {"tr_id": "PINGPONG", "datetime": "20260316100000"}}).to_string(),
    ))
    .await
    .unwrap();

    let mut seen = 0;
    while let Some(Ok(message)) = rx.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let value: Value = serde_json::from_str(text.as_str()).unwrap();
        if value["header"]["tr_id"] == "PINGPONG" {
            observed.keepalives.fetch_add(1, Ordering::SeqCst);
            continue;
        }

        let tr_id = value["body"]["input"]["tr_id"].as_str().unwrap().to_string();
        let tr_key = value["body"]["input"]["tr_key"].as_str().unwrap().to_string();
        observed.requests.lock().push((index, tr_key.clone()));
        seen += 1;

        if !script.silent.contains(&tr_key) {
            let (rt_cd, msg1) = if script.reject.contains(&tr_key) {
                ("1", "MAX SUBSCRIBE OVER")
            } else {
                ("0", "SUBSCRIBE SUCCESS")
            };
            let ack = json!({
                "header": {"tr_id": tr_id, "tr_key": tr_key, "encrypt": "N"},
                "body": {"rt_cd": rt_cd, "msg_cd": "OPSP0000", "msg1": msg1}
            });
            if tx.send(Message::text(ack.to_string())).await.is_err() {
                return;
            }
        }

        if seen == expected {
            for frame in &script.frames {
                if tx.send(Message::text(frame.clone())).await.is_err() {
                    return;
                }
            }
            if index == 0 && script.drop_first_connection {
                return;
            }
        }
    }
}

// =============================================================================
// Fixtures
// =============================================================================

struct StaticIssuer {
    calls: AtomicUsize,
}

#[async_trait]
impl CredentialIssuer for StaticIssuer {
    async fn issue(&self, kind: CredentialKind) -> Result<IssuedCredential, IssueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedCredential {
            value: format!("{}-1", kind.as_str()),
            ttl: Some(Duration::from_secs(3600)),
        })
    }
}

struct Harness {
    deps: ConnectionDeps,
    broadcast: Arc<QuoteBroadcast>,
    issuer: Arc<StaticIssuer>,
    _dir: tempfile::TempDir,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let issuer = Arc::new(StaticIssuer {
        calls: AtomicUsize::new(0),
    });
    let credentials = Arc::new(CredentialCache::new(
        Arc::clone(&issuer) as Arc<dyn CredentialIssuer>,
        CredentialStore::new(dir.path()),
        CredentialTtls::default(),
    ));
    let broadcast = Arc::new(QuoteBroadcast::new(64));
    let clock = Arc::new(MarketSessionClock::new(Arc::new(TradingCalendar::new([]))));

    Harness {
        deps: ConnectionDeps {
            credentials,
            sink: Arc::clone(&broadcast) as Arc<dyn QuoteSink>,
            codec: KisCodec::default(),
            clock,
        },
        broadcast,
        issuer,
        _dir: dir,
    }
}

fn config(url: &str) -> ConnectionConfig {
    ConnectionConfig {
        ws_url: url.to_string(),
        connect_timeout: Duration::from_secs(2),
        pacing: SubscribePacing {
            batch_size: 5,
            ack_timeout: Duration::from_millis(300),
            symbol_delay: Duration::ZERO,
            batch_delay: Duration::from_millis(10),
            settle_delay: Duration::ZERO,
        },
        reconnect: ReconnectConfig::fixed(Duration::from_millis(50), 0),
        ..ConnectionConfig::default()
    }
}

fn options(count: usize) -> Vec<InstrumentCode> {
    let expiry = ExpiryMonth::new(2026, 4).unwrap();
    (0..count)
        .map(|i| {
            let strike = dec!(570) + rust_decimal::Decimal::from(i) * dec!(2.5);
            InstrumentCode::option(OptionSide::Call, strike, expiry).unwrap()
        })
        .collect()
}

fn option_frame(symbol: &str, price: &str, volume: &str) -> String {
    let mut fields = vec![String::new(); 45];
    fields[2] = price.to_string();
    fields[10] = volume.to_string();
    format!("0|{CHANNEL}|001|{symbol}^{}", fields.join("^"))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn subscribes_in_batches_and_streams_quotes() {
    let instruments = options(12);
    let codes: Vec<String> = instruments.iter().map(|c| c.code().to_string()).collect();

    let script = Script {
        reject: HashSet::from([codes[6].clone()]),
        silent: HashSet::from([codes[7].clone()]),
        frames: vec![
            option_frame(&codes[0], "42.50", "1000"),
            option_frame(&codes[11], "3.05", "12"),
            format!("1|{CHANNEL}|001|ENCRYPTEDPAYLOAD"),
            "0|H0IOCNT0|001".to_string(),
        ],
        drop_first_connection: false,
    };
    let broker = MockBroker::start(script, instruments.len()).await;

    let h = harness();
    h.broadcast.register_instruments(&instruments);
    let connection = Arc::new(FeedConnection::new(
        ChannelSpec::new(CHANNEL, InstrumentKind::Option),
        instruments.clone(),
        config(&broker.url),
        h.deps.clone(),
    ));
    connection.activate().await.unwrap();

    eventually("batch report and frames", || {
        let status = connection.status();
        status.last_batch.is_some()
            && status.frames_parsed == 2
            && status.frames_dropped == 2
            && broker.observed.keepalives.load(Ordering::SeqCst) == 1
    })
    .await;

    let status = connection.status();
    let report = status.last_batch.unwrap();
    assert_eq!(report.batches, 3);
    assert_eq!(report.acked, 10);
    assert_eq!(report.failed, 2);
    assert_eq!(status.phase, ConnectionPhase::Streaming);

    assert_eq!(broker.requests_on(0), codes);
    assert!(broker.observed.uris.lock()[0].contains("approval_key=approval_key-1"));
    assert!(broker.observed.uris.lock()[0].contains("tr_type=1"));

    let quote = h.broadcast.latest(&codes[0]).unwrap();
    assert_eq!(quote.price, dec!(42.50));
    assert_eq!(quote.volume, Some(1000));
    assert_eq!(h.broadcast.latest(&codes[11]).unwrap().price, dec!(3.05));

    connection.close();
}

#[tokio::test]
async fn reconnects_and_resubscribes_from_scratch() {
    let instruments = options(4);
    let codes: Vec<String> = instruments.iter().map(|c| c.code().to_string()).collect();
    let script = Script {
        frames: vec![option_frame(&codes[1], "7.35", "5")],
        drop_first_connection: true,
        ..Script::default()
    };
    let broker = MockBroker::start(script, instruments.len()).await;

    let h = harness();
    h.broadcast.register_instruments(&instruments);
    let connection = Arc::new(FeedConnection::new(
        ChannelSpec::new(CHANNEL, InstrumentKind::Option),
        instruments,
        config(&broker.url),
        h.deps.clone(),
    ));
    connection.activate().await.unwrap();

    eventually("second connection fully subscribed", || {
        broker.requests_on(1).len() == codes.len()
    })
    .await;

    assert_eq!(broker.requests_on(0), codes);
    assert_eq!(broker.requests_on(1), codes);
    assert!(connection.status().reconnects >= 1);
    assert_eq!(h.issuer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.broadcast.latest(&codes[1]).unwrap().price, dec!(7.35));

    connection.close();
}

#[tokio::test]
async fn closed_connection_never_reconnects() {
    let instruments = options(2);
    let broker = MockBroker::start(Script::default(), instruments.len()).await;

    let h = harness();
    let connection = Arc::new(FeedConnection::new(
        ChannelSpec::new(CHANNEL, InstrumentKind::Option),
        instruments,
        config(&broker.url),
        h.deps.clone(),
    ));
    connection.activate().await.unwrap();
    eventually("subscription pass", || connection.last_batch().is_some()).await;

    connection.close();
    eventually("connection closed", || connection.phase() == ConnectionPhase::Closed).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(broker.observed.connections.load(Ordering::SeqCst), 1);
    assert!(connection.is_closed());
}

#[tokio::test]
async fn launcher_reports_transport_failure() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let h = harness();
    let launcher = KisFeedLauncher::new(config(&url), h.deps.clone());
    let result = launcher
        .launch(ChannelSpec::new(CHANNEL, InstrumentKind::Option), options(2))
        .await;

    assert!(matches!(result, Err(LaunchError::Transport(_))));
}

#[tokio::test]
async fn launcher_returns_a_live_handle() {
    let instruments = options(3);
    let broker = MockBroker::start(Script::default(), instruments.len()).await;

    let h = harness();
    let launcher = KisFeedLauncher::new(config(&broker.url), h.deps.clone());
    let handle: Arc<dyn FeedHandle> = launcher
        .launch(ChannelSpec::new(CHANNEL, InstrumentKind::Option), instruments)
        .await
        .unwrap();

    assert_eq!(handle.channel().as_str(), CHANNEL);
    assert_eq!(handle.instruments().len(), 3);
    eventually("streaming", || handle.status().phase == ConnectionPhase::Streaming).await;
    handle.close();
}
