//! KIS REST Snapshot Loader
//!
//! Pulls the latest quote for every instrument in the current universe from
//! `GET /uapi/domestic-futureoption/v1/quotations/inquire-price`, one request
//! per instrument. Futures are fetched first so their price can centre the
//! option strike window before the option universe is derived.
//!
//! The endpoint only serves the latest session, so historical snapshots are
//! reported as not found.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;

use super::credentials::CredentialCache;
use crate::application::ports::{SnapshotError, SnapshotLoader};
use crate::domain::instrument::{InstrumentCode, InstrumentKind};
use crate::domain::quote::{Greeks, QuoteUpdate};
use crate::domain::session::MarketSessionClock;
use crate::domain::symbol_master::SymbolMaster;
use crate::infrastructure::config::AppCredentials;

const PRICE_PATH: &str = "/uapi/domestic-futureoption/v1/quotations/inquire-price";
const PRICE_TR_ID: &str = "FHMIF10000000";

/// Default pause between two price requests.
pub const DEFAULT_REQUEST_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct PriceResponse {
    #[serde(default)]
    rt_cd: String,
    #[serde(default)]
    msg_cd: String,
    #[serde(default)]
    msg1: String,
    #[serde(default)]
    output1: Option<PriceOutput>,
    #[serde(default)]
    output3: Option<IndexOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct PriceOutput {
    futs_prpr: Option<String>,
    futs_prdy_vrss: Option<String>,
    acml_vol: Option<String>,
    acml_tr_pbmn: Option<String>,
    hts_otst_stpl_qty: Option<String>,
    hts_ints_vltl: Option<String>,
    delta_val: Option<String>,
    gama: Option<String>,
    vega: Option<String>,
    theta: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct IndexOutput {
    bstp_nmix_prpr: Option<String>,
}

fn decimal(raw: Option<&String>) -> Option<Decimal> {
    let cleaned = raw?.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn unsigned(raw: Option<&String>) -> Option<u64> {
    raw?.trim().replace(',', "").parse().ok()
}

/// Snapshot source backed by the KIS price inquiry endpoint.
pub struct KisSnapshotLoader {
    client: Client,
    base_url: String,
    app: AppCredentials,
    credentials: Arc<CredentialCache>,
    symbols: Arc<SymbolMaster>,
    clock: Arc<MarketSessionClock>,
    request_delay: Duration,
}

impl KisSnapshotLoader {
    /// Create a loader.
    ///
    /// # Errors
    ///
    /// Returns [`SnapshotError::Request`] if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        app: AppCredentials,
        credentials: Arc<CredentialCache>,
        symbols: Arc<SymbolMaster>,
        clock: Arc<MarketSessionClock>,
        timeout: Duration,
    ) -> Result<Self, SnapshotError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SnapshotError::Request(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app,
            credentials,
            symbols,
            clock,
            request_delay: DEFAULT_REQUEST_DELAY,
        })
    }

    /// Override the pause between requests.
    #[must_use]
    pub const fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    async fn fetch_all(
        &self,
        token: &str,
        codes: &[InstrumentCode],
        out: &mut Vec<QuoteUpdate>,
    ) {
        for (i, code) in codes.iter().enumerate() {
            if i > 0 && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }
            match self.fetch(token, code).await {
                Ok(Some(quote)) => out.push(quote),
                Ok(None) => {}
                Err(e) => tracing::warn!(code = code.code(), error = %e, "Price inquiry failed"),
            }
        }
    }

    async fn fetch(
        &self,
        token: &str,
        code: &InstrumentCode,
    ) -> Result<Option<QuoteUpdate>, SnapshotError> {
        let market = match code.kind() {
            InstrumentKind::Future => "F",
            InstrumentKind::Option => "O",
        };
        let response = self
            .client
            .get(format!("{}{PRICE_PATH}", self.base_url))
            .query(&[("FID_COND_MRKT_DIV_CODE", market), ("FID_INPUT_ISCD", code.code())])
            .header("authorization", format!("Bearer {token}"))
            .header("appkey", self.app.app_key())
            .header("appsecret", self.app.app_secret())
            .header("tr_id", PRICE_TR_ID)
            .header("custtype", "P")
            .send()
            .await
            .map_err(|e| SnapshotError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SnapshotError::Request(format!("HTTP {status}")));
        }
        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| SnapshotError::Request(e.to_string()))?;

        if body.rt_cd != "0" {
            tracing::warn!(
                code = code.code(),
                msg_cd = %body.msg_cd,
                msg = %body.msg1,
                "Price inquiry rejected"
            );
            return Ok(None);
        }
        Ok(project(code, &body))
    }
}

fn project(code: &InstrumentCode, body: &PriceResponse) -> Option<QuoteUpdate> {
    let output = body.output1.as_ref()?;
    let price = decimal(output.futs_prpr.as_ref())?;

    let mut quote = QuoteUpdate::new(code.code(), price, Utc::now());
    quote.change = decimal(output.futs_prdy_vrss.as_ref());
    quote.volume = unsigned(output.acml_vol.as_ref());
    quote.trading_value = decimal(output.acml_tr_pbmn.as_ref());
    quote.open_interest = unsigned(output.hts_otst_stpl_qty.as_ref());

    if code.kind() == InstrumentKind::Option {
        quote.implied_volatility = decimal(output.hts_ints_vltl.as_ref());
        quote.greeks = Greeks {
            delta: decimal(output.delta_val.as_ref()),
            gamma: decimal(output.gama.as_ref()),
            vega: decimal(output.vega.as_ref()),
            theta: decimal(output.theta.as_ref()),
            rho: None,
        };
        quote.underlying_price = body
            .output3
            .as_ref()
            .and_then(|o| decimal(o.bstp_nmix_prpr.as_ref()));
    }
    Some(quote)
}

#[async_trait]
impl SnapshotLoader for KisSnapshotLoader {
    async fn load_current(&self) -> Result<Vec<QuoteUpdate>, SnapshotError> {
        let token = self
            .credentials
            .access_token()
            .await
            .map_err(|e| SnapshotError::Request(e.to_string()))?;
        let date = self.clock.now_local().date();

        let futures = self
            .symbols
            .active_futures(date)
            .map_err(|e| SnapshotError::Request(e.to_string()))?;
        let mut quotes = Vec::new();
        self.fetch_all(token.value(), &futures, &mut quotes).await;

        if let Some(front) = quotes.first() {
            self.symbols.observe_underlying(front.price);
        }

        let options = self
            .symbols
            .option_universe(date)
            .map_err(|e| SnapshotError::Request(e.to_string()))?;
        self.fetch_all(token.value(), &options, &mut quotes).await;

        tracing::info!(
            requested = futures.len() + options.len(),
            received = quotes.len(),
            "Price snapshot loaded"
        );
        Ok(quotes)
    }

    async fn load_historical(&self, date: NaiveDate) -> Result<Vec<QuoteUpdate>, SnapshotError> {
        Err(SnapshotError::NotFound(date))
    }
}

// =============================================================================
// Tests
// =============================================================================
