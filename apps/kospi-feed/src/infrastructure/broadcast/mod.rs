//! Quote Broadcast
//!
//! In-process [`QuoteSink`] that keeps the latest quote per instrument and
//! fans every update out over tokio broadcast channels, one per instrument
//! kind.
//!
//! Only instruments registered through
//! [`QuoteSink::register_instruments`] are accepted; anything else is
//! reported as [`UpsertOutcome::UnknownSymbol`] and not stored. Each
//! registration replaces the universe of the kinds it contains, so symbols
//! that rolled out of range stop being tracked.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::application::ports::{QuoteSink, SinkError, UpsertOutcome};
use crate::domain::instrument::{InstrumentCode, InstrumentKind};
use crate::domain::quote::QuoteUpdate;

/// Default per-channel capacity.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 50_000;

/// Fan-out and latest-value store for quotes.
#[derive(Debug)]
pub struct QuoteBroadcast {
    futures_tx: broadcast::Sender<QuoteUpdate>,
    options_tx: broadcast::Sender<QuoteUpdate>,
    known: RwLock<HashMap<String, InstrumentKind>>,
    latest: RwLock<HashMap<String, QuoteUpdate>>,
    applied: AtomicU64,
    unknown: AtomicU64,
}

impl Default for QuoteBroadcast {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl QuoteBroadcast {
    /// Create a broadcast with `capacity` slots per channel.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            futures_tx: broadcast::channel(capacity).0,
            options_tx: broadcast::channel(capacity).0,
            known: RwLock::new(HashMap::new()),
            latest: RwLock::new(HashMap::new()),
            applied: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
        }
    }

    /// Receive updates for one instrument kind.
    #[must_use]
    pub fn subscribe(&self, kind: InstrumentKind) -> broadcast::Receiver<QuoteUpdate> {
        self.sender(kind).subscribe()
    }

    /// Latest quote for `symbol`.
    #[must_use]
    pub fn latest(&self, symbol: &str) -> Option<QuoteUpdate> {
        self.latest.read().get(symbol).cloned()
    }

    /// Latest quotes for every symbol of `kind`.
    #[must_use]
    pub fn snapshot(&self, kind: InstrumentKind) -> Vec<QuoteUpdate> {
        let known = self.known.read();
        self.latest
            .read()
            .values()
            .filter(|q| known.get(&q.symbol) == Some(&kind))
            .cloned()
            .collect()
    }

    /// Whether `symbol` belongs to the registered universe.
    #[must_use]
    pub fn is_known(&self, symbol: &str) -> bool {
        self.known.read().contains_key(symbol)
    }

    /// Counters and receiver counts.
    #[must_use]
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            known_symbols: self.known.read().len(),
            quotes_held: self.latest.read().len(),
            futures_receivers: self.futures_tx.receiver_count(),
            options_receivers: self.options_tx.receiver_count(),
            applied: self.applied.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }

    const fn sender(&self, kind: InstrumentKind) -> &broadcast::Sender<QuoteUpdate> {
        match kind {
            InstrumentKind::Future => &self.futures_tx,
            InstrumentKind::Option => &self.options_tx,
        }
    }
}

#[async_trait]
impl QuoteSink for QuoteBroadcast {
    async fn upsert(&self, update: QuoteUpdate) -> Result<UpsertOutcome, SinkError> {
        let Some(kind) = self.known.read().get(&update.symbol).copied() else {
            self.unknown.fetch_add(1, Ordering::Relaxed);
            return Ok(UpsertOutcome::UnknownSymbol);
        };

        self.latest
            .write()
            .insert(update.symbol.clone(), update.clone());
        self.applied.fetch_add(1, Ordering::Relaxed);

        // no receivers is fine
        let _ = self.sender(kind).send(update);
        Ok(UpsertOutcome::Applied)
    }

    fn register_instruments(&self, instruments: &[InstrumentCode]) {
        let current: HashSet<&str> = instruments.iter().map(InstrumentCode::code).collect();
        let mut kinds: Vec<InstrumentKind> = Vec::new();
        for instrument in instruments {
            if !kinds.contains(&instrument.kind()) {
                kinds.push(instrument.kind());
            }
        }

        let mut known = self.known.write();
        let mut retired = Vec::new();
        known.retain(|symbol, kind| {
            let keep = !kinds.contains(kind) || current.contains(symbol.as_str());
            if !keep {
                retired.push(symbol.clone());
            }
            keep
        });
        for instrument in instruments {
            known.insert(instrument.code().to_string(), instrument.kind());
        }

        if !retired.is_empty() {
            let mut latest = self.latest.write();
            for symbol in &retired {
                latest.remove(symbol);
            }
        }
        tracing::debug!(
            added = instruments.len(),
            retired = retired.len(),
            total = known.len(),
            "Instruments registered"
        );
    }
}

/// Shared quote broadcast reference.
pub type SharedQuoteBroadcast = Arc<QuoteBroadcast>;

/// Point-in-time broadcast counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BroadcastStats {
    /// Registered instruments.
    pub known_symbols: usize,
    /// Instruments with at least one quote.
    pub quotes_held: usize,
    /// Futures receivers.
    pub futures_receivers: usize,
    /// Options receivers.
    pub options_receivers: usize,
    /// Upserts applied.
    pub applied: u64,
    /// Upserts rejected as unknown.
    pub unknown: u64,
}

impl BroadcastStats {
    /// Receivers across both channels.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.futures_receivers + self.options_receivers
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::instrument::{ExpiryMonth, OptionSide};

    fn expiry() -> ExpiryMonth {
        ExpiryMonth::new(2026, 3).unwrap()
    }

    #[tokio::test]
    async fn unknown_symbol_is_not_stored() {
        let hub = QuoteBroadcast::new(16);
        let outcome = hub
            .upsert(QuoteUpdate::new("B01603585", dec!(7.5), Utc::now()))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::UnknownSymbol);
        assert!(hub.latest("B01603585").is_none());
        assert_eq!(hub.stats().unknown, 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_and_fans_out_by_kind() {
        let hub = QuoteBroadcast::new(16);
        let future = InstrumentCode::future(expiry()).unwrap();
        let call = InstrumentCode::option(OptionSide::Call, dec!(585), expiry()).unwrap();
        hub.register_instruments(&[future.clone(), call.clone()]);

        let mut futures_rx = hub.subscribe(InstrumentKind::Future);
        let mut options_rx = hub.subscribe(InstrumentKind::Option);

        hub.upsert(QuoteUpdate::new(future.code(), dec!(590.1), Utc::now()))
            .await
            .unwrap();
        hub.upsert(QuoteUpdate::new(future.code(), dec!(590.3), Utc::now()))
            .await
            .unwrap();
        hub.upsert(QuoteUpdate::new(call.code(), dec!(7.35), Utc::now()))
            .await
            .unwrap();

        assert_eq!(hub.latest(future.code()).unwrap().price, dec!(590.3));
        assert_eq!(futures_rx.recv().await.unwrap().price, dec!(590.1));
        assert_eq!(futures_rx.recv().await.unwrap().price, dec!(590.3));
        assert_eq!(options_rx.recv().await.unwrap().symbol, call.code());
        assert!(options_rx.try_recv().is_err());

        let stats = hub.stats();
        assert_eq!(stats.known_symbols, 2);
        assert_eq!(stats.quotes_held, 2);
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.total_receivers(), 2);
        assert_eq!(hub.snapshot(InstrumentKind::Option).len(), 1);
    }

    #[tokio::test]
    async fn registering_a_new_universe_retires_symbols_of_the_same_kind() {
        let hub = QuoteBroadcast::new(16);
        let future = InstrumentCode::future(expiry()).unwrap();
        let low = InstrumentCode::option(OptionSide::Call, dec!(580), expiry()).unwrap();
        let atm = InstrumentCode::option(OptionSide::Call, dec!(585), expiry()).unwrap();
        let high = InstrumentCode::option(OptionSide::Call, dec!(590), expiry()).unwrap();

        hub.register_instruments(std::slice::from_ref(&future));
        hub.register_instruments(&[low.clone(), atm.clone()]);
        for code in [&future, &low, &atm] {
            hub.upsert(QuoteUpdate::new(code.code(), dec!(5), Utc::now()))
                .await
                .unwrap();
        }

        hub.register_instruments(&[atm.clone(), high.clone()]);

        assert!(!hub.is_known(low.code()));
        assert!(hub.latest(low.code()).is_none());
        assert!(hub.latest(atm.code()).is_some());
        assert!(hub.is_known(high.code()));
        assert!(hub.latest(future.code()).is_some());

        let stats = hub.stats();
        assert_eq!(stats.known_symbols, 3);
        assert_eq!(stats.quotes_held, 2);
        assert_eq!(
            hub.upsert(QuoteUpdate::new(low.code(), dec!(5.1), Utc::now()))
                .await
                .unwrap(),
            UpsertOutcome::UnknownSymbol
        );
    }

    #[test]
    fn empty_registration_keeps_everything() {
        let hub = QuoteBroadcast::new(16);
        let future = InstrumentCode::future(expiry()).unwrap();
        hub.register_instruments(std::slice::from_ref(&future));
        hub.register_instruments(&[]);
        assert!(hub.is_known(future.code()));
    }

    #[tokio::test]
    async fn upsert_without_receivers_still_applies() {
        let hub = QuoteBroadcast::default();
        let future = InstrumentCode::future(expiry()).unwrap();
        hub.register_instruments(std::slice::from_ref(&future));
        assert_eq!(
            hub.upsert(QuoteUpdate::new(future.code(), dec!(590), Utc::now()))
                .await
                .unwrap(),
            UpsertOutcome::Applied
        );
    }
}
