//! Quote sink decorator that feeds the symbol master.

use std::sync::Arc;

use async_trait::async_trait;

use crate::application::ports::{QuoteSink, SinkError, UpsertOutcome};
use crate::domain::instrument::{InstrumentCode, InstrumentKind};
use crate::domain::quote::QuoteUpdate;
use crate::domain::symbol_master::SymbolMaster;

/// Forwards quotes to an inner sink after recording the underlying price
/// (from futures) and implied volatility (from options) on the
/// [`SymbolMaster`].
pub struct TrackingSink {
    inner: Arc<dyn QuoteSink>,
    symbols: Arc<SymbolMaster>,
}

impl TrackingSink {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn QuoteSink>, symbols: Arc<SymbolMaster>) -> Self {
        Self { inner, symbols }
    }

    fn observe(&self, update: &QuoteUpdate) {
        let Ok(code) = InstrumentCode::parse(&update.symbol) else {
            return;
        };
        match code.kind() {
            InstrumentKind::Future => self.symbols.observe_underlying(update.price),
            InstrumentKind::Option => {
                if let Some(iv) = update.implied_volatility {
                    self.symbols.observe_implied_vol(iv);
                }
            }
        }
    }
}

#[async_trait]
impl QuoteSink for TrackingSink {
    async fn upsert(&self, update: QuoteUpdate) -> Result<UpsertOutcome, SinkError> {
        self.observe(&update);
        self.inner.upsert(update).await
    }

    fn register_instruments(&self, instruments: &[InstrumentCode]) {
        self.inner.register_instruments(instruments);
    }
}

// =============================================================================
// Tests
// =============================================================================
