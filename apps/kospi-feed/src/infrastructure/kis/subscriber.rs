//! Paced Batch Subscription
//!
//! Sends one subscribe frame per instrument in fixed-size batches, waiting
//! for each acknowledgement before moving on. The upstream silently drops
//! subscriptions sent too quickly, so every step is paced.
//!
//! Runs in its own task: frames go out through the connection's outbound
//! queue and acks come back through the [`AckRegistry`], which the reader
//! resolves as control frames arrive.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::messages::{AckOutcome, SubscribeRequest};
use crate::domain::instrument::InstrumentCode;
use crate::domain::streaming::ChannelId;
use crate::domain::subscription::{
    BatchReport, Subscription, SubscriptionFailure, SubscriptionState,
};
use crate::infrastructure::metrics::{SubscriptionResult, record_subscription};

// =============================================================================
// Ack Registry
// =============================================================================

/// Pending subscribe acknowledgements keyed by instrument code.
#[derive(Debug, Default)]
pub struct AckRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<AckOutcome>>>,
}

impl AckRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the ack of `key`. Replaces any earlier waiter.
    pub fn register(&self, key: &str) -> oneshot::Receiver<AckOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.to_string(), tx);
        rx
    }

    /// Deliver an ack. Returns false if nobody was waiting for `key`.
    pub fn resolve(&self, key: &str, outcome: AckOutcome) -> bool {
        self.pending
            .lock()
            .remove(key)
            .is_some_and(|tx| tx.send(outcome).is_ok())
    }

    /// Stop waiting for `key`.
    pub fn forget(&self, key: &str) {
        self.pending.lock().remove(key);
    }

    /// Abandon every waiter.
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    /// Number of outstanding waiters.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

// =============================================================================
// Pacing
// =============================================================================

/// Timing of a subscription pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribePacing {
    /// Instruments per batch.
    pub batch_size: usize,
    /// Wait for each ack.
    pub ack_timeout: Duration,
    /// Pause between instruments within a batch.
    pub symbol_delay: Duration,
    /// Pause between batches.
    pub batch_delay: Duration,
    /// Pause after the transport opens before the first frame.
    pub settle_delay: Duration,
}

impl Default for SubscribePacing {
    fn default() -> Self {
        Self {
            batch_size: 10,
            ack_timeout: Duration::from_millis(3000),
            symbol_delay: Duration::from_millis(150),
            batch_delay: Duration::from_millis(500),
            settle_delay: Duration::from_millis(1000),
        }
    }
}

// =============================================================================
// Subscriber
// =============================================================================

/// Subscribes a list of instruments on one channel.
#[derive(Debug)]
pub struct BatchSubscriber<'a> {
    channel: &'a ChannelId,
    approval_key: &'a str,
    custtype: &'a str,
    pacing: SubscribePacing,
    acks: &'a AckRegistry,
}

impl<'a> BatchSubscriber<'a> {
    /// Create a subscriber for one transport session.
    #[must_use]
    pub const fn new(
        channel: &'a ChannelId,
        approval_key: &'a str,
        custtype: &'a str,
        pacing: SubscribePacing,
        acks: &'a AckRegistry,
    ) -> Self {
        Self {
            channel,
            approval_key,
            custtype,
            pacing,
            acks,
        }
    }

    /// Subscribe every instrument, continuing past individual failures.
    ///
    /// Stops early only when `cancel` fires or the outbound queue closes.
    pub async fn subscribe_all(
        &self,
        outbound: &mpsc::Sender<Message>,
        instruments: &[InstrumentCode],
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        if instruments.is_empty() || !pause(self.pacing.settle_delay, cancel).await {
            return report;
        }

        let batch_size = self.pacing.batch_size.max(1);
        'batches: for (batch_index, batch) in instruments.chunks(batch_size).enumerate() {
            if batch_index > 0 && !pause(self.pacing.batch_delay, cancel).await {
                break;
            }
            report.batches += 1;
            tracing::debug!(
                channel = %self.channel,
                batch = report.batches,
                size = batch.len(),
                "Subscribing batch"
            );

            for (position, instrument) in batch.iter().enumerate() {
                if position > 0 && !pause(self.pacing.symbol_delay, cancel).await {
                    break 'batches;
                }
                let subscription = self.subscribe_one(outbound, instrument, cancel).await;
                let stop = matches!(
                    subscription.state,
                    SubscriptionState::Failed(
                        SubscriptionFailure::SendFailed | SubscriptionFailure::Abandoned
                    )
                );
                report.record(subscription);
                if stop {
                    break 'batches;
                }
            }
        }

        tracing::info!(
            channel = %self.channel,
            batches = report.batches,
            acked = report.acked,
            failed = report.failed,
            "Subscription pass complete"
        );
        report
    }

    async fn subscribe_one(
        &self,
        outbound: &mpsc::Sender<Message>,
        instrument: &InstrumentCode,
        cancel: &CancellationToken,
    ) -> Subscription {
        let code = instrument.code();
        let mut subscription = Subscription::pending(self.channel.clone(), instrument.clone());

        let frame = match SubscribeRequest::register(
            self.approval_key,
            self.custtype,
            self.channel.as_str(),
            code,
        )
        .to_json()
        {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(symbol = code, error = %e, "Failed to encode subscribe frame");
                subscription.fail(SubscriptionFailure::SendFailed);
                return finish(subscription);
            }
        };

        let ack = self.acks.register(code);
        if outbound.send(Message::text(frame)).await.is_err() {
            self.acks.forget(code);
            subscription.fail(SubscriptionFailure::SendFailed);
            return finish(subscription);
        }

        tokio::select! {
            () = cancel.cancelled() => {
                self.acks.forget(code);
                subscription.fail(SubscriptionFailure::Abandoned);
            }
            result = tokio::time::timeout(self.pacing.ack_timeout, ack) => match result {
                Ok(Ok(AckOutcome::Success)) => subscription.ack(),
                Ok(Ok(AckOutcome::Rejected(message))) => {
                    tracing::warn!(channel = %self.channel, symbol = code, message = %message, "Subscription rejected");
                    subscription.fail(SubscriptionFailure::Rejected(message));
                }
                Ok(Err(_)) => subscription.fail(SubscriptionFailure::Abandoned),
                Err(_) => {
                    self.acks.forget(code);
                    tracing::warn!(channel = %self.channel, symbol = code, "Subscription ack timed out");
                    subscription.fail(SubscriptionFailure::Timeout);
                }
            },
        }
        finish(subscription)
    }
}

fn finish(subscription: Subscription) -> Subscription {
    let result = match &subscription.state {
        SubscriptionState::Acked => SubscriptionResult::Acked,
        SubscriptionState::Failed(SubscriptionFailure::Timeout) => {
            SubscriptionResult::Timeout
        }
        SubscriptionState::Failed(SubscriptionFailure::Rejected(_)) => {
            SubscriptionResult::Rejected
        }
        _ => SubscriptionResult::Failed,
    };
    record_subscription(subscription.channel.as_str(), result);
    subscription
}

/// Sleep unless cancelled. Returns false if cancelled.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}
