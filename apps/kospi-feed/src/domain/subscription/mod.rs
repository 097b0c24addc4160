//! Subscription Tracking
//!
//! A subscription records one subscribe frame sent for one instrument on
//! one channel, and how the upstream answered it. Subscriptions belong to
//! a single transport session: they are discarded when the connection
//! closes and rebuilt after every reconnect.

use serde::Serialize;

use super::instrument::InstrumentCode;
use super::streaming::ChannelId;

/// Why a subscription did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum SubscriptionFailure {
    /// No ack arrived within the timeout.
    Timeout,
    /// The upstream answered with a non-success message.
    Rejected(String),
    /// The subscribe frame could not be written.
    SendFailed,
    /// The connection went away before an answer arrived.
    Abandoned,
}

/// Resolution state of a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Subscribe frame sent, waiting for an ack.
    Pending,
    /// Upstream confirmed the subscription.
    Acked,
    /// Upstream rejected it or it timed out.
    Failed(SubscriptionFailure),
}

/// One instrument subscribed on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    /// Channel carrying the instrument.
    pub channel: ChannelId,
    /// Subscribed instrument.
    pub instrument: InstrumentCode,
    /// Resolution state.
    pub state: SubscriptionState,
}

impl Subscription {
    /// New pending subscription.
    #[must_use]
    pub const fn pending(channel: ChannelId, instrument: InstrumentCode) -> Self {
        Self {
            channel,
            instrument,
            state: SubscriptionState::Pending,
        }
    }

    /// Mark as acknowledged.
    pub fn ack(&mut self) {
        self.state = SubscriptionState::Acked;
    }

    /// Mark as failed.
    pub fn fail(&mut self, failure: SubscriptionFailure) {
        self.state = SubscriptionState::Failed(failure);
    }

    /// Whether the upstream confirmed this subscription.
    #[must_use]
    pub const fn is_acked(&self) -> bool {
        matches!(self.state, SubscriptionState::Acked)
    }
}

/// Outcome of one subscription pass over an instrument list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Batches started.
    pub batches: usize,
    /// Subscriptions acknowledged.
    pub acked: usize,
    /// Subscriptions that failed or timed out.
    pub failed: usize,
    /// Final state of every subscription attempted.
    #[serde(skip)]
    pub subscriptions: Vec<Subscription>,
}

impl BatchReport {
    /// Record a resolved subscription.
    pub fn record(&mut self, subscription: Subscription) {
        match subscription.state {
            SubscriptionState::Acked => self.acked += 1,
            SubscriptionState::Failed(_) => self.failed += 1,
            SubscriptionState::Pending => {}
        }
        self.subscriptions.push(subscription);
    }

    /// Total subscriptions attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.subscriptions.len()
    }

    /// Subscriptions that failed, in send order.
    pub fn failures(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions
            .iter()
            .filter(|s| matches!(s.state, SubscriptionState::Failed(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::instrument::ExpiryMonth;

    fn future() -> InstrumentCode {
        InstrumentCode::future(ExpiryMonth::new(2026, 3).unwrap()).unwrap()
    }

    #[test]
    fn report_counts_resolutions() {
        let channel = ChannelId::new("H0IFCNT0");
        let mut report = BatchReport::default();

        let mut acked = Subscription::pending(channel.clone(), future());
        acked.ack();
        report.record(acked);

        let mut failed = Subscription::pending(channel, future());
        failed.fail(SubscriptionFailure::Timeout);
        report.record(failed);

        assert_eq!(report.acked, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.attempted(), 2);
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn pending_is_not_acked() {
        let sub = Subscription::pending(ChannelId::new("H0IFCNT0"), future());
        assert!(!sub.is_acked());
        assert_eq!(sub.state, SubscriptionState::Pending);
    }
}
