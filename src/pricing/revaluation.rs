//! Revaluation Conflation & Subscriptions
//!
//! Updates queue into a conflation buffer keyed (account, product): if
//! several land before the flush interval elapses, only the latest is
//! emitted. Subscribers get an ordered per-account stream; nothing is
//! guaranteed across accounts.

use crate::clock::Millis;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
pub struct RevaluationUpdate {
    pub account_id: i64,
    pub product_id: i64,
    pub quantity: Decimal,
    pub price: Decimal,
    pub fx_rate: Decimal,
    pub market_value_local: Decimal,
    pub market_value_base: Decimal,
    /// A stale price or FX leg fed this valuation.
    pub stale_inputs: bool,
    pub ts: Millis,
}

/// Latest-wins buffer keyed (account, product).
#[derive(Default)]
pub struct ConflationBuffer {
    pending: Mutex<HashMap<(i64, i64), RevaluationUpdate>>,
}

impl ConflationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, update: RevaluationUpdate) {
        self.pending
            .lock()
            .insert((update.account_id, update.product_id), update);
    }

    /// Take everything pending, ordered by (account, product) so the
    /// per-account emission order is deterministic.
    pub fn drain(&self) -> Vec<RevaluationUpdate> {
        let mut updates: Vec<RevaluationUpdate> =
            self.pending.lock().drain().map(|(_, v)| v).collect();
        updates.sort_by_key(|u| (u.account_id, u.product_id));
        updates
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-account broadcast channels for push subscribers.
pub struct SubscriptionHub {
    channels: RwLock<HashMap<i64, broadcast::Sender<RevaluationUpdate>>>,
    capacity: usize,
}

impl SubscriptionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, account_id: i64) -> broadcast::Receiver<RevaluationUpdate> {
        let mut channels = self.channels.write();
        channels
            .entry(account_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Push to the account's channel; dropped silently with no subscriber.
    pub fn publish(&self, update: RevaluationUpdate) {
        if let Some(tx) = self.channels.read().get(&update.account_id) {
            let _ = tx.send(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn update(account_id: i64, product_id: i64, price: Decimal) -> RevaluationUpdate {
        RevaluationUpdate {
            account_id,
            product_id,
            quantity: dec!(100),
            price,
            fx_rate: dec!(1),
            market_value_local: dec!(100) * price,
            market_value_base: dec!(100) * price,
            stale_inputs: false,
            ts: 0,
        }
    }

    #[test]
    fn test_conflation_keeps_latest_per_key() {
        let buffer = ConflationBuffer::new();
        buffer.enqueue(update(1001, 1, dec!(150)));
        buffer.enqueue(update(1001, 1, dec!(151)));
        buffer.enqueue(update(1001, 2, dec!(2800)));

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].product_id, 1);
        assert_eq!(drained[0].price, dec!(151)); // latest wins
        assert_eq!(drained[1].product_id, 2);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_hub_orders_within_account() {
        let hub = SubscriptionHub::new(64);
        let mut rx = hub.subscribe(1001);

        hub.publish(update(1001, 1, dec!(150)));
        hub.publish(update(1001, 1, dec!(151)));
        hub.publish(update(2002, 9, dec!(10))); // other account, not ours

        assert_eq!(rx.recv().await.unwrap().price, dec!(150));
        assert_eq!(rx.recv().await.unwrap().price, dec!(151));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscriber_is_silent() {
        let hub = SubscriptionHub::new(4);
        hub.publish(update(1, 1, dec!(1)));
    }
}
