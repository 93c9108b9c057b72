//! In-Process Topic Broker
//!
//! Named topics with a fixed partition count. A publish hashes the key to a
//! partition; each partition is a bounded FIFO consumed by exactly one task,
//! which is what preserves per-key ordering. Publishing applies
//! backpressure when a partition is full.
//!
//! Every topic registration creates its `<topic>.DLQ` shadow. DLQ publishes
//! never block: an undrained, full DLQ drops and counts instead.

use crate::errors::{PlatformError, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

pub const DEFAULT_PARTITIONS: usize = 4;
pub const DEFAULT_CAPACITY: usize = 1024;

/// A message in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub event_id: Uuid,
}

impl Envelope {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| PlatformError::Parse(format!("{}: {e}", self.topic)))
    }
}

/// DLQ payload: the original message plus error metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_topic: String,
    pub key: String,
    pub payload: serde_json::Value,
    pub error_code: String,
    pub error_message: String,
    pub event_id: Uuid,
}

struct TopicState {
    partitions: Vec<mpsc::Sender<Envelope>>,
}

#[derive(Debug, Default)]
pub struct BrokerStats {
    pub published: AtomicU64,
    pub dlq_published: AtomicU64,
    pub dlq_dropped: AtomicU64,
}

pub struct Broker {
    topics: Mutex<HashMap<String, TopicState>>,
    /// Receivers parked at registration until a consumer claims them.
    unclaimed: Mutex<HashMap<String, Vec<mpsc::Receiver<Envelope>>>>,
    stats: BrokerStats,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            unclaimed: Mutex::new(HashMap::new()),
            stats: BrokerStats::default(),
        }
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    /// Create a topic (idempotent) and its DLQ shadow. Consumer receivers
    /// are parked until claimed with `take_receivers`.
    pub fn register_topic(&self, name: &str, partitions: usize, capacity: usize) {
        let mut topics = self.topics.lock();
        if topics.contains_key(name) {
            return;
        }
        let partitions = partitions.max(1);
        let mut senders = Vec::with_capacity(partitions);
        let mut receivers = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            senders.push(tx);
            receivers.push(rx);
        }
        topics.insert(
            name.to_string(),
            TopicState {
                partitions: senders,
            },
        );
        self.unclaimed.lock().insert(name.to_string(), receivers);
        drop(topics);

        let dlq = super::topics::dlq_topic(name);
        if !name.ends_with(".DLQ") {
            self.register_topic(&dlq, 1, DEFAULT_CAPACITY);
        }
    }

    /// Claim the consumer side of a topic: one receiver per partition.
    /// Single consumer group semantics: a second claim gets None.
    pub fn take_receivers(&self, name: &str) -> Option<Vec<mpsc::Receiver<Envelope>>> {
        self.unclaimed.lock().remove(name)
    }

    /// Publish to a topic; the key chooses the partition. Blocks on a full
    /// partition (backpressure), errors on an unknown topic.
    pub async fn publish<T: Serialize>(&self, topic: &str, key: &str, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.publish_value(topic, key, value).await
    }

    pub async fn publish_value(
        &self,
        topic: &str,
        key: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let sender = {
            let topics = self.topics.lock();
            let state = topics
                .get(topic)
                .ok_or_else(|| PlatformError::PublishFailed(topic.to_string()))?;
            state.partitions[partition_for(key, state.partitions.len())].clone()
        };
        let envelope = Envelope {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
            event_id: Uuid::new_v4(),
        };
        sender
            .send(envelope)
            .await
            .map_err(|_| PlatformError::PublishFailed(topic.to_string()))?;
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy a poisoned message to the topic's DLQ with error metadata.
    /// Never blocks ingestion: a full DLQ drops and counts.
    pub fn publish_dlq(&self, envelope: &Envelope, err: &PlatformError) {
        let dlq_name = super::topics::dlq_topic(&envelope.topic);
        let dead_letter = DeadLetter {
            source_topic: envelope.topic.clone(),
            key: envelope.key.clone(),
            payload: envelope.payload.clone(),
            error_code: err.code().to_string(),
            error_message: err.to_string(),
            event_id: envelope.event_id,
        };
        let value = match serde_json::to_value(&dead_letter) {
            Ok(v) => v,
            Err(e) => {
                error!(topic = %dlq_name, error = %e, "dead letter encode failed");
                return;
            }
        };
        let sender = {
            let topics = self.topics.lock();
            match topics.get(&dlq_name) {
                Some(state) => state.partitions[0].clone(),
                None => {
                    error!(topic = %dlq_name, "DLQ topic missing");
                    return;
                }
            }
        };
        let dlq_envelope = Envelope {
            topic: dlq_name.clone(),
            key: envelope.key.clone(),
            payload: value,
            event_id: Uuid::new_v4(),
        };
        match sender.try_send(dlq_envelope) {
            Ok(()) => {
                self.stats.dlq_published.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("dlq_published_total", 1, "topic" => envelope.topic.clone());
                warn!(
                    topic = %envelope.topic,
                    key = %envelope.key,
                    code = %err.code(),
                    "message dead-lettered"
                );
            }
            Err(_) => {
                self.stats.dlq_dropped.fetch_add(1, Ordering::Relaxed);
                error!(topic = %dlq_name, "DLQ full, message dropped");
            }
        }
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % partitions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct TestMsg {
        seq: u64,
    }

    #[tokio::test]
    async fn test_per_key_ordering() {
        let broker = Broker::new();
        broker.register_topic("T", 4, 64);
        let mut receivers = broker.take_receivers("T").unwrap();

        for seq in 0..10u64 {
            broker.publish("T", "account-1001", &TestMsg { seq }).await.unwrap();
        }

        // All messages for one key land on one partition, in order
        let mut seen = Vec::new();
        for rx in receivers.iter_mut() {
            while let Ok(envelope) = rx.try_recv() {
                seen.push(envelope.decode::<TestMsg>().unwrap().seq);
            }
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_unknown_topic_fails_publish() {
        let broker = Broker::new();
        let err = broker
            .publish("NOPE", "k", &TestMsg { seq: 1 })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PUBLISH_FAILED-501");
    }

    #[tokio::test]
    async fn test_dlq_receives_dead_letters() {
        let broker = Broker::new();
        broker.register_topic("T", 1, 64);
        let _main = broker.take_receivers("T").unwrap();
        let mut dlq = broker.take_receivers("T.DLQ").unwrap();

        let envelope = Envelope {
            topic: "T".into(),
            key: "k1".into(),
            payload: serde_json::json!({"bad": true}),
            event_id: Uuid::new_v4(),
        };
        broker.publish_dlq(&envelope, &PlatformError::Parse("bad json".into()));

        let dead = dlq[0].try_recv().unwrap();
        let letter: DeadLetter = dead.decode().unwrap();
        assert_eq!(letter.source_topic, "T");
        assert_eq!(letter.error_code, "PARSE_FAILED-502");
        assert_eq!(letter.payload, serde_json::json!({"bad": true}));
    }

    #[tokio::test]
    async fn test_single_consumer_group() {
        let broker = Broker::new();
        broker.register_topic("T", 2, 8);
        assert!(broker.take_receivers("T").is_some());
        assert!(broker.take_receivers("T").is_none());
    }

    #[tokio::test]
    async fn test_decode_failure_is_parse_error() {
        let broker = Broker::new();
        broker.register_topic("T", 1, 8);
        let mut rx = broker.take_receivers("T").unwrap();
        broker
            .publish("T", "k", &serde_json::json!({"seq": "not-a-number"}))
            .await
            .unwrap();
        let envelope = rx[0].try_recv().unwrap();
        assert!(envelope.decode::<TestMsg>().is_err());
    }
}
