//! Consumer Loop
//!
//! One task per partition. Manual-acknowledgement semantics: a message is
//! acknowledged by moving past it. Retryable handler failures are retried
//! per the topic's policy; non-retryable failures (and exhausted retries)
//! copy the payload to the DLQ and acknowledge, so a poisoned message can
//! never wedge its partition.

use super::broker::{Broker, Envelope};
use crate::errors::Result;
use crate::resilience::{retry_async, RetryPolicy};
use crate::shutdown::ShutdownSignal;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Drive one partition until shutdown or channel close.
pub async fn run_partition<F, Fut>(
    broker: Arc<Broker>,
    topic: &'static str,
    mut rx: mpsc::Receiver<Envelope>,
    retry: RetryPolicy,
    mut shutdown: ShutdownSignal,
    handler: F,
) where
    F: Fn(Envelope) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    loop {
        tokio::select! {
            _ = shutdown.wait() => {
                debug!(topic, "consumer stopping on shutdown");
                break;
            }
            next = rx.recv() => {
                let Some(envelope) = next else {
                    debug!(topic, "consumer stopping on channel close");
                    break;
                };
                let outcome =
                    retry_async(&retry, topic, || handler(envelope.clone())).await;
                if let Err(err) = outcome {
                    // ack + dead-letter; the partition moves on
                    broker.publish_dlq(&envelope, &err);
                }
            }
        }
    }
}

/// Spawn one consumer task per partition of a registered topic.
pub fn spawn_consumers<F, Fut>(
    broker: Arc<Broker>,
    topic: &'static str,
    retry: RetryPolicy,
    shutdown: ShutdownSignal,
    handler: F,
) -> Vec<JoinHandle<()>>
where
    F: Fn(Envelope) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    let receivers = broker
        .take_receivers(topic)
        .unwrap_or_else(|| panic!("topic {topic} not registered or already claimed"));
    info!(topic, partitions = receivers.len(), "consumers starting");
    receivers
        .into_iter()
        .map(|rx| {
            let broker = broker.clone();
            let handler = handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                run_partition(broker, topic, rx, retry, shutdown, handler).await;
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::PlatformError;
    use crate::shutdown::ShutdownCoordinator;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn tiny_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_handler_processes_messages() {
        let broker = Arc::new(Broker::new());
        broker.register_topic("T", 2, 16);
        let coordinator = ShutdownCoordinator::new();
        let count = Arc::new(AtomicU32::new(0));

        let count_in = count.clone();
        let handles = spawn_consumers(
            broker.clone(),
            "T",
            tiny_retry(1),
            coordinator.signal(),
            move |_envelope| {
                let count = count_in.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        for i in 0..5 {
            broker
                .publish("T", &format!("k{i}"), &serde_json::json!({"i": i}))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);

        coordinator
            .shutdown(Duration::from_millis(100), Duration::from_millis(10))
            .await;
        for handle in handles {
            let _ = handle.await;
        }
    }

    #[tokio::test]
    async fn test_poison_message_goes_to_dlq_and_partition_continues() {
        let broker = Arc::new(Broker::new());
        broker.register_topic("T", 1, 16);
        let coordinator = ShutdownCoordinator::new();
        let mut dlq = broker.take_receivers("T.DLQ").unwrap();
        let processed = Arc::new(AtomicU32::new(0));

        let processed_in = processed.clone();
        let _handles = spawn_consumers(
            broker.clone(),
            "T",
            tiny_retry(1),
            coordinator.signal(),
            move |envelope| {
                let processed = processed_in.clone();
                async move {
                    if envelope.payload["poison"].as_bool().unwrap_or(false) {
                        Err(PlatformError::Parse("poison".into()))
                    } else {
                        processed.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }
            },
        );

        broker.publish("T", "k", &serde_json::json!({"poison": true})).await.unwrap();
        broker.publish("T", "k", &serde_json::json!({"poison": false})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The good message after the poison one was still processed
        assert_eq!(processed.load(Ordering::SeqCst), 1);
        let dead = dlq[0].try_recv().unwrap();
        assert_eq!(dead.payload["error_code"], "PARSE_FAILED-502");
    }

    #[tokio::test]
    async fn test_retryable_failure_retries_then_dead_letters() {
        let broker = Arc::new(Broker::new());
        broker.register_topic("T", 1, 16);
        let coordinator = ShutdownCoordinator::new();
        let mut dlq = broker.take_receivers("T.DLQ").unwrap();
        let attempts = Arc::new(AtomicU32::new(0));

        let attempts_in = attempts.clone();
        let _handles = spawn_consumers(
            broker.clone(),
            "T",
            tiny_retry(3),
            coordinator.signal(),
            move |_| {
                let attempts = attempts_in.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(PlatformError::DbContention("deadlock".into()))
                }
            },
        );

        broker.publish("T", "k", &serde_json::json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let dead = dlq[0].try_recv().unwrap();
        assert_eq!(dead.payload["error_code"], "DB_DEADLOCK-304");
    }
}
