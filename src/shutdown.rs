//! Graceful Shutdown
//!
//! Shutdown sequence: flip the shutting-down flag (consumers stop taking new
//! work), wait up to a grace period for in-flight tasks, then run registered
//! cleanup tasks in parallel under a second grace budget, then exit.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cloneable handle consumers select on to stop taking new work.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is signalled (or the coordinator is gone).
    pub async fn wait(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cleanups: Mutex<Vec<(String, CleanupFuture)>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            tasks: Mutex::new(Vec::new()),
            cleanups: Mutex::new(Vec::new()),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Track an in-flight worker task for the drain phase.
    pub fn register_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Register a cleanup to run after the drain phase.
    pub fn register_cleanup<F>(&self, name: &str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cleanups.lock().push((name.to_string(), Box::pin(fut)));
    }

    /// Run the full sequence. Tasks still running after `grace` are
    /// abandoned; cleanups run in parallel under `cleanup_grace`.
    pub async fn shutdown(&self, grace: Duration, cleanup_grace: Duration) {
        info!("shutdown: stopping intake");
        let _ = self.tx.send(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        let drain = async {
            for handle in tasks {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "shutdown: drain grace exceeded");
        }

        let cleanups: Vec<(String, CleanupFuture)> = self.cleanups.lock().drain(..).collect();
        if !cleanups.is_empty() {
            info!(count = cleanups.len(), "shutdown: running cleanups");
            let all = futures_join_all(cleanups);
            if tokio::time::timeout(cleanup_grace, all).await.is_err() {
                warn!("shutdown: cleanup grace exceeded");
            }
        }
        info!("shutdown complete");
    }
}

async fn futures_join_all(cleanups: Vec<(String, CleanupFuture)>) {
    let handles: Vec<JoinHandle<()>> = cleanups
        .into_iter()
        .map(|(name, fut)| {
            tokio::spawn(async move {
                fut.await;
                info!(cleanup = %name, "cleanup done");
            })
        })
        .collect();
    for handle in handles {
        let _ = handle.await;
    }
}
