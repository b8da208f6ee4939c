//! Retention manager for cleaning up old ping logs.

use crate::db::Store;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Manager for deleting ping logs past their retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: ChronoDuration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention: ChronoDuration) -> Self {
        Self {
            store,
            retention,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let stop = self.stop.clone();
        let retention = self.retention;

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(Duration::from_secs(3600));

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention);
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &Store, retention: ChronoDuration) -> usize {
    let cutoff = Utc::now() - retention;

    match store.delete_ping_logs_before(cutoff) {
        Ok(0) => 0,
        Ok(n) => {
            tracing::info!("RetentionManager: Deleted {} ping logs before {}", n, cutoff);
            n
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to delete ping logs: {}", e);
            0
        }
    }
}
