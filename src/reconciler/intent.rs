//! Pending remote writes.

use super::Command;
use crate::db::Notification;

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A debounced remote write for one notification.
///
/// Owns the timer that will ask the reconciler to flush the write. Dropping
/// the intent cancels the timer without flushing.
pub struct WriteIntent {
    /// Last confirmed state, restored if the write fails.
    pub snapshot: Notification,
    pub generation: u64,
    timer: JoinHandle<()>,
}

impl WriteIntent {
    pub(crate) fn schedule(
        id: String,
        snapshot: Notification,
        generation: u64,
        delay: Duration,
        tx: mpsc::WeakSender<Command>,
    ) -> Self {
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::WriteDue { id, generation }).await;
            }
        });

        Self {
            snapshot,
            generation,
            timer,
        }
    }
}

impl Drop for WriteIntent {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
