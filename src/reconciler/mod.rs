//! Notification reconciler.
//!
//! A single actor task owns the in-memory notification list. User edits are
//! applied optimistically and written back after a debounce window; rapid
//! edits to one notification coalesce into one write. While a write is
//! pending for a notification, realtime UPDATE events for it are ignored so
//! the optimistic value is not clobbered by an echo of an older row. A failed
//! write, or a write to a row that no longer exists, restores the last
//! confirmed state and is reported on the failure channel. There is no retry
//! and no version check: across processes the last remote write wins.

mod book;
mod intent;

pub use book::*;
pub use intent::*;

use crate::db::{Comment, DbError, Notification, NotificationRow, Store};
use crate::realtime::{
    run_subscription, ChangeEvent, ChangeFeed, ChangeKind, RetryPolicy, RowFilter,
    COMMENTS_TABLE, NOTIFICATIONS_TABLE,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Reconciler error types.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("notification {0} not found")]
    NotFound(String),
    #[error("invalid edit: {0}")]
    InvalidEdit(String),
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("reconciler is shut down")]
    Closed,
}

/// A remote write that did not go through and was rolled back locally.
#[derive(Debug, Clone, Serialize)]
pub struct WriteFailure {
    pub notification_id: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Remote side of the notification list.
pub trait NotificationBackend: Send + Sync + 'static {
    fn notification_exists(&self, id: &str) -> Result<bool, DbError>;
    fn persist_notification(&self, n: &Notification, new_comments: &[Comment]) -> Result<(), DbError>;
    fn clear_notifications(&self) -> Result<usize, DbError>;
}

impl NotificationBackend for Store {
    fn notification_exists(&self, id: &str) -> Result<bool, DbError> {
        Store::notification_exists(self, id)
    }

    fn persist_notification(&self, n: &Notification, new_comments: &[Comment]) -> Result<(), DbError> {
        self.update_notification(n, new_comments)
    }

    fn clear_notifications(&self) -> Result<usize, DbError> {
        Store::clear_notifications(self)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Delay between the last edit and the remote write.
    pub debounce: Duration,
    pub channel_capacity: usize,
    /// Most notifications kept in memory. Entries with a pending write are
    /// kept regardless.
    pub max_items: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            channel_capacity: 256,
            max_items: 200,
        }
    }
}

pub(crate) enum Command {
    Edit {
        id: String,
        edit: NotificationEdit,
        reply: oneshot::Sender<Result<(), ReconcileError>>,
    },
    Ingest(ChangeEvent),
    PushReceived(Notification),
    WriteDue {
        id: String,
        generation: u64,
    },
    Snapshot(oneshot::Sender<Vec<Notification>>),
    Get {
        id: String,
        reply: oneshot::Sender<Option<Notification>>,
    },
    IsPending {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    ClearAll(oneshot::Sender<Result<usize, ReconcileError>>),
    Shutdown,
}

/// Cloneable handle to a running reconciler.
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<Command>,
}

impl ReconcilerHandle {
    async fn send(&self, cmd: Command) -> Result<(), ReconcileError> {
        self.tx.send(cmd).await.map_err(|_| ReconcileError::Closed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ReconcileError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| ReconcileError::Closed)
    }

    /// Apply an edit locally and schedule its remote write.
    pub async fn edit(&self, id: &str, edit: NotificationEdit) -> Result<(), ReconcileError> {
        let id = id.to_string();
        self.request(|reply| Command::Edit { id, edit, reply }).await?
    }

    /// Feed a realtime change event.
    pub async fn ingest(&self, event: ChangeEvent) -> Result<(), ReconcileError> {
        self.send(Command::Ingest(event)).await
    }

    /// Feed a notification delivered by the push provider.
    pub async fn push_received(&self, n: Notification) -> Result<(), ReconcileError> {
        self.send(Command::PushReceived(n)).await
    }

    /// Current notifications, newest first.
    pub async fn snapshot(&self) -> Result<Vec<Notification>, ReconcileError> {
        self.request(Command::Snapshot).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Notification>, ReconcileError> {
        let id = id.to_string();
        self.request(|reply| Command::Get { id, reply }).await
    }

    /// Whether a remote write is waiting for this notification.
    pub async fn is_pending(&self, id: &str) -> Result<bool, ReconcileError> {
        let id = id.to_string();
        self.request(|reply| Command::IsPending { id, reply }).await
    }

    /// Drop every notification, locally and remotely.
    pub async fn clear_all(&self) -> Result<usize, ReconcileError> {
        self.request(Command::ClearAll).await?
    }

    /// Stop the reconciler. Pending writes are discarded.
    pub async fn shutdown(&self) {
        let _ = self.send(Command::Shutdown).await;
    }
}

/// Start a reconciler over `initial` (newest first).
///
/// Returns the handle and a channel of write failures to surface to users.
pub fn spawn<B: NotificationBackend>(
    backend: Arc<B>,
    initial: Vec<Notification>,
    settings: ReconcilerSettings,
) -> (ReconcilerHandle, mpsc::UnboundedReceiver<WriteFailure>) {
    let (tx, rx) = mpsc::channel(settings.channel_capacity.max(1));
    let (failures_tx, failures_rx) = mpsc::unbounded_channel();

    let reconciler = Reconciler {
        backend,
        book: NotificationBook::new(initial),
        pending: HashMap::new(),
        settings,
        next_generation: 0,
        self_tx: tx.downgrade(),
        failures: failures_tx,
    };
    tokio::spawn(reconciler.run(rx));

    (ReconcilerHandle { tx }, failures_rx)
}

struct Reconciler<B> {
    backend: Arc<B>,
    book: NotificationBook,
    pending: HashMap<String, WriteIntent>,
    settings: ReconcilerSettings,
    next_generation: u64,
    self_tx: mpsc::WeakSender<Command>,
    failures: mpsc::UnboundedSender<WriteFailure>,
}

impl<B: NotificationBackend> Reconciler<B> {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        tracing::info!("Reconciler: started with {} notifications", self.book.len());

        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Edit { id, edit, reply } => {
                    let _ = reply.send(self.handle_edit(id, edit));
                }
                Command::Ingest(event) => self.handle_change(event),
                Command::PushReceived(n) => {
                    let id = n.id.clone();
                    if !self.insert(n) {
                        tracing::debug!("Reconciler: duplicate push notification {}", id);
                    }
                }
                Command::WriteDue { id, generation } => self.handle_write_due(id, generation),
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.book.items().to_vec());
                }
                Command::Get { id, reply } => {
                    let _ = reply.send(self.book.get(&id).cloned());
                }
                Command::IsPending { id, reply } => {
                    let _ = reply.send(self.pending.contains_key(&id));
                }
                Command::ClearAll(reply) => {
                    let _ = reply.send(self.handle_clear());
                }
                Command::Shutdown => break,
            }
        }

        if !self.pending.is_empty() {
            tracing::info!(
                "Reconciler: discarding {} pending writes on shutdown",
                self.pending.len()
            );
        }
        self.pending.clear();
        tracing::info!("Reconciler: stopped");
    }

    fn insert(&mut self, n: Notification) -> bool {
        if !self.book.insert(n) {
            return false;
        }
        let pending = &self.pending;
        let dropped = self
            .book
            .trim(self.settings.max_items, |id| pending.contains_key(id));
        if dropped > 0 {
            tracing::debug!("Reconciler: dropped {} oldest notifications", dropped);
        }
        true
    }

    fn handle_edit(&mut self, id: String, edit: NotificationEdit) -> Result<(), ReconcileError> {
        edit.validate().map_err(ReconcileError::InvalidEdit)?;

        let outcome = self
            .book
            .apply_edit(&id, &edit, Utc::now())
            .ok_or_else(|| ReconcileError::NotFound(id.clone()))?;

        let snapshot = match outcome {
            EditOutcome::Applied { snapshot } => snapshot,
            EditOutcome::Unchanged => return Ok(()),
        };

        // A replaced intent keeps its snapshot: nothing since has been confirmed.
        let snapshot = match self.pending.remove(&id) {
            Some(previous) => previous.snapshot.clone(),
            None => snapshot,
        };

        self.next_generation += 1;
        let intent = WriteIntent::schedule(
            id.clone(),
            snapshot,
            self.next_generation,
            self.settings.debounce,
            self.self_tx.clone(),
        );
        self.pending.insert(id, intent);
        Ok(())
    }

    fn handle_write_due(&mut self, id: String, generation: u64) {
        match self.pending.get(&id) {
            Some(intent) if intent.generation == generation => {}
            _ => return,
        }
        let Some(intent) = self.pending.remove(&id) else {
            return;
        };

        let Some(local) = self.book.get(&id).cloned() else {
            return;
        };
        let new_comments = comments_added_since(&intent.snapshot, &local);

        // Backend calls are blocking and run on this task. Each is a short
        // statement against the local connection.
        let result = match self.backend.notification_exists(&id) {
            Ok(true) => self
                .backend
                .persist_notification(&local, &new_comments)
                .map_err(ReconcileError::from),
            Ok(false) => Err(ReconcileError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        };

        match result {
            Ok(()) => tracing::debug!("Reconciler: persisted notification {}", id),
            Err(e) => {
                tracing::warn!("Reconciler: write for {} failed, reverting: {}", id, e);
                self.book.restore(intent.snapshot.clone());
                let _ = self.failures.send(WriteFailure {
                    notification_id: id,
                    reason: e.to_string(),
                    at: Utc::now(),
                });
            }
        }
    }

    fn handle_change(&mut self, event: ChangeEvent) {
        match (event.table.as_str(), event.kind) {
            (NOTIFICATIONS_TABLE, ChangeKind::Insert) => {
                let Some(row) = parse_row::<NotificationRow>(&event) else {
                    return;
                };
                let id = row.id.clone();
                if !self.insert(Notification::from(row)) {
                    tracing::debug!("Reconciler: duplicate insert for {}", id);
                }
            }
            (NOTIFICATIONS_TABLE, ChangeKind::Update) => {
                let Some(id) = event.row_id() else {
                    return;
                };
                if self.pending.contains_key(&id) {
                    tracing::debug!("Reconciler: suppressed update for {} with pending write", id);
                    return;
                }
                if let Some(row) = parse_row::<NotificationRow>(&event) {
                    self.book.merge_remote(row);
                }
            }
            (NOTIFICATIONS_TABLE, ChangeKind::Delete) => {
                let Some(id) = event.row_id() else {
                    return;
                };
                self.pending.remove(&id);
                self.book.remove(&id);
            }
            (COMMENTS_TABLE, ChangeKind::Insert) => {
                if let Some(comment) = parse_row::<Comment>(&event) {
                    self.book.append_comment(comment);
                }
            }
            _ => {}
        }
    }

    fn handle_clear(&mut self) -> Result<usize, ReconcileError> {
        let cleared = self.backend.clear_notifications()?;
        self.pending.clear();
        self.book.clear();
        Ok(cleared)
    }
}

/// Whether a notification passes `filter`. No filter passes everything.
pub fn admits(filter: Option<&RowFilter>, n: &Notification) -> bool {
    let Some(filter) = filter else {
        return true;
    };
    serde_json::to_value(NotificationRow::from(n))
        .map(|row| filter.matches_row(&row))
        .unwrap_or(false)
}

fn parse_row<T: serde::de::DeserializeOwned>(event: &ChangeEvent) -> Option<T> {
    let row = event.row()?;
    match serde_json::from_value(row.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!("Reconciler: malformed {} row: {}", event.table, e);
            None
        }
    }
}

/// Forward notification and comment changes from the feed into the
/// reconciler until it shuts down or the feed gives up.
///
/// `filter` narrows the notification rows; comments are always forwarded
/// and only attach to notifications the reconciler already holds.
pub async fn pump_changes(
    feed: ChangeFeed,
    handle: ReconcilerHandle,
    filter: Option<RowFilter>,
    retry: RetryPolicy,
) {
    let forward = |handle: ReconcilerHandle| {
        move |event: ChangeEvent| {
            let handle = handle.clone();
            async move { handle.ingest(event).await.is_ok() }
        }
    };

    let (notifications, comments) = tokio::join!(
        run_subscription(&feed, NOTIFICATIONS_TABLE, filter, retry, forward(handle.clone())),
        run_subscription(&feed, COMMENTS_TABLE, None, retry, forward(handle)),
    );

    for (table, result) in [(NOTIFICATIONS_TABLE, notifications), (COMMENTS_TABLE, comments)] {
        if let Err(status) = result {
            tracing::error!("Reconciler: {} feed ended: {}", table, status);
        }
    }
}
