//! In-process realtime feed of row changes.
//!
//! Every mutation of a watched table is published as a [`ChangeEvent`]
//! carrying the row as untyped JSON. Consumers hold a [`Subscription`] for
//! one table (optionally narrowed by a [`RowFilter`]) and drain it like a
//! channel. Delivery is at-least-once from the consumer's point of view: a
//! subscriber that falls behind the feed loses events and sees
//! [`SubscriptionStatus::TimedOut`], after which it must re-subscribe.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

pub const NOTIFICATIONS_TABLE: &str = "notifications";
pub const COMMENTS_TABLE: &str = "comments";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A single row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// Row after the change (INSERT/UPDATE).
    pub new: Option<Value>,
    /// Row before the change (DELETE).
    pub old: Option<Value>,
}

impl ChangeEvent {
    pub fn insert(table: &str, row: Value) -> Self {
        Self {
            table: table.to_string(),
            kind: ChangeKind::Insert,
            new: Some(row),
            old: None,
        }
    }

    pub fn update(table: &str, row: Value) -> Self {
        Self {
            table: table.to_string(),
            kind: ChangeKind::Update,
            new: Some(row),
            old: None,
        }
    }

    pub fn delete(table: &str, old: Value) -> Self {
        Self {
            table: table.to_string(),
            kind: ChangeKind::Delete,
            new: None,
            old: Some(old),
        }
    }

    /// The row this event describes, whichever side carries it.
    pub fn row(&self) -> Option<&Value> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// The `id` column of the row, as a string.
    pub fn row_id(&self) -> Option<String> {
        self.row().and_then(|row| column_as_string(row, "id"))
    }
}

fn column_as_string(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Row-level filter, written as `column=eq.value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    Eq { column: String, value: String },
}

impl RowFilter {
    pub fn parse(s: &str) -> Option<Self> {
        let (column, rest) = s.split_once('=')?;
        let value = rest.strip_prefix("eq.")?;
        if column.is_empty() {
            return None;
        }
        Some(RowFilter::Eq {
            column: column.to_string(),
            value: value.to_string(),
        })
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.row().map(|row| self.matches_row(row)).unwrap_or(false)
    }

    pub fn matches_row(&self, row: &Value) -> bool {
        match self {
            RowFilter::Eq { column, value } => column_as_string(row, column)
                .map(|v| v == *value)
                .unwrap_or(false),
        }
    }
}

/// Why a subscription stopped yielding events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    #[error("subscription timed out after missing {0} events")]
    TimedOut(u64),
    #[error("channel error: {0}")]
    ChannelError(String),
    #[error("subscription closed")]
    Closed,
}

/// Re-subscription policy for [`SubscriptionStatus::TimedOut`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Broadcast hub for row changes.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; returns the number of live subscribers.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self, table: &str, filter: Option<RowFilter>) -> Subscription {
        Subscription {
            table: table.to_string(),
            filter,
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A cancellable subscription to one table.
pub struct Subscription {
    table: String,
    filter: Option<RowFilter>,
    rx: Option<broadcast::Receiver<ChangeEvent>>,
}

impl Subscription {
    /// Wait for the next matching event.
    pub async fn recv(&mut self) -> Result<ChangeEvent, SubscriptionStatus> {
        loop {
            let rx = self.rx.as_mut().ok_or(SubscriptionStatus::Closed)?;
            match rx.recv().await {
                Ok(event) => {
                    if event.table != self.table {
                        continue;
                    }
                    if let Some(filter) = &self.filter {
                        if !filter.matches(&event) {
                            continue;
                        }
                    }
                    return Ok(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Err(SubscriptionStatus::TimedOut(missed));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return Err(SubscriptionStatus::ChannelError("feed closed".to_string()));
                }
            }
        }
    }

    /// Close the subscription. Further `recv` calls return `Closed`.
    pub fn close(&mut self) {
        self.rx = None;
    }
}

/// Drive a subscription, handing every event to `on_event` until it returns
/// `false`.
///
/// A `TimedOut` subscription is replaced with a fresh one after
/// `retry.delay`, at most `retry.attempts` times in a row; the counter resets
/// once an event is delivered. Any other status ends the subscription.
pub async fn run_subscription<F, Fut>(
    feed: &ChangeFeed,
    table: &str,
    filter: Option<RowFilter>,
    retry: RetryPolicy,
    on_event: F,
) -> Result<(), SubscriptionStatus>
where
    F: FnMut(ChangeEvent) -> Fut,
    Fut: Future<Output = bool>,
{
    drive_subscription(table, retry, || feed.subscribe(table, filter.clone()), on_event).await
}

async fn drive_subscription<S, F, Fut>(
    table: &str,
    retry: RetryPolicy,
    mut subscribe: S,
    mut on_event: F,
) -> Result<(), SubscriptionStatus>
where
    S: FnMut() -> Subscription,
    F: FnMut(ChangeEvent) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut sub = subscribe();
    let mut retries = 0u32;

    loop {
        match sub.recv().await {
            Ok(event) => {
                retries = 0;
                if !on_event(event).await {
                    sub.close();
                    return Ok(());
                }
            }
            Err(SubscriptionStatus::TimedOut(missed)) => {
                if retries >= retry.attempts {
                    tracing::error!(
                        "Realtime: giving up on {} after {} re-subscribe attempts",
                        table,
                        retries
                    );
                    sub.close();
                    return Err(SubscriptionStatus::TimedOut(missed));
                }
                retries += 1;
                tracing::warn!(
                    "Realtime: {} subscription timed out ({} missed), retry {}/{}",
                    table,
                    missed,
                    retries,
                    retry.attempts
                );
                sub.close();
                tokio::time::sleep(retry.delay).await;
                sub = subscribe();
            }
            Err(status) => {
                tracing::error!("Realtime: {} subscription error: {}", table, status);
                return Err(status);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    #[test]
    fn test_row_filter_parse() {
        let filter = RowFilter::parse("user_id=eq.abc").unwrap();
        assert_eq!(
            filter,
            RowFilter::Eq {
                column: "user_id".to_string(),
                value: "abc".to_string()
            }
        );

        assert!(RowFilter::parse("user_id").is_none());
        assert!(RowFilter::parse("user_id=gt.5").is_none());
        assert!(RowFilter::parse("=eq.5").is_none());
    }

    #[test]
    fn test_row_filter_matches() {
        let filter = RowFilter::parse("site_id=eq.7").unwrap();
        assert!(filter.matches(&ChangeEvent::insert("ping_logs", json!({"site_id": 7}))));
        assert!(!filter.matches(&ChangeEvent::insert("ping_logs", json!({"site_id": 8}))));
        assert!(filter.matches(&ChangeEvent::delete("ping_logs", json!({"site_id": "7"}))));
        assert!(!filter.matches(&ChangeEvent::insert("ping_logs", json!({}))));
    }

    #[tokio::test]
    async fn test_subscription_filters_by_table() {
        let feed = ChangeFeed::new(16);
        let mut sub = feed.subscribe(NOTIFICATIONS_TABLE, None);

        feed.publish(ChangeEvent::insert(COMMENTS_TABLE, json!({"id": "c1"})));
        feed.publish(ChangeEvent::insert(NOTIFICATIONS_TABLE, json!({"id": "n1"})));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.row_id().as_deref(), Some("n1"));
        assert_eq!(event.kind, ChangeKind::Insert);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_times_out() {
        let feed = ChangeFeed::new(2);
        let mut sub = feed.subscribe(NOTIFICATIONS_TABLE, None);

        for i in 0..5 {
            feed.publish(ChangeEvent::insert(NOTIFICATIONS_TABLE, json!({ "id": i })));
        }

        assert_eq!(sub.recv().await, Err(SubscriptionStatus::TimedOut(3)));
    }

    #[tokio::test]
    async fn test_closed_subscription() {
        let feed = ChangeFeed::new(4);
        let mut sub = feed.subscribe(NOTIFICATIONS_TABLE, None);
        sub.close();
        assert_eq!(sub.recv().await, Err(SubscriptionStatus::Closed));

        let mut sub = feed.subscribe(NOTIFICATIONS_TABLE, None);
        drop(feed);
        assert!(matches!(sub.recv().await, Err(SubscriptionStatus::ChannelError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_subscription_resubscribes_after_timeout() {
        let feed = ChangeFeed::new(2);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let retry = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(100),
        };

        let task_feed = feed.clone();
        let task = tokio::spawn(async move {
            run_subscription(&task_feed, NOTIFICATIONS_TABLE, None, retry, move |event| {
                let seen_tx = seen_tx.clone();
                async move { seen_tx.send(event).is_ok() }
            })
            .await
        });

        // Let the task subscribe.
        tokio::time::sleep(Duration::from_millis(1)).await;
        for i in 0..5 {
            feed.publish(ChangeEvent::insert(NOTIFICATIONS_TABLE, json!({ "id": i })));
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        feed.publish(ChangeEvent::insert(NOTIFICATIONS_TABLE, json!({"id": "fresh"})));

        let event = seen_rx.recv().await.unwrap();
        assert_eq!(event.row_id().as_deref(), Some("fresh"));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_subscription_gives_up_after_attempts() {
        let feed = ChangeFeed::new(2);
        let delivered = Arc::new(AtomicUsize::new(0));
        let retry = RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(100),
        };

        let task_feed = feed.clone();
        let counter = delivered.clone();
        let task = tokio::spawn(async move {
            run_subscription(&task_feed, NOTIFICATIONS_TABLE, None, retry, move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { true }
            })
            .await
        });

        // One overflow per subscription: the first and both retries.
        tokio::time::sleep(Duration::from_millis(1)).await;
        for _ in 0..3 {
            for i in 0..5 {
                feed.publish(ChangeEvent::insert(NOTIFICATIONS_TABLE, json!({ "id": i })));
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        let result = task.await.unwrap();
        assert_eq!(result, Err(SubscriptionStatus::TimedOut(3)));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_is_not_retried() {
        let feed = ChangeFeed::new(4);
        let mut spare: Vec<Subscription> = (0..3)
            .map(|_| feed.subscribe(NOTIFICATIONS_TABLE, None))
            .collect();
        drop(feed);

        let subscribed = AtomicUsize::new(0);
        let result = drive_subscription(
            NOTIFICATIONS_TABLE,
            RetryPolicy::default(),
            || {
                subscribed.fetch_add(1, Ordering::SeqCst);
                spare.pop().unwrap()
            },
            |_event| async { true },
        )
        .await;

        assert!(matches!(result, Err(SubscriptionStatus::ChannelError(_))));
        assert_eq!(subscribed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_subscription_stops_when_consumer_declines() {
        let feed = ChangeFeed::new(8);
        let task_feed = feed.clone();
        let task = tokio::spawn(async move {
            run_subscription(
                &task_feed,
                NOTIFICATIONS_TABLE,
                None,
                RetryPolicy::default(),
                |_event| async { false },
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        feed.publish(ChangeEvent::insert(NOTIFICATIONS_TABLE, json!({"id": "n1"})));

        let result = task.await.unwrap();
        assert_eq!(result, Ok(()));
    }
}
