//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::realtime::{ChangeEvent, ChangeFeed, COMMENTS_TABLE, NOTIFICATIONS_TABLE};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

const NOTIFICATION_COLUMNS: &str = "id, type, title, message, severity, status, timestamp, site, topic_id, provider_id, created_at, updated_at";

/// Thread-safe database store.
///
/// Mutations of `notifications` and `comments` are published on the
/// store's [`ChangeFeed`].
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    feed: ChangeFeed,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::with_feed(path, ChangeFeed::default())
    }

    /// Create a store that publishes row changes on `feed`.
    pub fn with_feed<P: AsRef<Path>>(path: P, feed: ChangeFeed) -> Result<Self, DbError> {
        let mut conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        embedded::migrations::runner()
            .run(&mut conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            feed,
        })
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn
            .lock()
            .map_err(|_| DbError::Unavailable("connection lock poisoned".to_string()))
    }

    fn publish_notification(&self, event: fn(&str, serde_json::Value) -> ChangeEvent, n: &Notification) {
        match serde_json::to_value(NotificationRow::from(n)) {
            Ok(row) => {
                self.feed.publish(event(NOTIFICATIONS_TABLE, row));
            }
            Err(e) => tracing::warn!("Store: failed to encode notification {}: {}", n.id, e),
        }
    }

    fn publish_comment(&self, comment: &Comment) {
        match serde_json::to_value(comment) {
            Ok(row) => {
                self.feed.publish(ChangeEvent::insert(COMMENTS_TABLE, row));
            }
            Err(e) => tracing::warn!("Store: failed to encode comment {}: {}", comment.id, e),
        }
    }

    // --- Monitored sites ---

    /// Add a new site and return its ID.
    pub fn add_site(&self, site: &mut MonitoredSite) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO monitored_sites (name, url, is_active, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![site.name, site.url, site.is_active, format_db_time(site.created_at)],
        )?;
        let id = conn.last_insert_rowid();
        site.id = id;
        Ok(id)
    }

    /// Get all sites.
    pub fn get_sites(&self) -> Result<Vec<MonitoredSite>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, url, is_active, created_at FROM monitored_sites ORDER BY id",
        )?;
        let sites = stmt
            .query_map([], site_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(sites)
    }

    /// Get sites the prober should watch.
    pub fn get_active_sites(&self) -> Result<Vec<MonitoredSite>, DbError> {
        Ok(self.get_sites()?.into_iter().filter(|s| s.is_active).collect())
    }

    /// Get a site by ID.
    pub fn get_site(&self, id: i64) -> Result<MonitoredSite, DbError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, name, url, is_active, created_at FROM monitored_sites WHERE id = ?1",
            params![id],
            site_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Delete a site and its ping logs.
    pub fn delete_site(&self, id: i64) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM ping_logs WHERE site_id = ?1", params![id])?;
        let deleted = conn.execute("DELETE FROM monitored_sites WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Ping logs ---

    /// Add ping logs in batch.
    ///
    /// Rows for sites that no longer exist are skipped so the rest of the
    /// batch still lands.
    pub fn add_ping_logs(&self, logs: &[PingLog]) -> Result<(), DbError> {
        if logs.is_empty() {
            return Ok(());
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let mut skipped = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO ping_logs (site_id, is_up, response_time_ms, status_code, status_text, checked_at)
                 SELECT ?1, ?2, ?3, ?4, ?5, ?6
                 WHERE EXISTS (SELECT 1 FROM monitored_sites WHERE id = ?1)",
            )?;

            for p in logs {
                let inserted = stmt.execute(params![
                    p.site_id,
                    p.is_up,
                    p.response_time_ms,
                    p.status_code,
                    p.status_text,
                    format_db_time(p.checked_at),
                ])?;
                if inserted == 0 {
                    skipped += 1;
                }
            }
        }

        tx.commit()?;
        if skipped > 0 {
            tracing::debug!("Store: skipped {} ping logs for deleted sites", skipped);
        }
        Ok(())
    }

    /// Get the most recent ping logs for a site, newest first.
    pub fn get_recent_pings(&self, site_id: i64, limit: u32) -> Result<Vec<PingLog>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, site_id, is_up, response_time_ms, status_code, status_text, checked_at
             FROM ping_logs WHERE site_id = ?1 ORDER BY checked_at DESC, id DESC LIMIT ?2",
        )?;

        let logs = stmt
            .query_map(params![site_id, limit], |row| {
                Ok(PingLog {
                    id: row.get(0)?,
                    site_id: row.get(1)?,
                    is_up: row.get(2)?,
                    response_time_ms: row.get(3)?,
                    status_code: row.get(4)?,
                    status_text: row.get(5)?,
                    checked_at: time_column(row, 6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(logs)
    }

    /// Delete ping logs older than the cutoff. Returns the number removed.
    pub fn delete_ping_logs_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM ping_logs WHERE checked_at < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(n)
    }

    // --- Notifications ---

    /// Insert a notification and its comments.
    pub fn insert_notification(&self, n: &Notification) -> Result<(), DbError> {
        {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO notifications ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    NOTIFICATION_COLUMNS
                ),
                params![
                    n.id,
                    n.kind,
                    n.title,
                    n.message,
                    n.severity.as_str(),
                    n.status.as_str(),
                    format_db_time(n.timestamp),
                    n.site,
                    n.topic_id,
                    n.provider_id,
                    format_db_time(n.created_at),
                    format_db_time(n.updated_at),
                ],
            )?;
            for c in &n.comments {
                insert_comment(&tx, c)?;
            }
            tx.commit()?;
        }

        self.publish_notification(ChangeEvent::insert, n);
        Ok(())
    }

    /// Get a notification with its comments.
    pub fn get_notification(&self, id: &str) -> Result<Notification, DbError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS),
                params![id],
                notification_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        let mut n = Notification::from(row);
        n.comments = load_comments(&conn, Some(id))?.remove(id).unwrap_or_default();
        Ok(n)
    }

    /// Find a notification by the push provider's id.
    pub fn find_notification_by_provider_id(&self, provider_id: &str) -> Result<Option<String>, DbError> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT id FROM notifications WHERE provider_id = ?1",
                params![provider_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// List notifications, newest first, with comments attached.
    pub fn list_notifications(&self, limit: u32) -> Result<Vec<Notification>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM notifications ORDER BY timestamp DESC, created_at DESC LIMIT ?1",
            NOTIFICATION_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![limit], notification_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut comments = load_comments(&conn, None)?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let mut n = Notification::from(row);
                n.comments = comments.remove(&n.id).unwrap_or_default();
                n
            })
            .collect())
    }

    pub fn notification_exists(&self, id: &str) -> Result<bool, DbError> {
        let conn = self.lock()?;
        row_exists(&conn, id)
    }

    /// Write the mutable fields of a notification and append new comments.
    pub fn update_notification(&self, n: &Notification, new_comments: &[Comment]) -> Result<(), DbError> {
        {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;
            let updated = tx.execute(
                "UPDATE notifications SET title=?1, message=?2, severity=?3, status=?4, site=?5, topic_id=?6,
                 provider_id=COALESCE(?7, provider_id), updated_at=?8 WHERE id=?9",
                params![
                    n.title,
                    n.message,
                    n.severity.as_str(),
                    n.status.as_str(),
                    n.site,
                    n.topic_id,
                    n.provider_id,
                    format_db_time(n.updated_at),
                    n.id,
                ],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound);
            }
            for c in new_comments {
                insert_comment(&tx, c)?;
            }
            tx.commit()?;
        }

        for c in new_comments {
            self.publish_comment(c);
        }
        self.publish_notification(ChangeEvent::update, n);
        Ok(())
    }

    /// Record the push provider's id for a notification.
    ///
    /// Only `provider_id` is written. The UPDATE published afterwards carries
    /// the row as currently stored.
    pub fn set_provider_id(&self, id: &str, provider_id: &str) -> Result<(), DbError> {
        let n = {
            let conn = self.lock()?;
            let updated = conn.execute(
                "UPDATE notifications SET provider_id=?1 WHERE id=?2",
                params![provider_id, id],
            )?;
            if updated == 0 {
                return Err(DbError::NotFound);
            }
            let row = conn.query_row(
                &format!("SELECT {} FROM notifications WHERE id = ?1", NOTIFICATION_COLUMNS),
                params![id],
                notification_from_row,
            )?;
            Notification::from(row)
        };

        self.publish_notification(ChangeEvent::update, &n);
        Ok(())
    }

    /// Delete every notification. Returns the number removed.
    pub fn clear_notifications(&self) -> Result<usize, DbError> {
        let ids: Vec<String> = {
            let conn = self.lock()?;
            let tx = conn.unchecked_transaction()?;
            let ids = {
                let mut stmt = tx.prepare("SELECT id FROM notifications")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<SqlResult<Vec<String>>>()?;
                ids
            };
            tx.execute("DELETE FROM comments", [])?;
            tx.execute("DELETE FROM notifications", [])?;
            tx.commit()?;
            ids
        };

        for id in &ids {
            self.feed
                .publish(ChangeEvent::delete(NOTIFICATIONS_TABLE, serde_json::json!({ "id": id })));
        }
        Ok(ids.len())
    }

    // --- Topics ---

    pub fn add_topic(&self, topic: &Topic) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO topics (id, name, description) VALUES (?1, ?2, ?3)",
            params![topic.id, topic.name, topic.description],
        )?;
        Ok(())
    }

    pub fn get_topics(&self) -> Result<Vec<Topic>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT id, name, description FROM topics ORDER BY name")?;
        let topics = stmt
            .query_map([], |row| {
                Ok(Topic {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    description: row.get(2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(topics)
    }

    /// Subscribe a user to a topic. Subscribing twice is a no-op.
    pub fn subscribe_topic(&self, topic_id: &str, user_id: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM topics WHERE id = ?1",
            params![topic_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(DbError::NotFound);
        }
        conn.execute(
            "INSERT OR IGNORE INTO topic_subscriptions (topic_id, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![topic_id, user_id, format_db_time(Utc::now())],
        )?;
        Ok(())
    }

    pub fn unsubscribe_topic(&self, topic_id: &str, user_id: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM topic_subscriptions WHERE topic_id = ?1 AND user_id = ?2",
            params![topic_id, user_id],
        )?;
        Ok(())
    }

    pub fn get_topic_subscribers(&self, topic_id: &str) -> Result<Vec<TopicSubscription>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT topic_id, user_id, created_at FROM topic_subscriptions WHERE topic_id = ?1 ORDER BY created_at",
        )?;
        let subs = stmt
            .query_map(params![topic_id], |row| {
                Ok(TopicSubscription {
                    topic_id: row.get(0)?,
                    user_id: row.get(1)?,
                    created_at: time_column(row, 2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(subs)
    }

    // --- Webhooks ---

    /// Look up a webhook source by name, creating it on first use.
    pub fn get_or_create_webhook_source(&self, name: &str) -> Result<WebhookSource, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO webhook_sources (name, created_at) VALUES (?1, ?2)",
            params![name, format_db_time(Utc::now())],
        )?;
        let source = conn.query_row(
            "SELECT id, name, created_at FROM webhook_sources WHERE name = ?1",
            params![name],
            |row| {
                Ok(WebhookSource {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: time_column(row, 2)?,
                })
            },
        )?;
        Ok(source)
    }

    pub fn add_webhook_event(
        &self,
        source_id: i64,
        payload: &str,
        notification_id: Option<&str>,
    ) -> Result<i64, DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO webhook_events (source_id, payload, notification_id, received_at) VALUES (?1, ?2, ?3, ?4)",
            params![source_id, payload, notification_id, format_db_time(Utc::now())],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get the most recent events of a webhook source, newest first.
    pub fn get_webhook_events(&self, source: &str, limit: u32) -> Result<Vec<WebhookEvent>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.source_id, e.payload, e.notification_id, e.received_at
             FROM webhook_events e JOIN webhook_sources s ON s.id = e.source_id
             WHERE s.name = ?1 ORDER BY e.id DESC LIMIT ?2",
        )?;
        let events = stmt
            .query_map(params![source, limit], |row| {
                Ok(WebhookEvent {
                    id: row.get(0)?,
                    source_id: row.get(1)?,
                    payload: row.get(2)?,
                    notification_id: row.get(3)?,
                    received_at: time_column(row, 4)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(events)
    }
}

fn row_exists(conn: &Connection, notification_id: &str) -> Result<bool, DbError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM notifications WHERE id = ?1",
        params![notification_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn insert_comment(conn: &Connection, c: &Comment) -> Result<(), DbError> {
    conn.execute(
        "INSERT OR IGNORE INTO comments (id, notification_id, user_id, text, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![c.id, c.notification_id, c.user_id, c.text, format_db_time(c.created_at)],
    )?;
    Ok(())
}

/// Load comments grouped by notification, oldest first.
fn load_comments(
    conn: &Connection,
    notification_id: Option<&str>,
) -> Result<HashMap<String, Vec<Comment>>, DbError> {
    let mut stmt = conn.prepare(
        "SELECT id, text, created_at, notification_id, user_id FROM comments
         WHERE ?1 IS NULL OR notification_id = ?1 ORDER BY created_at, rowid",
    )?;
    let comments = stmt
        .query_map(params![notification_id], |row| {
            Ok(Comment {
                id: row.get(0)?,
                text: row.get(1)?,
                created_at: time_column(row, 2)?,
                notification_id: row.get(3)?,
                user_id: row.get(4)?,
            })
        })?
        .collect::<SqlResult<Vec<_>>>()?;

    let mut grouped: HashMap<String, Vec<Comment>> = HashMap::new();
    for c in comments {
        grouped.entry(c.notification_id.clone()).or_default().push(c);
    }
    Ok(grouped)
}

fn site_from_row(row: &Row<'_>) -> SqlResult<MonitoredSite> {
    Ok(MonitoredSite {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        is_active: row.get(3)?,
        created_at: time_column(row, 4)?,
    })
}

fn notification_from_row(row: &Row<'_>) -> SqlResult<NotificationRow> {
    let severity: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(NotificationRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        title: row.get(2)?,
        message: row.get(3)?,
        severity: severity.parse().map_err(|e: String| text_error(4, e))?,
        status: status.parse().map_err(|e: String| text_error(5, e))?,
        timestamp: time_column(row, 6)?,
        site: row.get(7)?,
        topic_id: row.get(8)?,
        provider_id: row.get(9)?,
        created_at: time_column(row, 10)?,
        updated_at: time_column(row, 11)?,
    })
}

fn text_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| text_error(idx, format!("invalid timestamp: {}", s)))
}

/// Format a datetime for storage. Lexicographic order matches time order.
fn format_db_time(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
