//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A site watched by the prober.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredSite {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Default for MonitoredSite {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            url: String::new(),
            is_active: true,
            created_at: Utc::now(),
        }
    }
}

/// A single uptime probe result. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingLog {
    pub id: i64,
    pub site_id: i64,
    pub is_up: bool,
    pub response_time_ms: Option<i64>,
    pub status_code: Option<i32>,
    pub status_text: String,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    New,
    Acknowledged,
    Resolved,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::New => "new",
            NotificationStatus::Acknowledged => "acknowledged",
            NotificationStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(NotificationStatus::New),
            "acknowledged" => Ok(NotificationStatus::Acknowledged),
            "resolved" => Ok(NotificationStatus::Resolved),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// A comment attached to a notification. Also records status transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub notification_id: String,
    pub user_id: String,
}

impl Comment {
    pub fn new(notification_id: &str, user_id: &str, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            created_at: Utc::now(),
            notification_id: notification_id.to_string(),
            user_id: user_id.to_string(),
        }
    }

    /// Audit comment recorded when a notification changes status.
    pub fn status_change(notification_id: &str, user_id: &str, status: NotificationStatus) -> Self {
        Self::new(notification_id, user_id, format!("Status changed to {}.", status))
    }
}

/// An alert shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub status: NotificationStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
    /// Id assigned by the push provider, if the alert was also pushed.
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub comments: Vec<Comment>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: &str, title: &str, message: &str, severity: Severity) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            severity,
            status: NotificationStatus::New,
            timestamp: now,
            site: None,
            topic_id: None,
            provider_id: None,
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite row fields from a remote copy, keeping local comments.
    pub fn merge_row(&mut self, row: NotificationRow) {
        self.kind = row.kind;
        self.title = row.title;
        self.message = row.message;
        self.severity = row.severity;
        self.status = row.status;
        self.timestamp = row.timestamp;
        self.site = row.site;
        self.topic_id = row.topic_id;
        if row.provider_id.is_some() {
            self.provider_id = row.provider_id;
        }
        self.created_at = row.created_at;
        self.updated_at = row.updated_at;
    }
}

/// A notification row as delivered by the realtime feed (no comments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRow {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub status: NotificationStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Self {
            id: row.id,
            kind: row.kind,
            title: row.title,
            message: row.message,
            severity: row.severity,
            status: row.status,
            timestamp: row.timestamp,
            site: row.site,
            topic_id: row.topic_id,
            provider_id: row.provider_id,
            comments: Vec::new(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl From<&Notification> for NotificationRow {
    fn from(n: &Notification) -> Self {
        Self {
            id: n.id.clone(),
            kind: n.kind.clone(),
            title: n.title.clone(),
            message: n.message.clone(),
            severity: n.severity,
            status: n.status,
            timestamp: n.timestamp,
            site: n.site.clone(),
            topic_id: n.topic_id.clone(),
            provider_id: n.provider_id.clone(),
            created_at: n.created_at,
            updated_at: n.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSubscription {
    pub topic_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// A named inbound webhook source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSource {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A raw payload received from a webhook source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub source_id: i64,
    pub payload: String,
    pub notification_id: Option<String>,
    pub received_at: DateTime<Utc>,
}
