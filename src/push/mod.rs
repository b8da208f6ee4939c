//! Push notification delivery.
//!
//! [`PushService`] is constructed once at startup and shared. The underlying
//! [`PushClient`] is connected on first use; concurrent first callers wait on
//! the same connection attempt, and a failed attempt leaves the service
//! unconnected so a later call can try again.

use crate::db::{Notification, NotificationStatus, Severity};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Push error types.
#[derive(Error, Debug)]
pub enum PushError {
    #[error("push delivery is not configured")]
    NotConfigured,
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("push provider rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub app_id: String,
    pub api_key: String,
    pub api_url: String,
}

/// Data attached to a push notification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushData {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    /// Id of the notification row this push announces, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<String>,
}

/// A foreground push event as delivered by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    /// Provider-assigned notification id.
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(rename = "additionalData", default)]
    pub additional_data: PushData,
}

impl PushPayload {
    pub fn into_notification(self, now: DateTime<Utc>) -> Notification {
        let data = self.additional_data;
        Notification {
            id: data
                .notification_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            kind: data.kind.unwrap_or_else(|| "push".to_string()),
            title: self.title,
            message: self.body,
            severity: data
                .severity
                .and_then(|s| s.parse().ok())
                .unwrap_or(Severity::Medium),
            status: data
                .status
                .and_then(|s| s.parse().ok())
                .unwrap_or(NotificationStatus::New),
            timestamp: now,
            site: data.site,
            topic_id: data.topic_id,
            provider_id: Some(self.id),
            comments: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

/// A connected push provider client.
pub struct PushClient {
    http: reqwest::Client,
    config: PushConfig,
}

impl PushClient {
    /// Connect to the provider, verifying the application credentials.
    pub async fn connect(config: PushConfig) -> Result<Self, PushError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;

        let url = format!("{}/apps/{}", config.api_url.trim_end_matches('/'), config.app_id);
        let response = http
            .get(&url)
            .header("Authorization", format!("Basic {}", config.api_key))
            .send()
            .await?;
        check_status(response).await?;

        tracing::info!("Push: connected to app {}", config.app_id);
        Ok(Self { http, config })
    }

    /// Send a push to all subscribed users. Returns the provider id.
    pub async fn send(&self, title: &str, body: &str, data: &PushData) -> Result<String, PushError> {
        let url = format!("{}/notifications", self.config.api_url.trim_end_matches('/'));
        let request = json!({
            "app_id": self.config.app_id,
            "headings": { "en": title },
            "contents": { "en": body },
            "data": data,
            "included_segments": ["Subscribed Users"],
        });

        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Basic {}", self.config.api_key))
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;
        let sent: SendResponse = response.json().await?;
        Ok(sent.id)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, PushError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(PushError::Rejected {
        status: status.as_u16(),
        body,
    })
}

/// Process-wide push service with lazy, single-flight connection.
pub struct PushService {
    config: Option<PushConfig>,
    client: OnceCell<PushClient>,
}

impl PushService {
    pub fn new(config: Option<PushConfig>) -> Self {
        Self {
            config,
            client: OnceCell::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.client.initialized()
    }

    /// The connected client, connecting first if needed.
    pub async fn client(&self) -> Result<&PushClient, PushError> {
        let config = self.config.as_ref().ok_or(PushError::NotConfigured)?;
        self.client
            .get_or_try_init(|| async {
                PushClient::connect(config.clone()).await.map_err(|e| {
                    tracing::error!("Push: initialization failed: {}", e);
                    e
                })
            })
            .await
    }

    pub async fn send(&self, title: &str, body: &str, data: &PushData) -> Result<String, PushError> {
        self.client().await?.send(title, body, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::State,
        http::StatusCode,
        routing::{get, post},
        Json, Router,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Provider {
        connects: Arc<AtomicUsize>,
        failures_left: Arc<AtomicUsize>,
    }

    async fn serve(provider: Provider) -> String {
        async fn app(State(p): State<Provider>) -> StatusCode {
            tokio::time::sleep(Duration::from_millis(20)).await;
            p.connects.fetch_add(1, Ordering::SeqCst);
            let left = p.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                p.failures_left.store(left - 1, Ordering::SeqCst);
                StatusCode::UNAUTHORIZED
            } else {
                StatusCode::OK
            }
        }

        async fn notify() -> Json<serde_json::Value> {
            Json(json!({ "id": "push-123" }))
        }

        let router = Router::new()
            .route("/apps/{id}", get(app))
            .route("/notifications", post(notify))
            .with_state(provider);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(api_url: String) -> PushConfig {
        PushConfig {
            app_id: "app-1".to_string(),
            api_key: "secret".to_string(),
            api_url,
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_connect_once() {
        let provider = Provider::default();
        let url = serve(provider.clone()).await;
        let service = Arc::new(PushService::new(Some(config(url))));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let service = service.clone();
                tokio::spawn(async move { service.client().await.is_ok() })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }

        assert_eq!(provider.connects.load(Ordering::SeqCst), 1);
        assert!(service.is_connected());
        assert_eq!(service.send("t", "b", &PushData::default()).await.unwrap(), "push-123");
    }

    #[tokio::test]
    async fn test_failed_connect_allows_retry() {
        let provider = Provider::default();
        provider.failures_left.store(1, Ordering::SeqCst);
        let url = serve(provider.clone()).await;
        let service = PushService::new(Some(config(url)));

        let err = service.client().await.err().unwrap();
        assert!(matches!(err, PushError::Rejected { status: 401, .. }));
        assert!(!service.is_connected());

        assert!(service.client().await.is_ok());
        assert_eq!(provider.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unconfigured_service() {
        let service = PushService::new(None);
        assert!(!service.is_configured());
        assert!(matches!(service.client().await, Err(PushError::NotConfigured)));
    }

    #[test]
    fn test_payload_into_notification() {
        let payload: PushPayload = serde_json::from_value(json!({
            "id": "os-1",
            "title": "Site down",
            "body": "example.com is not responding",
            "additionalData": {
                "type": "site_down",
                "site": "example.com",
                "status": "acknowledged",
                "severity": "high",
                "notification_id": "n-1"
            }
        }))
        .unwrap();

        let now = Utc::now();
        let n = payload.into_notification(now);
        assert_eq!(n.id, "n-1");
        assert_eq!(n.kind, "site_down");
        assert_eq!(n.site.as_deref(), Some("example.com"));
        assert_eq!(n.status, NotificationStatus::Acknowledged);
        assert_eq!(n.severity, Severity::High);
        assert_eq!(n.provider_id.as_deref(), Some("os-1"));
        assert_eq!(n.timestamp, now);
    }

    #[test]
    fn test_payload_defaults() {
        let payload: PushPayload =
            serde_json::from_value(json!({ "id": "os-2", "title": "Hello" })).unwrap();
        let n = payload.into_notification(Utc::now());
        assert_eq!(n.kind, "push");
        assert_eq!(n.severity, Severity::Medium);
        assert_eq!(n.status, NotificationStatus::New);
        assert!(!n.id.is_empty());
    }
}
