//! HTTP request handlers.

use super::AppState;
use crate::db::{DbError, MonitoredSite, Notification, NotificationStatus, Severity, Topic};
use crate::functions::{FunctionsError, TestAlertRequest};
use crate::push::{PushData, PushPayload};
use crate::reconciler::{admits, NotificationEdit, ReconcileError};
use crate::uptime::{derive_incidents, summarize, Incident};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on pings returned by one request.
const MAX_PING_PAGE: u32 = 1000;

fn db_error(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

fn reconcile_error(e: ReconcileError) -> Response {
    let status = match &e {
        ReconcileError::NotFound(_) => StatusCode::NOT_FOUND,
        ReconcileError::InvalidEdit(_) => StatusCode::BAD_REQUEST,
        ReconcileError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        ReconcileError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string()).into_response()
}

fn functions_error(e: FunctionsError) -> Response {
    let status = match &e {
        FunctionsError::NotConfigured => StatusCode::SERVICE_UNAVAILABLE,
        FunctionsError::Http(_) | FunctionsError::Failed { .. } => StatusCode::BAD_GATEWAY,
    };
    (status, e.to_string()).into_response()
}

// ============================================================================
// API: Sites
// ============================================================================

pub async fn handle_get_sites(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_sites() {
        Ok(sites) => Json(sites).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateSiteRequest {
    pub name: String,
    pub url: String,
}

pub async fn handle_create_site(
    State(state): State<AppState>,
    Json(req): Json<CreateSiteRequest>,
) -> impl IntoResponse {
    if req.url.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "url is required").into_response();
    }

    let name = if req.name.trim().is_empty() {
        req.url.trim().to_string()
    } else {
        req.name.trim().to_string()
    };
    let mut site = MonitoredSite {
        name,
        url: req.url.trim().to_string(),
        ..Default::default()
    };

    match state.store.add_site(&mut site) {
        Ok(_) => {
            state.scheduler.add_site(site.clone()).await;
            (StatusCode::CREATED, Json(site)).into_response()
        }
        Err(e) => db_error(e),
    }
}

pub async fn handle_delete_site(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    state.scheduler.remove_site(id).await;

    match state.store.delete_site(id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct PingsQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn handle_get_pings(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<PingsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(state.config.ping_page_size)
        .clamp(1, MAX_PING_PAGE);

    match state.store.get_recent_pings(id, limit) {
        Ok(pings) => Json(pings).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct IncidentsResponse {
    pub site_id: i64,
    pub incidents: Vec<Incident>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn handle_get_incidents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if let Err(e) = state.store.get_site(id) {
        return db_error(e);
    }

    // A failed fetch is reported alongside an empty list, never derived from.
    match state.store.get_recent_pings(id, state.config.ping_page_size) {
        Ok(pings) => Json(IncidentsResponse {
            site_id: id,
            incidents: derive_incidents(&pings),
            error: None,
        })
        .into_response(),
        Err(e) => {
            tracing::error!("Failed to load pings for site {}: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IncidentsResponse {
                    site_id: id,
                    incidents: Vec::new(),
                    error: Some(e.to_string()),
                }),
            )
                .into_response()
        }
    }
}

pub async fn handle_get_summary(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    if let Err(e) = state.store.get_site(id) {
        return db_error(e);
    }

    match state.store.get_recent_pings(id, state.config.ping_page_size) {
        Ok(pings) => Json(summarize(&pings, Utc::now())).into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// API: Notifications
// ============================================================================

pub async fn handle_get_notifications(State(state): State<AppState>) -> impl IntoResponse {
    match state.reconciler.snapshot().await {
        Ok(list) => Json(list).into_response(),
        Err(e) => reconcile_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationDetail {
    #[serde(flatten)]
    pub notification: Notification,
    /// An edit is applied locally but not yet written.
    pub pending_write: bool,
}

/// Notifications older than the loaded page are read from the store.
pub async fn handle_get_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let local = match state.reconciler.get(&id).await {
        Ok(local) => local,
        Err(e) => return reconcile_error(e),
    };

    let (notification, pending_write) = match local {
        Some(n) => match state.reconciler.is_pending(&id).await {
            Ok(pending) => (n, pending),
            Err(e) => return reconcile_error(e),
        },
        None => match state.store.get_notification(&id) {
            Ok(n) => (n, false),
            Err(e) => return db_error(e),
        },
    };

    Json(NotificationDetail {
        notification,
        pending_write,
    })
    .into_response()
}

fn default_kind() -> String {
    "manual".to_string()
}

fn default_severity() -> Severity {
    Severity::Medium
}

#[derive(Debug, Deserialize)]
pub struct CreateNotificationRequest {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub topic_id: Option<String>,
    /// Also deliver the notification through the push provider.
    #[serde(default)]
    pub push: bool,
}

pub async fn handle_create_notification(
    State(state): State<AppState>,
    Json(req): Json<CreateNotificationRequest>,
) -> impl IntoResponse {
    if req.title.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "title is required").into_response();
    }

    let mut n = Notification::new(&req.kind, req.title.trim(), &req.message, req.severity);
    n.site = req.site;
    n.topic_id = req.topic_id;

    // The realtime feed carries the new row into the reconciler.
    if let Err(e) = state.store.insert_notification(&n) {
        return db_error(e);
    }

    if req.push {
        deliver_push(&state, &mut n).await;
    }

    (StatusCode::CREATED, Json(n)).into_response()
}

/// Push a stored notification and record the provider id on success.
async fn deliver_push(state: &AppState, n: &mut Notification) {
    if !state.push.is_configured() {
        tracing::warn!("Push requested for {} but push is not configured", n.id);
        return;
    }

    let data = PushData {
        kind: Some(n.kind.clone()),
        site: n.site.clone(),
        topic_id: n.topic_id.clone(),
        status: Some(n.status.to_string()),
        severity: Some(n.severity.to_string()),
        notification_id: Some(n.id.clone()),
    };

    match state.push.send(&n.title, &n.message, &data).await {
        Ok(provider_id) => {
            if let Err(e) = state.store.set_provider_id(&n.id, &provider_id) {
                tracing::error!("Failed to record provider id for {}: {}", n.id, e);
            }
            n.provider_id = Some(provider_id);
        }
        Err(e) => tracing::error!("Push delivery failed for {}: {}", n.id, e),
    }
}

pub async fn handle_clear_notifications(State(state): State<AppState>) -> impl IntoResponse {
    match state.reconciler.clear_all().await {
        Ok(cleared) => Json(serde_json::json!({ "cleared": cleared })).into_response(),
        Err(e) => reconcile_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: NotificationStatus,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CommentRequest {
    pub text: String,
    pub user_id: String,
}

/// Apply an edit and answer with the optimistic state.
async fn apply_edit(state: &AppState, id: &str, edit: NotificationEdit) -> Response {
    if let Err(e) = state.reconciler.edit(id, edit).await {
        return reconcile_error(e);
    }

    match state.reconciler.get(id).await {
        Ok(Some(n)) => (StatusCode::ACCEPTED, Json(n)).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Not found").into_response(),
        Err(e) => reconcile_error(e),
    }
}

pub async fn handle_update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StatusRequest>,
) -> impl IntoResponse {
    let edit = NotificationEdit::SetStatus {
        status: req.status,
        user_id: req.user_id,
    };
    apply_edit(&state, &id, edit).await
}

pub async fn handle_add_comment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<CommentRequest>,
) -> impl IntoResponse {
    let edit = NotificationEdit::AddComment {
        text: req.text,
        user_id: req.user_id,
    };
    apply_edit(&state, &id, edit).await
}

pub async fn handle_get_failures(State(state): State<AppState>) -> impl IntoResponse {
    let failures = state.failures.lock().await;
    // Newest first
    let list: Vec<_> = failures.iter().rev().cloned().collect();
    Json(list)
}

// ============================================================================
// API: Topics
// ============================================================================

pub async fn handle_get_topics(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.get_topics() {
        Ok(topics) => Json(topics).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateTopicRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

pub async fn handle_create_topic(
    State(state): State<AppState>,
    Json(req): Json<CreateTopicRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "name is required").into_response();
    }

    let topic = Topic {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name.trim().to_string(),
        description: req.description,
    };

    match state.store.add_topic(&topic) {
        Ok(_) => (StatusCode::CREATED, Json(topic)).into_response(),
        Err(e) => db_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub user_id: String,
}

pub async fn handle_subscribe(
    State(state): State<AppState>,
    Path(topic_id): Path<String>,
    Json(req): Json<SubscriptionRequest>,
) -> impl IntoResponse {
    if req.user_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "user_id is required").into_response();
    }

    match state.store.subscribe_topic(&topic_id, req.user_id.trim()) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => db_error(e),
    }
}

pub async fn handle_unsubscribe(
    State(state): State<AppState>,
    Path(topic_id): Path<String>,
    Query(req): Query<SubscriptionRequest>,
) -> impl IntoResponse {
    match state.store.unsubscribe_topic(&topic_id, req.user_id.trim()) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => db_error(e),
    }
}

/// Subscribers come from the hosted function when one is configured.
pub async fn handle_get_subscribers(
    State(state): State<AppState>,
    Path(topic_id): Path<String>,
) -> impl IntoResponse {
    if let Some(functions) = &state.functions {
        return match functions.get_topic_subscribers(&topic_id).await {
            Ok(value) => Json(value).into_response(),
            Err(e) => functions_error(e),
        };
    }

    match state.store.get_topic_subscribers(&topic_id) {
        Ok(subs) => Json(subs).into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// API: Inbound
// ============================================================================

fn str_field<'a>(payload: &'a Value, key: &str) -> Option<&'a str> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Build a notification from an arbitrary webhook payload.
pub fn notification_from_webhook(source: &str, payload: &Value) -> Notification {
    let title = str_field(payload, "title")
        .map(str::to_string)
        .unwrap_or_else(|| format!("Webhook from {}", source));
    let message = str_field(payload, "message")
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string());
    let severity = str_field(payload, "severity")
        .and_then(|s| s.to_lowercase().parse().ok())
        .unwrap_or(Severity::Medium);
    let kind = str_field(payload, "type").unwrap_or("webhook");

    let mut n = Notification::new(kind, &title, &message, severity);
    n.site = str_field(payload, "site").map(str::to_string);
    n.topic_id = str_field(payload, "topic_id").map(str::to_string);
    n
}

pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(source): Path<String>,
    body: String,
) -> impl IntoResponse {
    let payload: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("Invalid JSON: {}", e)).into_response(),
    };

    let source = match state.store.get_or_create_webhook_source(&source) {
        Ok(s) => s,
        Err(e) => return db_error(e),
    };

    let n = notification_from_webhook(&source.name, &payload);
    if let Err(e) = state.store.insert_notification(&n) {
        return db_error(e);
    }
    if let Err(e) = state.store.add_webhook_event(source.id, &body, Some(&n.id)) {
        return db_error(e);
    }

    tracing::info!("Webhook from {} created notification {}", source.name, n.id);
    (StatusCode::CREATED, Json(n)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub limit: Option<u32>,
}

pub async fn handle_get_webhook_events(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.store.get_webhook_events(&source, limit) {
        Ok(events) => Json(events).into_response(),
        Err(e) => db_error(e),
    }
}

/// A push delivered to the foreground goes straight into the list.
pub async fn handle_push_event(
    State(state): State<AppState>,
    Json(payload): Json<PushPayload>,
) -> impl IntoResponse {
    let mut n = payload.into_notification(Utc::now());

    // Pushes we sent ourselves already have a row; reuse its id.
    if let Some(provider_id) = n.provider_id.as_deref() {
        match state.store.find_notification_by_provider_id(provider_id) {
            Ok(Some(id)) => n.id = id,
            Ok(None) => {}
            Err(e) => tracing::warn!("Provider id lookup failed for {}: {}", provider_id, e),
        }
    }

    if !admits(state.filter.as_ref(), &n) {
        tracing::debug!("Ignoring push {} outside the notification filter", n.id);
        return StatusCode::ACCEPTED.into_response();
    }

    match state.reconciler.push_received(n).await {
        Ok(_) => StatusCode::ACCEPTED.into_response(),
        Err(e) => reconcile_error(e),
    }
}

pub async fn handle_test_alert(
    State(state): State<AppState>,
    Json(req): Json<TestAlertRequest>,
) -> impl IntoResponse {
    let Some(functions) = &state.functions else {
        return functions_error(FunctionsError::NotConfigured);
    };

    match functions.send_test_alert(&req).await {
        Ok(value) => Json(value).into_response(),
        Err(e) => functions_error(e),
    }
}

// ============================================================================
// API: Status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub sites_probed: usize,
    pub push_configured: bool,
    pub push_connected: bool,
    pub functions_configured: bool,
    pub recent_failures: usize,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let recent_failures = state.failures.lock().await.len();
    Json(StatusResponse {
        sites_probed: state.scheduler.site_count().await,
        push_configured: state.push.is_configured(),
        push_connected: state.push.is_connected(),
        functions_configured: state.functions.is_some(),
        recent_failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::{PingLog, Store};
    use crate::push::PushService;
    use crate::realtime::{RetryPolicy, RowFilter};
    use crate::reconciler::{self, pump_changes, ReconcilerSettings};
    use crate::scheduler::{ProbeSettings, Scheduler};
    use crate::web::routes;

    use axum::body::Body;
    use axum::http::Request;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    async fn test_state() -> (NamedTempFile, AppState) {
        test_state_filtered(None).await
    }

    async fn test_state_filtered(filter: Option<RowFilter>) -> (NamedTempFile, AppState) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let settings = ProbeSettings {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(100),
        };
        let scheduler =
            Arc::new(Scheduler::new(store.clone(), settings, ChronoDuration::days(30)).unwrap());
        let (handle, failures) =
            reconciler::spawn(store.clone(), vec![], ReconcilerSettings::default());
        tokio::spawn(pump_changes(
            store.feed().clone(),
            handle.clone(),
            filter.clone(),
            RetryPolicy::default(),
        ));

        let state = AppState {
            config: ServerConfig::default(),
            store,
            scheduler,
            reconciler: handle,
            filter,
            push: Arc::new(PushService::new(None)),
            functions: None,
            failures: Default::default(),
        };
        state.collect_failures(failures);
        // Let the feed subscriptions attach
        tokio::time::sleep(Duration::from_millis(20)).await;
        (tmp, state)
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = routes(state.clone())
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn test_notification_from_webhook() {
        let payload = serde_json::json!({
            "title": "Disk full",
            "severity": "HIGH",
            "site": "db-1",
        });
        let n = notification_from_webhook("grafana", &payload);
        assert_eq!(n.title, "Disk full");
        assert_eq!(n.severity, Severity::High);
        assert_eq!(n.kind, "webhook");
        assert_eq!(n.site.as_deref(), Some("db-1"));

        let n = notification_from_webhook("grafana", &serde_json::json!({ "value": 3 }));
        assert_eq!(n.title, "Webhook from grafana");
        assert_eq!(n.message, r#"{"value":3}"#);
        assert_eq!(n.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn test_sites_and_incidents() {
        let (_tmp, state) = test_state().await;

        let (status, site) = call(
            &state,
            "POST",
            "/api/sites",
            Some(serde_json::json!({ "name": "Example", "url": "http://127.0.0.1:9" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let site_id = site["id"].as_i64().unwrap();

        let now = Utc::now();
        let ping = |secs: i64, is_up: bool| PingLog {
            id: 0,
            site_id,
            is_up,
            response_time_ms: is_up.then_some(50),
            status_code: Some(if is_up { 200 } else { 503 }),
            status_text: if is_up { "OK".to_string() } else { String::new() },
            checked_at: now - ChronoDuration::seconds(secs),
        };
        state
            .store
            .add_ping_logs(&[ping(600, true), ping(300, false), ping(120, true)])
            .unwrap();

        let (status, body) = call(&state, "GET", &format!("/api/sites/{}/incidents", site_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let incidents = body["incidents"].as_array().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0]["reason"], "Service Unavailable");
        assert_eq!(incidents[0]["duration_human"], "3m 0s");
        assert!(body.get("error").is_none());

        let (status, summary) = call(&state, "GET", &format!("/api/sites/{}/summary", site_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(summary["incident_count"], 1);

        let (status, _) = call(&state, "GET", "/api/sites/999/incidents", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&state, "DELETE", &format!("/api/sites/{}", site_id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(state.scheduler.site_count().await, 0);
    }

    #[tokio::test]
    async fn test_notification_edit_flow() {
        let (_tmp, state) = test_state().await;

        let (status, created) = call(
            &state,
            "POST",
            "/api/notifications",
            Some(serde_json::json!({ "title": "example.com down", "severity": "high" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = created["id"].as_str().unwrap().to_string();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, list) = call(&state, "GET", "/api/notifications", None).await;
        assert_eq!(list.as_array().unwrap().len(), 1);

        let (_, detail) = call(&state, "GET", &format!("/api/notifications/{}", id), None).await;
        assert_eq!(detail["pending_write"], false);

        let (status, edited) = call(
            &state,
            "POST",
            &format!("/api/notifications/{}/status", id),
            Some(serde_json::json!({ "status": "acknowledged", "user_id": "user-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(edited["status"], "acknowledged");
        assert_eq!(edited["comments"][0]["text"], "Status changed to acknowledged.");

        let (_, detail) = call(&state, "GET", &format!("/api/notifications/{}", id), None).await;
        assert_eq!(detail["status"], "acknowledged");
        assert_eq!(detail["pending_write"], true);

        let (status, _) = call(
            &state,
            "POST",
            &format!("/api/notifications/{}/comments", id),
            Some(serde_json::json!({ "text": "  ", "user_id": "user-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // After the debounce the edit reaches the store.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let stored = state.store.get_notification(&id).unwrap();
        assert_eq!(stored.status, NotificationStatus::Acknowledged);
        assert_eq!(stored.comments.len(), 1);

        let (status, _) = call(
            &state,
            "POST",
            "/api/notifications/missing/status",
            Some(serde_json::json!({ "status": "resolved", "user_id": "user-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, failures) = call(&state, "GET", "/api/notifications/failures", None).await;
        assert!(failures.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_and_push_events() {
        let (_tmp, state) = test_state().await;

        let (status, created) = call(
            &state,
            "POST",
            "/api/webhooks/grafana",
            Some(serde_json::json!({ "title": "CPU high", "severity": "low" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, events) = call(&state, "GET", "/api/webhooks/grafana/events", None).await;
        assert_eq!(status, StatusCode::OK);
        let events = events.as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["notification_id"], created["id"]);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let push = serde_json::json!({
            "id": "provider-1",
            "title": "Deploy finished",
            "body": "v2 is live",
        });
        let (status, _) = call(&state, "POST", "/api/push/events", Some(push.clone())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let (status, _) = call(&state, "POST", "/api/push/events", Some(push)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, list) = call(&state, "GET", "/api/notifications", None).await;
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["provider_id"], "provider-1");
    }

    #[tokio::test]
    async fn test_push_events_respect_filter() {
        let (_tmp, state) = test_state_filtered(RowFilter::parse("topic_id=eq.outages")).await;

        let other = serde_json::json!({
            "id": "provider-2",
            "title": "Newsletter",
            "additionalData": { "topic_id": "marketing" },
        });
        let (status, _) = call(&state, "POST", "/api/push/events", Some(other)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let wanted = serde_json::json!({
            "id": "provider-3",
            "title": "Database down",
            "additionalData": { "topic_id": "outages" },
        });
        let (status, _) = call(&state, "POST", "/api/push/events", Some(wanted)).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (_, list) = call(&state, "GET", "/api/notifications", None).await;
        let list = list.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["provider_id"], "provider-3");
    }

    #[tokio::test]
    async fn test_topics() {
        let (_tmp, state) = test_state().await;

        let (status, topic) = call(
            &state,
            "POST",
            "/api/topics",
            Some(serde_json::json!({ "name": "outages" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let topic_id = topic["id"].as_str().unwrap().to_string();

        let uri = format!("/api/topics/{}/subscriptions", topic_id);
        let (status, _) = call(&state, "POST", &uri, Some(serde_json::json!({ "user_id": "user-1" }))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, subs) = call(&state, "GET", &format!("/api/topics/{}/subscribers", topic_id), None).await;
        assert_eq!(subs.as_array().unwrap().len(), 1);

        let (status, _) = call(&state, "DELETE", &format!("{}?user_id=user-1", uri), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (_, subs) = call(&state, "GET", &format!("/api/topics/{}/subscribers", topic_id), None).await;
        assert!(subs.as_array().unwrap().is_empty());

        let (status, _) = call(
            &state,
            "POST",
            "/api/topics/unknown/subscriptions",
            Some(serde_json::json!({ "user_id": "user-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status() {
        let (_tmp, state) = test_state().await;
        let (status, body) = call(&state, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sites_probed"], 0);
        assert_eq!(body["push_configured"], false);
        assert_eq!(body["functions_configured"], false);
    }

    #[tokio::test]
    async fn test_test_alert_requires_functions() {
        let (_tmp, state) = test_state().await;
        let (status, _) = call(
            &state,
            "POST",
            "/api/alerts/test",
            Some(serde_json::json!({ "topic_id": "outages" })),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
