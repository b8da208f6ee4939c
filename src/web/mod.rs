//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::functions::FunctionsClient;
use crate::push::PushService;
use crate::realtime::RowFilter;
use crate::reconciler::{ReconcilerHandle, WriteFailure};
use crate::scheduler::Scheduler;

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Number of recent write failures kept for the dashboard.
const MAX_RECENT_FAILURES: usize = 50;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub reconciler: ReconcilerHandle,
    /// Narrows which notifications enter the reconciler.
    pub filter: Option<RowFilter>,
    pub push: Arc<PushService>,
    pub functions: Option<FunctionsClient>,
    pub failures: Arc<Mutex<VecDeque<WriteFailure>>>,
}

impl AppState {
    /// Record write failures as they are reported by the reconciler.
    pub fn collect_failures(&self, mut rx: mpsc::UnboundedReceiver<WriteFailure>) {
        let failures = self.failures.clone();
        tokio::spawn(async move {
            while let Some(failure) = rx.recv().await {
                tracing::error!(
                    "Notification {} could not be saved: {}",
                    failure.notification_id,
                    failure.reason
                );
                let mut recent = failures.lock().await;
                if recent.len() >= MAX_RECENT_FAILURES {
                    recent.pop_front();
                }
                recent.push_back(failure);
            }
        });
    }
}

/// Web server for opswatch.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = routes(self.state.clone());

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Build the router with all routes.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/status", get(handlers::handle_status))
        // Sites and uptime
        .route("/api/sites", get(handlers::handle_get_sites).post(handlers::handle_create_site))
        .route("/api/sites/{id}", delete(handlers::handle_delete_site))
        .route("/api/sites/{id}/pings", get(handlers::handle_get_pings))
        .route("/api/sites/{id}/incidents", get(handlers::handle_get_incidents))
        .route("/api/sites/{id}/summary", get(handlers::handle_get_summary))
        // Notifications
        .route(
            "/api/notifications",
            get(handlers::handle_get_notifications)
                .post(handlers::handle_create_notification)
                .delete(handlers::handle_clear_notifications),
        )
        .route("/api/notifications/failures", get(handlers::handle_get_failures))
        .route("/api/notifications/{id}", get(handlers::handle_get_notification))
        .route("/api/notifications/{id}/status", post(handlers::handle_update_status))
        .route("/api/notifications/{id}/comments", post(handlers::handle_add_comment))
        // Topics
        .route("/api/topics", get(handlers::handle_get_topics).post(handlers::handle_create_topic))
        .route(
            "/api/topics/{id}/subscriptions",
            post(handlers::handle_subscribe).delete(handlers::handle_unsubscribe),
        )
        .route("/api/topics/{id}/subscribers", get(handlers::handle_get_subscribers))
        // Inbound
        .route("/api/webhooks/{source}", post(handlers::handle_webhook))
        .route("/api/webhooks/{source}/events", get(handlers::handle_get_webhook_events))
        .route("/api/push/events", post(handlers::handle_push_event))
        .route("/api/alerts/test", post(handlers::handle_test_alert))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
        .with_state(state)
}
