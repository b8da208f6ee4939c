//! opswatch - multi-tenant operations dashboard service
//!
//! Probes monitored sites, derives incidents from their ping logs, and keeps
//! a live notification list that users can acknowledge and comment on.

mod config;
mod db;
mod functions;
mod probe;
mod push;
mod realtime;
mod reconciler;
mod scheduler;
mod uptime;
mod web;

use config::ServerConfig;
use db::Store;
use functions::FunctionsClient;
use push::{PushConfig, PushService};
use realtime::RetryPolicy;
use reconciler::ReconcilerSettings;
use scheduler::{ProbeSettings, Scheduler};
use web::{AppState, Server};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("opswatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting opswatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Start scheduler
    let probe_settings = ProbeSettings {
        interval: cfg.probe_interval(),
        timeout: cfg.probe_timeout(),
    };
    let retention = chrono::Duration::days(cfg.ping_retention_days.max(1));
    let scheduler = Arc::new(Scheduler::new(store.clone(), probe_settings, retention)?);
    scheduler.start().await?;

    // Load the notification page and start reconciling against the feed
    let filter = cfg.notification_filter();
    let mut initial = store.list_notifications(cfg.notification_page_size)?;
    if let Some(filter) = &filter {
        initial.retain(|n| reconciler::admits(Some(filter), n));
        tracing::info!("Tracking notifications matching {:?}", filter);
    }

    let settings = ReconcilerSettings {
        debounce: cfg.write_debounce(),
        max_items: (cfg.notification_page_size as usize).max(1),
        ..Default::default()
    };
    let (handle, failures) = reconciler::spawn(store.clone(), initial, settings);
    let retry = RetryPolicy {
        attempts: cfg.realtime_retry_attempts,
        delay: cfg.realtime_retry_delay(),
    };
    tokio::spawn(reconciler::pump_changes(
        store.feed().clone(),
        handle.clone(),
        filter.clone(),
        retry,
    ));

    // Outbound integrations
    let push_config = match (&cfg.push_app_id, &cfg.push_api_key) {
        (Some(app_id), Some(api_key)) => Some(PushConfig {
            app_id: app_id.clone(),
            api_key: api_key.clone(),
            api_url: cfg.push_api_url.clone(),
        }),
        _ => {
            tracing::info!("Push delivery disabled: OPSWATCH_PUSH_APP_ID or OPSWATCH_PUSH_API_KEY not set");
            None
        }
    };
    let functions = match &cfg.functions_url {
        Some(url) => Some(FunctionsClient::new(url, cfg.functions_key.clone())?),
        None => None,
    };

    let state = AppState {
        config: cfg,
        store,
        scheduler: scheduler.clone(),
        reconciler: handle.clone(),
        filter,
        push: Arc::new(PushService::new(push_config)),
        functions,
        failures: Default::default(),
    };
    state.collect_failures(failures);

    // Start web server
    let server = Server::new(state);
    server.start().await?;

    handle.shutdown().await;
    scheduler.stop().await;

    Ok(())
}
