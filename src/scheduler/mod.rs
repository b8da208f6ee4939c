//! Scheduler module for probing sites and storing ping logs.

mod retention;

pub use retention::*;

use crate::db::{MonitoredSite, PingLog, Store};
use crate::probe::{build_client, probe_site};

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Probe timing shared by all sites.
#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

/// The prober that runs one probe loop per active site.
pub struct Scheduler {
    store: Arc<Store>,
    settings: ProbeSettings,
    client: reqwest::Client,
    stop_chans: Arc<RwLock<HashMap<i64, broadcast::Sender<()>>>>,
    ping_tx: mpsc::Sender<PingLog>,
    retention_manager: Arc<RetentionManager>,
}

impl Scheduler {
    /// Create a new scheduler with the given store.
    pub fn new(
        store: Arc<Store>,
        settings: ProbeSettings,
        retention: chrono::Duration,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let (tx, rx) = mpsc::channel(1000);
        let client = build_client(settings.timeout)?;
        let retention_manager = Arc::new(RetentionManager::new(store.clone(), retention));

        // Start batch writer in a separate task
        tokio::spawn(run_batch_writer(rx, store.clone()));

        Ok(Self {
            store,
            settings,
            client,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
            ping_tx: tx,
            retention_manager,
        })
    }

    /// Start probing all active sites.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let sites = self.store.get_active_sites()?;

        tracing::info!("Starting scheduler with {} sites", sites.len());

        for site in sites {
            self.add_site(site).await;
        }

        self.retention_manager.start();

        Ok(())
    }

    /// Add a site to be probed.
    pub async fn add_site(&self, site: MonitoredSite) {
        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(&site.id) {
            return; // Already running
        }

        let (stop_tx, _) = broadcast::channel(1);
        stop_chans.insert(site.id, stop_tx.clone());
        drop(stop_chans);

        tracing::info!("Scheduler: Adding site {}", site.name);

        let ping_tx = self.ping_tx.clone();
        let site_id = site.id;
        let stop_chans = self.stop_chans.clone();
        let client = self.client.clone();
        let settings = self.settings;

        tokio::spawn(async move {
            run_probe_loop(site, client, settings, ping_tx, stop_tx.subscribe()).await;

            // Clean up when done
            let mut chans = stop_chans.write().await;
            chans.remove(&site_id);
        });
    }

    /// Stop probing a site.
    pub async fn remove_site(&self, id: i64) {
        let mut stop_chans = self.stop_chans.write().await;

        if let Some(stop_tx) = stop_chans.remove(&id) {
            let _ = stop_tx.send(());
            tracing::info!("Scheduler: Removed site {}", id);
        }
    }

    /// Stop every probe loop and the retention task.
    pub async fn stop(&self) {
        let mut stop_chans = self.stop_chans.write().await;
        for (_, stop_tx) in stop_chans.drain() {
            let _ = stop_tx.send(());
        }
        drop(stop_chans);
        self.retention_manager.stop().await;
        tracing::info!("Scheduler: stopped");
    }

    pub async fn site_count(&self) -> usize {
        self.stop_chans.read().await.len()
    }
}

/// Run the probe loop for a single site.
async fn run_probe_loop(
    site: MonitoredSite,
    client: reqwest::Client,
    settings: ProbeSettings,
    tx: mpsc::Sender<PingLog>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    // At most one probe in flight per site
    let semaphore = Arc::new(tokio::sync::Semaphore::new(1));

    let mut interval = tokio::time::interval(settings.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Skipping probe for {}: previous probe still running", site.name);
                        continue;
                    }
                };

                let client = client.clone();
                let tx = tx.clone();
                let site_id = site.id;
                let site_name = site.name.clone();
                let url = site.url.clone();

                tokio::spawn(async move {
                    let _permit = permit; // Hold permit until done

                    let checked_at = Utc::now();
                    let outcome = match probe_site(&client, &url, settings.timeout).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!("Probe failed for {}: {}", site_name, e);
                            return;
                        }
                    };

                    if !outcome.is_up {
                        tracing::warn!("Site {} is down: {}", site_name, outcome.status_text);
                    }

                    if tx.send(outcome.into_ping_log(site_id, checked_at)).await.is_err() {
                        tracing::error!("Failed to send ping log for {}", site_name);
                    }
                });
            }
        }
    }
}

/// Run the batch writer that accumulates and flushes ping logs.
async fn run_batch_writer(mut rx: mpsc::Receiver<PingLog>, store: Arc<Store>) {
    let mut buffer: Vec<PingLog> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(p) => {
                        buffer.push(p);
                        if buffer.len() >= 500 {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<PingLog>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_ping_logs(buffer) {
        tracing::error!("Failed to flush ping logs: {}", e);
    }

    buffer.clear();
}
