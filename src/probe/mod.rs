//! Probe module for site uptime checks.

mod http;

pub use http::*;

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

use crate::db::PingLog;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result of probing a site once.
#[derive(Debug, Clone, PartialEq)]
pub struct PingOutcome {
    pub is_up: bool,
    pub response_time_ms: Option<i64>,
    pub status_code: Option<i32>,
    pub status_text: String,
}

impl PingOutcome {
    pub fn down(status_code: Option<i32>, status_text: impl Into<String>) -> Self {
        Self {
            is_up: false,
            response_time_ms: None,
            status_code,
            status_text: status_text.into(),
        }
    }

    pub fn into_ping_log(self, site_id: i64, checked_at: DateTime<Utc>) -> PingLog {
        PingLog {
            id: 0,
            site_id,
            is_up: self.is_up,
            response_time_ms: self.response_time_ms,
            status_code: self.status_code,
            status_text: self.status_text,
            checked_at,
        }
    }
}

/// Probe a site with a small random delay to avoid bursts.
pub async fn probe_site(
    client: &reqwest::Client,
    address: &str,
    timeout: Duration,
) -> Result<PingOutcome, ProbeError> {
    // Add jitter to avoid thundering herd
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    run_http_probe(client, address, timeout).await
}
