//! Configuration module for opswatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::realtime::RowFilter;

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "opswatch.db")
    pub db_path: String,
    /// Debounce before an edited notification is written back (default: 500ms)
    pub write_debounce_ms: u64,
    /// Re-subscribe attempts after a realtime timeout (default: 3)
    pub realtime_retry_attempts: u32,
    /// Delay between re-subscribe attempts (default: 2000ms)
    pub realtime_retry_delay_ms: u64,
    /// Ping logs fetched per site for incidents and summaries (default: 100)
    pub ping_page_size: u32,
    /// Notifications loaded into the reconciler at startup (default: 200)
    pub notification_page_size: u32,
    /// Seconds between probes of one site (default: 60)
    pub probe_interval_secs: u64,
    /// Probe timeout in seconds (default: 10)
    pub probe_timeout_secs: u64,
    /// Age after which ping logs are deleted (default: 30 days)
    pub ping_retention_days: i64,
    /// Base URL of the serverless functions
    pub functions_url: Option<String>,
    pub functions_key: Option<String>,
    /// Push provider application id and REST key
    pub push_app_id: Option<String>,
    pub push_api_key: Option<String>,
    pub push_api_url: String,
    /// Only track notifications matching `column=eq.value`, e.g. `topic_id=eq.outages`
    pub notification_filter: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "opswatch.db".to_string(),
            write_debounce_ms: 500,
            realtime_retry_attempts: 3,
            realtime_retry_delay_ms: 2000,
            ping_page_size: 100,
            notification_page_size: 200,
            probe_interval_secs: 60,
            probe_timeout_secs: 10,
            ping_retention_days: 30,
            functions_url: None,
            functions_key: None,
            push_app_id: None,
            push_api_key: None,
            push_api_url: "https://onesignal.com/api/v1".to_string(),
            notification_filter: None,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = env::var(name) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring invalid value for {}: {:?}", name, raw),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Every field has an `OPSWATCH_` variable named after it, e.g.
    /// `OPSWATCH_HTTP_PORT`, `OPSWATCH_DB_PATH`, `OPSWATCH_WRITE_DEBOUNCE_MS`.
    /// Unparseable values keep the default.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        parse_var("OPSWATCH_HTTP_PORT", &mut cfg.http_port);
        if let Some(db_path) = optional_var("OPSWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        parse_var("OPSWATCH_WRITE_DEBOUNCE_MS", &mut cfg.write_debounce_ms);
        parse_var("OPSWATCH_REALTIME_RETRY_ATTEMPTS", &mut cfg.realtime_retry_attempts);
        parse_var("OPSWATCH_REALTIME_RETRY_DELAY_MS", &mut cfg.realtime_retry_delay_ms);
        parse_var("OPSWATCH_PING_PAGE_SIZE", &mut cfg.ping_page_size);
        parse_var("OPSWATCH_NOTIFICATION_PAGE_SIZE", &mut cfg.notification_page_size);
        parse_var("OPSWATCH_PROBE_INTERVAL_SECS", &mut cfg.probe_interval_secs);
        parse_var("OPSWATCH_PROBE_TIMEOUT_SECS", &mut cfg.probe_timeout_secs);
        parse_var("OPSWATCH_PING_RETENTION_DAYS", &mut cfg.ping_retention_days);

        cfg.functions_url = optional_var("OPSWATCH_FUNCTIONS_URL");
        cfg.functions_key = optional_var("OPSWATCH_FUNCTIONS_KEY");
        cfg.push_app_id = optional_var("OPSWATCH_PUSH_APP_ID");
        cfg.push_api_key = optional_var("OPSWATCH_PUSH_API_KEY");
        if let Some(url) = optional_var("OPSWATCH_PUSH_API_URL") {
            cfg.push_api_url = url;
        }
        cfg.notification_filter = optional_var("OPSWATCH_NOTIFICATION_FILTER");

        cfg
    }

    pub fn write_debounce(&self) -> Duration {
        Duration::from_millis(self.write_debounce_ms)
    }

    pub fn realtime_retry_delay(&self) -> Duration {
        Duration::from_millis(self.realtime_retry_delay_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }

    /// The parsed notification filter. An unparseable filter is ignored.
    pub fn notification_filter(&self) -> Option<RowFilter> {
        let raw = self.notification_filter.as_deref()?;
        let filter = RowFilter::parse(raw);
        if filter.is_none() {
            tracing::warn!("Ignoring invalid notification filter: {:?}", raw);
        }
        filter
    }
}
