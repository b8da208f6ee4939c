//! Per-site uptime summary over a page of ping logs.

use super::incidents::{derive_incidents_at, Incident};
use crate::db::PingLog;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UptimeSummary {
    pub total_checks: usize,
    pub up_checks: usize,
    pub uptime_percent: f64,
    /// Mean response time of successful checks.
    pub avg_response_ms: Option<f64>,
    /// State of the newest check.
    pub is_up: Option<bool>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub incident_count: usize,
    pub open_incident: Option<Incident>,
}

/// Summarize pings ordered newest first.
pub fn summarize(pings: &[PingLog], now: DateTime<Utc>) -> UptimeSummary {
    let total_checks = pings.len();
    let up_checks = pings.iter().filter(|p| p.is_up).count();

    let uptime_percent = if total_checks == 0 {
        100.0
    } else {
        round2(up_checks as f64 * 100.0 / total_checks as f64)
    };

    let response_times: Vec<i64> = pings
        .iter()
        .filter(|p| p.is_up)
        .filter_map(|p| p.response_time_ms)
        .collect();
    let avg_response_ms = if response_times.is_empty() {
        None
    } else {
        Some(round2(
            response_times.iter().sum::<i64>() as f64 / response_times.len() as f64,
        ))
    };

    let incidents = derive_incidents_at(pings, now);
    let open_incident = incidents.iter().find(|i| !i.is_resolved).cloned();

    UptimeSummary {
        total_checks,
        up_checks,
        uptime_percent,
        avg_response_ms,
        is_up: pings.first().map(|p| p.is_up),
        last_checked_at: pings.first().map(|p| p.checked_at),
        incident_count: incidents.len(),
        open_incident,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
