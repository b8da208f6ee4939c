//! Incident derivation from a site's ping log.

use crate::db::PingLog;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Reason used when a failing ping carries no status text.
pub const DEFAULT_REASON: &str = "Service Unavailable";

/// A contiguous span of downtime. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub reason: String,
    pub started_at: DateTime<Utc>,
    /// First up-ping after the span; `None` while the incident is open.
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: i64,
    pub duration_human: String,
    pub is_resolved: bool,
}

struct OpenIncident {
    started_at: DateTime<Utc>,
    reason: String,
}

impl OpenIncident {
    fn close(self, at: DateTime<Utc>, resolved: bool) -> Incident {
        let duration = at - self.started_at;
        Incident {
            reason: self.reason,
            started_at: self.started_at,
            ended_at: resolved.then_some(at),
            duration_secs: duration.num_seconds().max(0),
            duration_human: format_duration(duration),
            is_resolved: resolved,
        }
    }
}

/// Derive incidents from pings ordered newest first.
///
/// The open incident, if any, is measured against the current time.
pub fn derive_incidents(pings: &[PingLog]) -> Vec<Incident> {
    derive_incidents_at(pings, Utc::now())
}

/// Derive incidents from pings ordered newest first, measuring an open
/// incident against `now`. The result is newest first as well.
pub fn derive_incidents_at(pings: &[PingLog], now: DateTime<Utc>) -> Vec<Incident> {
    let mut incidents = Vec::new();
    let mut open: Option<OpenIncident> = None;

    for ping in pings.iter().rev() {
        match (ping.is_up, open.take()) {
            (false, None) => {
                open = Some(OpenIncident {
                    started_at: ping.checked_at,
                    reason: reason_for(ping),
                });
            }
            (false, still_open) => open = still_open,
            (true, Some(current)) => incidents.push(current.close(ping.checked_at, true)),
            (true, None) => {}
        }
    }

    if let Some(current) = open {
        incidents.push(current.close(now, false));
    }

    incidents.reverse();
    incidents
}

fn reason_for(ping: &PingLog) -> String {
    let text = ping.status_text.trim();
    if text.is_empty() {
        DEFAULT_REASON.to_string()
    } else {
        text.to_string()
    }
}

/// Format a span as `"{h}h {m}m"` from one hour up, else `"{m}m {s}s"`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.num_seconds().max(0);
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours >= 1 {
        format!("{}h {}m", hours, minutes)
    } else {
        format!("{}m {}s", minutes, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn ping(is_up: bool, offset_secs: i64, text: &str) -> PingLog {
        PingLog {
            id: offset_secs,
            site_id: 1,
            is_up,
            response_time_ms: is_up.then_some(120),
            status_code: Some(if is_up { 200 } else { 503 }),
            status_text: text.to_string(),
            checked_at: t0() + Duration::seconds(offset_secs),
        }
    }

    /// Build a newest-first log from a chronological description.
    fn newest_first(mut chronological: Vec<PingLog>) -> Vec<PingLog> {
        chronological.reverse();
        chronological
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::minutes(90)), "1h 30m");
        assert_eq!(format_duration(Duration::seconds(45)), "0m 45s");
        assert_eq!(format_duration(Duration::minutes(5)), "5m 0s");
        assert_eq!(format_duration(Duration::seconds(3599)), "59m 59s");
        assert_eq!(format_duration(Duration::hours(26) + Duration::seconds(59)), "26h 0m");
        assert_eq!(format_duration(Duration::seconds(-10)), "0m 0s");
    }

    #[test]
    fn test_two_closed_incidents() {
        let pings = newest_first(vec![
            ping(false, 0, "timeout"),
            ping(true, 300, "OK"),
            ping(false, 600, "500"),
            ping(true, 630, "OK"),
        ]);

        let incidents = derive_incidents_at(&pings, t0() + Duration::hours(1));
        assert_eq!(incidents.len(), 2);

        // Newest first.
        assert_eq!(incidents[0].reason, "500");
        assert_eq!(incidents[0].duration_human, "0m 30s");
        assert!(incidents[0].is_resolved);
        assert_eq!(incidents[0].ended_at, Some(t0() + Duration::seconds(630)));

        assert_eq!(incidents[1].reason, "timeout");
        assert_eq!(incidents[1].duration_human, "5m 0s");
        assert_eq!(incidents[1].duration_secs, 300);
        assert!(incidents[1].is_resolved);
        assert_eq!(incidents[1].started_at, t0());
    }

    #[test]
    fn test_empty_and_all_up() {
        assert!(derive_incidents_at(&[], t0()).is_empty());

        let pings = newest_first((0..10).map(|i| ping(true, i * 60, "OK")).collect());
        assert!(derive_incidents_at(&pings, t0()).is_empty());
    }

    #[test]
    fn test_all_down_yields_single_open_incident() {
        let pings = newest_first((0..10).map(|i| ping(false, i * 60, "refused")).collect());
        let now = t0() + Duration::minutes(90);

        let incidents = derive_incidents_at(&pings, now);
        assert_eq!(incidents.len(), 1);
        assert!(!incidents[0].is_resolved);
        assert_eq!(incidents[0].ended_at, None);
        assert_eq!(incidents[0].started_at, t0());
        assert_eq!(incidents[0].duration_human, "1h 30m");
    }

    #[test]
    fn test_single_down_ping_measured_against_now() {
        let pings = vec![ping(false, 0, "")];

        let first = derive_incidents_at(&pings, t0() + Duration::seconds(10));
        let later = derive_incidents_at(&pings, t0() + Duration::seconds(70));

        assert_eq!(first[0].reason, DEFAULT_REASON);
        assert_eq!(first[0].duration_human, "0m 10s");
        assert_eq!(later[0].duration_human, "1m 10s");
    }

    #[test]
    fn test_alternation_counts_down_runs() {
        // up up down down up down up up down
        let pattern = [true, true, false, false, true, false, true, true, false];
        let pings = newest_first(
            pattern
                .iter()
                .enumerate()
                .map(|(i, up)| ping(*up, i as i64 * 60, "bad gateway"))
                .collect(),
        );

        let incidents = derive_incidents_at(&pings, t0() + Duration::hours(1));
        assert_eq!(incidents.len(), 3);
        assert!(!incidents[0].is_resolved);
        assert!(incidents[1..].iter().all(|i| i.is_resolved));
        assert_eq!(incidents.iter().filter(|i| !i.is_resolved).count(), 1);

        // Chronologically ordered and non-overlapping.
        for pair in incidents.windows(2) {
            let newer = &pair[0];
            let older = &pair[1];
            assert!(older.ended_at.unwrap() <= newer.started_at);
        }
    }

    #[test]
    fn test_trailing_up_closes_everything() {
        let pings = newest_first(vec![
            ping(false, 0, "dns"),
            ping(false, 60, "dns"),
            ping(true, 120, "OK"),
        ]);
        let incidents = derive_incidents_at(&pings, t0() + Duration::hours(5));
        assert_eq!(incidents.len(), 1);
        assert!(incidents[0].is_resolved);
        assert_eq!(incidents[0].duration_human, "2m 0s");
    }

    #[test]
    fn test_closed_incidents_are_stable_across_calls() {
        let pings = newest_first(vec![
            ping(false, 0, "timeout"),
            ping(true, 60, "OK"),
            ping(false, 120, "timeout"),
        ]);

        let a = derive_incidents_at(&pings, t0() + Duration::minutes(5));
        let b = derive_incidents_at(&pings, t0() + Duration::minutes(9));

        assert_eq!(a[1], b[1]);
        assert_ne!(a[0].duration_human, b[0].duration_human);
    }
}
