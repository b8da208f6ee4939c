//! HTTP probe implementation.

use std::time::{Duration, Instant};

use super::{PingOutcome, ProbeError};

/// Normalize a site address into a URL.
pub fn site_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("https://{}", address)
    }
}

/// Build the client shared by all probes.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, ProbeError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("opswatch/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| ProbeError::Config(e.to_string()))
}

/// Run an HTTP probe against the given address.
///
/// Any response below 400 counts as up. Transport failures and timeouts are
/// reported as a down outcome rather than an error.
pub async fn run_http_probe(
    client: &reqwest::Client,
    address: &str,
    timeout: Duration,
) -> Result<PingOutcome, ProbeError> {
    let url = site_url(address);
    let start = Instant::now();

    let response = match client.get(&url).timeout(timeout).send().await {
        Ok(r) => r,
        Err(e) if e.is_timeout() => {
            return Ok(PingOutcome::down(None, format!("Timed out after {:?}", timeout)));
        }
        Err(e) if e.is_builder() => return Err(ProbeError::Config(e.to_string())),
        Err(e) => {
            let text = if e.is_connect() {
                "Connection failed".to_string()
            } else {
                e.to_string()
            };
            return Ok(PingOutcome::down(None, text));
        }
    };

    let status = response.status();
    // Read the full body to measure complete transfer time
    let _ = response.bytes().await;
    let elapsed_ms = start.elapsed().as_millis() as i64;

    let text = status
        .canonical_reason()
        .map(str::to_string)
        .unwrap_or_else(|| status.as_str().to_string());

    Ok(PingOutcome {
        is_up: status.as_u16() < 400,
        response_time_ms: Some(elapsed_ms),
        status_code: Some(status.as_u16() as i32),
        status_text: text,
    })
}
