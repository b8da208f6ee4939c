//! Client for the hosted serverless functions.
//!
//! Functions are opaque JSON-over-POST endpoints at `{base_url}/{name}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

pub const SEND_TEST_ALERT: &str = "send-test-alert";
pub const GET_TOPIC_SUBSCRIBERS: &str = "get-topic-subscribers";

#[derive(Error, Debug)]
pub enum FunctionsError {
    #[error("serverless functions are not configured")]
    NotConfigured,
    #[error("function request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("function {name} failed ({status}): {body}")]
    Failed {
        name: String,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestAlertRequest {
    pub topic_id: String,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct FunctionsClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl FunctionsClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, FunctionsError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Invoke a function with a JSON body and return its JSON response.
    pub async fn invoke(&self, name: &str, body: &Value) -> Result<Value, FunctionsError> {
        let url = format!("{}/{}", self.base_url, name);
        let mut request = self.http.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Function {} returned {}: {}", name, status, body);
            return Err(FunctionsError::Failed {
                name: name.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }

    pub async fn send_test_alert(&self, req: &TestAlertRequest) -> Result<Value, FunctionsError> {
        self.invoke(SEND_TEST_ALERT, &json!(req)).await
    }

    pub async fn get_topic_subscribers(&self, topic_id: &str) -> Result<Value, FunctionsError> {
        self.invoke(GET_TOPIC_SUBSCRIBERS, &json!({ "topic_id": topic_id }))
            .await
    }
}
