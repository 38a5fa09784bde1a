//! Engine command transport
//!
//! A transport carries one named command with JSON arguments to the engine
//! and hands back the raw JSON reply, or `None` when the engine sent no
//! body at all. Typing and validation happen in the gateway; the transport
//! only classifies failures.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Transport-level failure classification
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connection failure, timeout or engine-side outage
    #[error("{0}")]
    Unavailable(String),
    /// Structured error returned by the engine
    #[error("{0}")]
    Rejected(String),
    /// Reply was not valid JSON
    #[error("{0}")]
    Malformed(String),
}

/// Raw engine reply; `None` is an empty body, distinct from JSON `null`
pub type Reply = Option<Value>;

/// One-shot remote command invocation
#[async_trait]
pub trait CommandTransport: Send + Sync {
    async fn invoke(&self, command: &str, args: Value) -> Result<Reply, TransportError>;
}

/// HTTP transport for the engine's command endpoint
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpTransport {
    /// Create new HTTP transport
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn command_url(&self, command: &str) -> String {
        format!("{}/api/v1/commands/{}", self.base_url, command)
    }
}

#[async_trait]
impl CommandTransport for HttpTransport {
    async fn invoke(&self, command: &str, args: Value) -> Result<Reply, TransportError> {
        let url = self.command_url(command);
        debug!("Invoking {} at {}", command, url);

        let mut request = self.client.post(&url).json(&args);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(describe_send_error(&e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Unavailable(format!("failed to read reply: {}", e)))?;

        classify_reply(status, &body)
    }
}

#[derive(Debug, Deserialize)]
struct EngineErrorBody {
    error: String,
}

/// Map an HTTP reply onto the transport taxonomy
fn classify_reply(status: StatusCode, body: &str) -> Result<Reply, TransportError> {
    if let Ok(engine_error) = serde_json::from_str::<EngineErrorBody>(body) {
        if !status.is_success() {
            return Err(TransportError::Rejected(engine_error.error));
        }
    }

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(None);
        }
        return serde_json::from_str(body)
            .map(Some)
            .map_err(|e| TransportError::Malformed(format!("invalid JSON reply: {}", e)));
    }

    let text = body.trim();
    let detail = if text.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), text)
    };

    if status.is_server_error() {
        Err(TransportError::Unavailable(detail))
    } else {
        Err(TransportError::Rejected(detail))
    }
}

fn describe_send_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "request timed out".to_string()
    } else if e.is_connect() {
        format!("connection failed: {}", e)
    } else {
        e.to_string()
    }
}
