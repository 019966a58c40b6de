use std::time::Duration;

use hopline_core::chain::{ChainRequest, ChainResponse};
use hopline_core::context::{TRACE_HEADER, TraceContext};
use hopline_core::error::{HoplineError, Result};
use reqwest::Client;
use serde_json::Value;

/// Forwards a request to the next hop. Exactly one attempt per call: the
/// downstream may have applied side effects even when the reply never
/// arrives, so nothing here retries.
#[derive(Clone)]
pub struct ChainDispatcher {
    client: Client,
}

impl ChainDispatcher {
    pub fn new() -> Self {
        // Per-attempt deadlines are passed at call time, so the client
        // itself carries no global timeout.
        let client = Client::builder().build().unwrap_or_else(|e| {
            tracing::warn!(error = ?e, "failed to build dispatch client; using defaults");
            Client::new()
        });
        Self { client }
    }

    pub async fn forward(
        &self,
        addr: &str,
        request: &ChainRequest,
        ctx: &TraceContext,
        timeout: Duration,
    ) -> Result<ChainResponse> {
        let url = format!("{}/process", normalize_endpoint(addr));
        let response = self
            .client
            .post(&url)
            .header(TRACE_HEADER, ctx.encode())
            .json(request)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify_send_error(addr, timeout, &e))?;

        let status = response.status();
        if !status.is_success() {
            let reason = match response.text().await {
                Ok(body) => extract_reason(&body),
                Err(_) => String::new(),
            };
            let reason = if reason.is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("downstream failure")
                    .to_string()
            } else {
                reason
            };
            return Err(HoplineError::Downstream {
                status: status.as_u16(),
                reason,
            });
        }

        response
            .json::<ChainResponse>()
            .await
            .map_err(|e| HoplineError::Downstream {
                status: status.as_u16(),
                reason: format!("unreadable response body: {e}"),
            })
    }
}

impl Default for ChainDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_send_error(addr: &str, timeout: Duration, err: &reqwest::Error) -> HoplineError {
    if err.is_timeout() {
        HoplineError::Timeout(format!(
            "deadline exceeded after {timeout:?} forwarding to {addr}"
        ))
    } else if err.is_connect() {
        HoplineError::Timeout(format!("connect to {addr} failed: {err}"))
    } else {
        HoplineError::Timeout(format!("forward to {addr} failed: {err}"))
    }
}

fn normalize_endpoint(addr: &str) -> String {
    let trimmed = addr.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Error bodies in the chain carry a `message` field; anything else is
/// surfaced raw and truncated.
fn extract_reason(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(message) = value.get("message").and_then(Value::as_str) {
            return message.to_string();
        }
    }
    body.chars().take(200).collect()
}
