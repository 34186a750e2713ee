//! HTTP client for the two llama-server endpoints the crate consumes:
//! `GET /health` and `POST /completion`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
}

/// Throughput figures reported by the server alongside each completion.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Timings {
    pub prompt_per_second: f64,
    pub predicted_per_second: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionResponse {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub timings: Option<Timings>,
}

impl CompletionResponse {
    /// The timings record, or a protocol error when the server omitted it.
    pub fn timings(&self) -> Result<Timings> {
        self.timings
            .ok_or_else(|| Error::Protocol("completion response missing timings".to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

/// Client bound to one server's base URL.
#[derive(Debug, Clone)]
pub struct CompletionClient {
    http: reqwest::Client,
    base_url: String,
}

impl CompletionClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`; Ok(true) when the server answers 200 with
    /// `{"status":"ok"}`.
    pub async fn health(&self) -> Result<bool> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Ok(false);
        }
        let health: HealthResponse = resp.json().await?;
        Ok(health.status == "ok")
    }

    /// `POST /completion` bounded by `timeout`. Timeouts are reported as
    /// [`Error::Timeout`] so callers can tell them apart from transport
    /// failures.
    pub async fn completion(
        &self,
        prompt: &str,
        n_predict: u32,
        timeout: Duration,
    ) -> Result<CompletionResponse> {
        let request = CompletionRequest { prompt, n_predict };
        let send = self
            .http
            .post(format!("{}/completion", self.base_url))
            .json(&request)
            .send();
        let resp = match tokio::time::timeout(timeout, send).await {
            Ok(resp) => resp?,
            Err(_) => return Err(Error::Timeout(timeout)),
        };
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Protocol(format!(
                "completion returned HTTP {status}"
            )));
        }
        let remaining = timeout; // body read shares the request bound
        match tokio::time::timeout(remaining, resp.json::<CompletionResponse>()).await {
            Ok(body) => Ok(body?),
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_request_wire_shape() {
        let req = CompletionRequest {
            prompt: "hello",
            n_predict: 20,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, serde_json::json!({"prompt": "hello", "n_predict": 20}));
    }

    #[test]
    fn missing_timings_is_a_protocol_error() {
        let resp: CompletionResponse = serde_json::from_str(r#"{"content":"hi"}"#).unwrap();
        assert!(matches!(resp.timings(), Err(Error::Protocol(_))));

        let resp: CompletionResponse = serde_json::from_str(
            r#"{"content":"hi","timings":{"prompt_per_second":120.5,"predicted_per_second":48.0,"predicted_ms":10.0}}"#,
        )
        .unwrap();
        let timings = resp.timings().unwrap();
        assert_eq!(timings.prompt_per_second, 120.5);
        assert_eq!(timings.predicted_per_second, 48.0);
    }
}
