use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Outcome of a synchronous liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTest {
    pub success: bool,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionTest {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            success: true,
            latency_ms,
            error: None,
        }
    }

    pub fn failed(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms,
            error: Some(error.into()),
        }
    }
}

/// Liveness check against an integration endpoint.
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    async fn probe(&self, endpoint: &str) -> ConnectionTest;
}

/// Probe that issues a GET and treats any non-5xx answer as alive.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    http: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("scan-engine/0.3")
            .timeout(timeout)
            .build()
            .context("failed to build probe HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ConnectionProbe for HttpProbe {
    async fn probe(&self, endpoint: &str) -> ConnectionTest {
        let started = Instant::now();
        let response = self.http.get(endpoint).send().await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match response {
            Ok(resp) if resp.status().is_server_error() => {
                warn!(%endpoint, status = %resp.status(), "probe returned server error");
                ConnectionTest::failed(latency_ms, format!("server error ({})", resp.status()))
            }
            Ok(resp) => {
                debug!(%endpoint, status = %resp.status(), latency_ms, "probe succeeded");
                ConnectionTest::ok(latency_ms)
            }
            Err(err) => {
                warn!(%endpoint, error = %err, "probe failed");
                let message = if err.is_timeout() {
                    "timed out".to_string()
                } else {
                    err.to_string()
                };
                ConnectionTest::failed(latency_ms, message)
            }
        }
    }
}
