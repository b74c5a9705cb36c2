// src/motion/host.rs - Command transport to the G-code speaking motion host
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::config::MotionHostConfig;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Host rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("Malformed host response: {0}")]
    Malformed(String),
    #[error("Host unavailable: {0}")]
    Unavailable(String),
}

/// A remote controller that executes motion commands.
///
/// Every call is a blocking round trip from the caller's point of view: it
/// resolves only once the host has acknowledged (or refused) the command.
#[async_trait]
pub trait MotionHost: Send + Sync {
    /// Cheap reachability probe.
    async fn check_connection(&self) -> Result<(), HostError>;
    /// Submits one or more newline separated G-code lines.
    async fn run_gcode(&self, script: &str, timeout: Duration) -> Result<(), HostError>;
    /// Full shutdown of the motion system. Recovery needs a host restart.
    async fn emergency_stop(&self) -> Result<(), HostError>;
    /// Toolhead position as reported by the host, `[x, y, z, e]`.
    async fn query_position(&self) -> Result<[f64; 4], HostError>;
}

/// Moonraker HTTP API in front of a Klipper motion controller.
#[derive(Debug, Clone)]
pub struct MoonrakerHost {
    client: reqwest::Client,
    base_url: String,
    connect_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    status: QueryStatus,
}

#[derive(Debug, Deserialize)]
struct QueryStatus {
    toolhead: ToolheadStatus,
}

#[derive(Debug, Deserialize)]
struct ToolheadStatus {
    position: Vec<f64>,
}

impl MoonrakerHost {
    pub fn new(config: &MotionHostConfig) -> Result<Self, HostError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            connect_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, HostError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(HostError::Rejected { status: status.as_u16(), body })
        }
    }
}

#[async_trait]
impl MotionHost for MoonrakerHost {
    async fn check_connection(&self) -> Result<(), HostError> {
        let response = self
            .client
            .get(self.url("/printer/info"))
            .timeout(self.connect_timeout)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn run_gcode(&self, script: &str, timeout: Duration) -> Result<(), HostError> {
        tracing::debug!("Host <- {} (timeout={}s)", script.replace('\n', " | "), timeout.as_secs());
        let response = self
            .client
            .post(self.url("/printer/gcode/script"))
            .json(&serde_json::json!({ "script": script }))
            .timeout(timeout)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), HostError> {
        let response = self
            .client
            .post(self.url("/printer/emergency_stop"))
            .timeout(self.connect_timeout)
            .send()
            .await?;
        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn query_position(&self) -> Result<[f64; 4], HostError> {
        let response = self
            .client
            .get(self.url("/printer/objects/query"))
            .query(&[("toolhead", "position")])
            .timeout(self.connect_timeout)
            .send()
            .await?;
        let body: QueryResponse = Self::ensure_success(response).await?.json().await?;
        let position = body.result.status.toolhead.position;
        if position.len() < 4 {
            return Err(HostError::Malformed(format!(
                "toolhead position has {} components",
                position.len()
            )));
        }
        Ok([position[0], position[1], position[2], position[3]])
    }
}

/// Stand-in host for bench runs without a motion controller attached.
#[derive(Debug, Clone, Default)]
pub struct SimulatedHost;

#[async_trait]
impl MotionHost for SimulatedHost {
    async fn check_connection(&self) -> Result<(), HostError> {
        Ok(())
    }

    async fn run_gcode(&self, script: &str, _timeout: Duration) -> Result<(), HostError> {
        tracing::info!("[sim] Host <- {}", script.replace('\n', " | "));
        Ok(())
    }

    async fn emergency_stop(&self) -> Result<(), HostError> {
        tracing::warn!("[sim] Emergency stop");
        Ok(())
    }

    async fn query_position(&self) -> Result<[f64; 4], HostError> {
        Ok([0.0; 4])
    }
}
