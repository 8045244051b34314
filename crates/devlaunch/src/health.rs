use std::time::Duration;

use devlaunch_process::{HealthStatus, PortBinding};
use serde::Deserialize;

pub const HEALTH_PATH: &str = "/api/health";

#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(rename = "scanPath")]
    scan_path: Option<String>,
}

/// Why a health query did not produce a usable answer. Only ever logged.
#[derive(Debug, thiserror::Error)]
pub enum HealthProbeError {
    #[error("http client: {0}")]
    Client(reqwest::Error),
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed body: {0}")]
    Body(reqwest::Error),
}

pub fn health_url(binding: &PortBinding) -> String {
    format!("{}{HEALTH_PATH}", binding.url())
}

async fn fetch(binding: &PortBinding, timeout: Duration) -> Result<HealthBody, HealthProbeError> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .no_proxy()
        .build()
        .map_err(HealthProbeError::Client)?;
    let response = client
        .get(health_url(binding))
        .send()
        .await
        .map_err(HealthProbeError::Request)?;
    if !response.status().is_success() {
        return Err(HealthProbeError::Status(response.status()));
    }
    response.json::<HealthBody>().await.map_err(HealthProbeError::Body)
}

/// Asks the backend which directory it is scanning. Any failure reads as
/// unreachable.
pub async fn query(binding: &PortBinding, timeout: Duration) -> HealthStatus {
    match fetch(binding, timeout).await {
        Ok(body) => HealthStatus::serving(body.scan_path),
        Err(e) => {
            tracing::debug!(url = %health_url(binding), error = %e, "health probe failed");
            HealthStatus::unreachable()
        }
    }
}
