use std::path::Path;

use anyhow::Context;
use devlaunch_process::{PassId, ServiceStatus};
use serde::{Deserialize, Serialize};

/// What the last successful pass left running, kept in `.devlaunch/run.json`
/// so `--close` can find processes that never bound their port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub pass_id: PassId,
    pub started_at_unix_ms: u64,
    pub launcher_version: String,
    pub scan_path: String,
    pub services: Vec<ServiceStatus>,
}

impl RunRecord {
    pub fn new(pass_id: PassId, scan_path: String, services: Vec<ServiceStatus>) -> Self {
        let started_at_unix_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            pass_id,
            started_at_unix_ms,
            launcher_version: env!("CARGO_PKG_VERSION").to_string(),
            scan_path,
            services,
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.services.iter().filter_map(|s| s.pid).collect()
    }
}

pub async fn write(path: &Path, record: &RunRecord) -> anyhow::Result<()> {
    let dir = path.parent().context("run record path has no parent")?;
    tokio::fs::create_dir_all(dir)
        .await
        .context("create state dir")?;
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(record).context("serialize run.json")?;
    tokio::fs::write(&tmp, &data)
        .await
        .context("write run.json.tmp")?;
    tokio::fs::rename(&tmp, path)
        .await
        .context("persist run.json")?;
    Ok(())
}

/// `None` when there is no record or it cannot be parsed.
pub async fn read(path: &Path) -> Option<RunRecord> {
    let data = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&data) {
        Ok(r) => Some(r),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable run record");
            None
        }
    }
}

pub async fn remove(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "could not remove run record");
    }
}
