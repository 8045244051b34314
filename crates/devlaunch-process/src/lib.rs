use std::fmt;

/// Identifies one reconciliation pass in logs and the run record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PassId(pub String);

impl PassId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for PassId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The two halves of the managed pair. Backend always starts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Backend,
    Frontend,
}

impl ServiceKind {
    pub const LAUNCH_ORDER: [ServiceKind; 2] = [ServiceKind::Backend, ServiceKind::Frontend];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Backend => "backend",
            ServiceKind::Frontend => "frontend",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKind::Backend => f.write_str("Backend"),
            ServiceKind::Frontend => f.write_str("Frontend"),
        }
    }
}

pub const LOCALHOST: &str = "localhost";

/// A listening endpoint on the local machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PortBinding {
    pub host: String,
    pub port: u16,
}

impl PortBinding {
    pub fn localhost(port: u16) -> Self {
        Self {
            host: LOCALHOST.to_string(),
            port,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Started by this pass and still owned by it.
    Running,
    /// Handed off; outlives the launcher.
    Detached,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServiceStatus {
    pub kind: ServiceKind,
    pub state: ServiceState,
    pub binding: PortBinding,
    pub pid: Option<u32>,
    /// Process start time in seconds since the epoch, as the OS reports it.
    /// Together with the program name it tells a recorded pid apart from a
    /// later process that reused the number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceStatus {
    /// Executable file name from the recorded command line.
    pub fn program(&self) -> &str {
        let first = self.command.split_whitespace().next().unwrap_or_default();
        first.rsplit(['/', '\\']).next().unwrap_or(first)
    }
}

/// Result of asking a backend which directory it serves. Never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthStatus {
    pub reachable: bool,
    pub scan_path: Option<String>,
}

impl HealthStatus {
    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn serving(scan_path: Option<String>) -> Self {
        Self {
            reachable: true,
            scan_path,
        }
    }
}
