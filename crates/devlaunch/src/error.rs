use std::path::PathBuf;

use devlaunch_process::ServiceKind;

/// Failures that end a reconciliation pass.
///
/// Probing problems (unreachable ports, a broken health endpoint, a process
/// that vanished or refused termination) never show up here; they are folded
/// into booleans and outcome enums by the components that observe them.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("project directory not found: {}", .0.display())]
    ProjectNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("no free port available in {start}..65535")]
    PortUnavailable { start: u16 },

    #[error("port {port} is still in use after teardown ({service})")]
    PortInUse { service: ServiceKind, port: u16 },

    #[error("failed to spawn {service} ({command}): {source}")]
    Spawn {
        service: ServiceKind,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{service} exited before port {port} opened ({status})\n{output}")]
    LaunchFailed {
        service: ServiceKind,
        port: u16,
        status: String,
        output: String,
    },

    #[error("{service} did not open port {port} within {timeout_secs}s")]
    LaunchTimeout {
        service: ServiceKind,
        port: u16,
        timeout_secs: u64,
        pid: Option<u32>,
    },

    #[error("{service} stopped accepting connections on port {port}")]
    NotReachable { service: ServiceKind, port: u16 },

    #[error("interrupted during startup")]
    Interrupted,
}

impl LaunchError {
    /// Process exit status reported by the binary for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            LaunchError::Interrupted => 130,
            _ => 1,
        }
    }

    /// Pid of a launched process that the failure left behind, if any.
    pub fn stray_pid(&self) -> Option<u32> {
        match self {
            LaunchError::LaunchTimeout { pid, .. } => *pid,
            _ => None,
        }
    }
}
