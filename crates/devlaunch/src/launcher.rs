use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use devlaunch_process::{PortBinding, ServiceKind, ServiceState, ServiceStatus};
use tokio::process::{Child, Command};

use crate::{config::ServiceSpec, error::LaunchError, port_probe, reaper};

const MAX_DIAGNOSTIC_BYTES: usize = 8 * 1024;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// A started service, owned until the pass hands it off with [`detach`].
///
/// [`detach`]: ManagedProcess::detach
#[derive(Debug)]
pub struct ManagedProcess {
    pub kind: ServiceKind,
    pub pid: Option<u32>,
    pub started_at: Option<u64>,
    pub command: String,
    pub work_dir: PathBuf,
    pub binding: PortBinding,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
    child: Child,
}

impl ManagedProcess {
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            kind: self.kind,
            state: ServiceState::Running,
            binding: self.binding.clone(),
            pid: self.pid,
            started_at: self.started_at,
            command: self.command.clone(),
            message: None,
        }
    }

    /// Gives up the handle without touching the process; it keeps running
    /// after the launcher exits.
    pub fn detach(self) -> ServiceStatus {
        let mut status = self.status();
        status.state = ServiceState::Detached;
        drop(self.child);
        status
    }
}

#[derive(Debug, Clone)]
struct LogFiles {
    stdout: PathBuf,
    stderr: PathBuf,
}

impl LogFiles {
    fn for_service(log_dir: &Path, kind: ServiceKind) -> Self {
        Self {
            stdout: log_dir.join(format!("{}.out.log", kind.as_str())),
            stderr: log_dir.join(format!("{}.err.log", kind.as_str())),
        }
    }

    fn open(&self) -> std::io::Result<(Stdio, Stdio)> {
        if let Some(dir) = self.stdout.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let out = std::fs::File::create(&self.stdout)?;
        let err = std::fs::File::create(&self.stderr)?;
        Ok((Stdio::from(out), Stdio::from(err)))
    }

    /// Whatever the child managed to print, newest bytes kept.
    async fn diagnostic(&self) -> String {
        let mut parts = Vec::new();
        for path in [&self.stdout, &self.stderr] {
            let Ok(bytes) = tokio::fs::read(path).await else {
                continue;
            };
            let text = String::from_utf8_lossy(&bytes);
            let text = text.trim();
            if !text.is_empty() {
                parts.push(text.to_string());
            }
        }
        if parts.is_empty() {
            return "(no output)".to_string();
        }
        tail_utf8(&parts.join("\n"), MAX_DIAGNOSTIC_BYTES)
    }
}

fn tail_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let prefix = "(truncated)…";
    let keep = max_bytes.saturating_sub(prefix.len()).max(1);
    let mut start = s.len() - keep.min(s.len());
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    format!("{prefix}{}", &s[start..])
}

/// Windows needs the batch shim for the Node package managers.
fn resolve_program(command: &str) -> String {
    if cfg!(windows) && matches!(command, "npm" | "npx" | "yarn" | "pnpm") {
        return format!("{command}.cmd");
    }
    command.to_string()
}

fn build_command(spec: &ServiceSpec, stdout: Stdio, stderr: Stdio) -> Command {
    let mut cmd = Command::new(resolve_program(&spec.command));
    cmd.args(&spec.args)
        .current_dir(&spec.work_dir)
        .env("PORT", spec.port.to_string())
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    // New session: no controlling terminal, so closing ours does not take
    // the service down with it.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    #[cfg(windows)]
    cmd.creation_flags(crate::reaper::CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);

    cmd
}

/// Spawns `spec` and waits until its port accepts connections.
///
/// Fails fast with the captured output if the child exits first. On timeout
/// the child is left running and its pid is reported in the error. The pid is
/// also pushed to `spawned` as soon as it exists, so a caller that abandons
/// this future still knows what to clean up.
pub async fn start(
    spec: &ServiceSpec,
    log_dir: &Path,
    poll_interval: Duration,
    spawned: &mut Vec<u32>,
) -> Result<ManagedProcess, LaunchError> {
    let command = spec.command_line();
    let logs = LogFiles::for_service(log_dir, spec.kind);
    let (stdout, stderr) = logs.open().map_err(|source| LaunchError::Spawn {
        service: spec.kind,
        command: command.clone(),
        source,
    })?;

    let mut child = build_command(spec, stdout, stderr)
        .spawn()
        .map_err(|source| LaunchError::Spawn {
            service: spec.kind,
            command: command.clone(),
            source,
        })?;
    let pid = child.id();
    spawned.extend(pid);
    let started_at = pid.and_then(reaper::identify).map(|p| p.start_time);
    tracing::info!(
        service = %spec.kind,
        pid = ?pid,
        port = spec.port,
        cwd = %spec.work_dir.display(),
        %command,
        "spawned"
    );

    let deadline = tokio::time::Instant::now() + spec.timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let output = logs.diagnostic().await;
                tracing::error!(service = %spec.kind, %status, "exited during startup");
                return Err(LaunchError::LaunchFailed {
                    service: spec.kind,
                    port: spec.port,
                    status: status.to_string(),
                    output,
                });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(service = %spec.kind, error = %e, "could not poll child"),
        }

        if port_probe::probe_once(spec.port).await {
            tracing::info!(service = %spec.kind, port = spec.port, "accepting connections");
            return Ok(ManagedProcess {
                kind: spec.kind,
                pid,
                started_at,
                command,
                work_dir: spec.work_dir.clone(),
                binding: spec.binding(),
                stdout_log: logs.stdout,
                stderr_log: logs.stderr,
                child,
            });
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            tracing::warn!(service = %spec.kind, port = spec.port, "startup timed out");
            return Err(LaunchError::LaunchTimeout {
                service: spec.kind,
                port: spec.port,
                timeout_secs: spec.timeout.as_secs(),
                pid,
            });
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}
