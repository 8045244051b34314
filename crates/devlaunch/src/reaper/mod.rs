//! Finding and terminating processes that hold our ports.
//!
//! Windows has a process-tree kill (`taskkill /T /F`) and gets it; Unix gets a
//! plain SIGTERM to the single process. Either way the caller sees the same
//! contract, and races with processes exiting on their own are not errors.

pub mod sockets;

use std::{collections::BTreeSet, time::Duration};

use devlaunch_process::ServiceStatus;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

#[cfg(windows)]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    /// Gone before we got to it. Counts as success.
    Vanished,
    /// Not ours to kill. Skipped.
    Denied,
    /// The pid now belongs to a different process. Skipped.
    Reassigned,
}

impl TerminateOutcome {
    pub fn is_gone(self) -> bool {
        matches!(self, TerminateOutcome::Terminated | TerminateOutcome::Vanished)
    }
}

#[allow(async_fn_in_trait)]
pub trait ProcessReaper {
    /// Terminates every process with a socket on local `port`. True if at
    /// least one of them is gone afterwards.
    async fn terminate_process_on_port(&self, port: u16) -> bool;

    /// Terminates every process whose executable is called `name`. Returns
    /// how many were terminated.
    async fn terminate_all_by_name(&self, name: &str) -> usize;

    async fn terminate_pid(&self, pid: u32) -> TerminateOutcome;

    /// Terminates a process a previous run recorded, but only if its pid
    /// still names the same program started at the same time.
    async fn terminate_recorded(&self, recorded: &ServiceStatus) -> TerminateOutcome;
}

#[derive(Debug, Clone)]
pub struct SystemReaper {
    stabilize: Duration,
}

impl Default for SystemReaper {
    fn default() -> Self {
        Self::new(crate::config::stabilize_wait())
    }
}

impl SystemReaper {
    pub fn new(stabilize: Duration) -> Self {
        Self { stabilize }
    }

    async fn terminate_many(&self, pids: &BTreeSet<u32>) -> Vec<(u32, TerminateOutcome)> {
        let own = std::process::id();
        let mut out = Vec::with_capacity(pids.len());
        for &pid in pids {
            if pid == own {
                continue;
            }
            let outcome = platform::terminate(pid);
            match outcome {
                TerminateOutcome::Terminated => tracing::debug!(pid, "terminate sent"),
                TerminateOutcome::Vanished => tracing::debug!(pid, "process already gone"),
                TerminateOutcome::Denied => tracing::warn!(pid, "permission denied, skipping"),
                TerminateOutcome::Reassigned => {}
            }
            out.push((pid, outcome));
        }

        let sent: Vec<u32> = out
            .iter()
            .filter(|(_, o)| *o == TerminateOutcome::Terminated)
            .map(|(pid, _)| *pid)
            .collect();
        if !sent.is_empty() && !wait_for_exit(&sent, self.stabilize).await {
            tracing::debug!(?sent, "some processes outlived the stabilization wait");
        }
        out
    }
}

impl ProcessReaper for SystemReaper {
    async fn terminate_process_on_port(&self, port: u16) -> bool {
        let pids: BTreeSet<u32> = sockets::pids_on_port(port).into_iter().collect();
        if pids.is_empty() {
            tracing::debug!(port, "no process holds port");
            return false;
        }
        tracing::info!(port, ?pids, "terminating processes on port");
        self.terminate_many(&pids)
            .await
            .iter()
            .any(|(_, o)| o.is_gone())
    }

    async fn terminate_all_by_name(&self, name: &str) -> usize {
        let pids = pids_by_name(name);
        if pids.is_empty() {
            return 0;
        }
        tracing::info!(name, count = pids.len(), "sweeping processes by name");
        self.terminate_many(&pids)
            .await
            .iter()
            .filter(|(_, o)| *o == TerminateOutcome::Terminated)
            .count()
    }

    async fn terminate_pid(&self, pid: u32) -> TerminateOutcome {
        let set = BTreeSet::from([pid]);
        self.terminate_many(&set)
            .await
            .first()
            .map(|(_, o)| *o)
            .unwrap_or(TerminateOutcome::Denied)
    }

    async fn terminate_recorded(&self, recorded: &ServiceStatus) -> TerminateOutcome {
        let Some(pid) = recorded.pid else {
            return TerminateOutcome::Vanished;
        };
        let Some(found) = identify(pid) else {
            tracing::debug!(pid, "recorded process already gone");
            return TerminateOutcome::Vanished;
        };
        if !found.matches(recorded) {
            tracing::warn!(
                pid,
                recorded = recorded.program(),
                found = %found.name,
                "pid was reused by another process, leaving it alone"
            );
            return TerminateOutcome::Reassigned;
        }
        self.terminate_pid(pid).await
    }
}

/// What the process table says about a live pid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub name: String,
    pub exe_name: Option<String>,
    pub start_time: u64,
}

impl ProcessIdentity {
    /// Same program, and the same start time when one was recorded.
    pub fn matches(&self, recorded: &ServiceStatus) -> bool {
        let program = recorded.program();
        let same_program = name_matches(&self.name, program)
            || self
                .exe_name
                .as_deref()
                .is_some_and(|exe| name_matches(exe, program));
        same_program && recorded.started_at.is_none_or(|t| t == self.start_time)
    }
}

/// `None` when `pid` is not running.
pub fn identify(pid: u32) -> Option<ProcessIdentity> {
    let spid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[spid]),
        true,
        ProcessRefreshKind::new().with_exe(sysinfo::UpdateKind::OnlyIfNotSet),
    );
    let process = system.process(spid)?;
    if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
        return None;
    }
    Some(ProcessIdentity {
        name: process.name().to_string_lossy().into_owned(),
        exe_name: process
            .exe()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned()),
        start_time: process.start_time(),
    })
}

/// `node` matches `node`, `Node.exe` and `node.EXE`.
pub fn name_matches(process_name: &str, wanted: &str) -> bool {
    fn strip_exe(s: &str) -> &str {
        match s.len().checked_sub(4).and_then(|at| s.split_at_checked(at)) {
            Some((stem, ext)) if !stem.is_empty() && ext.eq_ignore_ascii_case(".exe") => stem,
            _ => s,
        }
    }
    let a = strip_exe(process_name.trim());
    let b = strip_exe(wanted.trim());
    !b.is_empty() && a.eq_ignore_ascii_case(b)
}

fn refresh_all() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
    system
}

fn pids_by_name(name: &str) -> BTreeSet<u32> {
    let system = refresh_all();
    system
        .processes()
        .iter()
        .filter(|(_, p)| name_matches(&p.name().to_string_lossy(), name))
        .map(|(pid, _)| pid.as_u32())
        .collect()
}

fn is_alive(system: &mut System, pid: u32) -> bool {
    let spid = Pid::from_u32(pid);
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[spid]),
        true,
        ProcessRefreshKind::new(),
    );
    system
        .process(spid)
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

/// Polls until every pid has left the process table or `timeout` runs out.
async fn wait_for_exit(pids: &[u32], timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut system = System::new();
    loop {
        if !pids.iter().any(|pid| is_alive(&mut system, *pid)) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(unix)]
mod platform {
    use super::TerminateOutcome;

    pub(super) fn terminate(pid: u32) -> TerminateOutcome {
        let Ok(raw) = i32::try_from(pid) else {
            return TerminateOutcome::Vanished;
        };
        let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
        if rc == 0 {
            return TerminateOutcome::Terminated;
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::ESRCH) => TerminateOutcome::Vanished,
            _ => TerminateOutcome::Denied,
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::os::windows::process::CommandExt;

    use super::{CREATE_NO_WINDOW, TerminateOutcome};

    // taskkill exits with 128 when the pid does not exist.
    const TASKKILL_NOT_FOUND: i32 = 128;

    pub(super) fn terminate(pid: u32) -> TerminateOutcome {
        let out = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .creation_flags(CREATE_NO_WINDOW)
            .output();
        match out {
            Ok(o) if o.status.success() => TerminateOutcome::Terminated,
            Ok(o) if o.status.code() == Some(TASKKILL_NOT_FOUND) => TerminateOutcome::Vanished,
            Ok(o) => {
                tracing::debug!(
                    pid,
                    stderr = %String::from_utf8_lossy(&o.stderr).trim(),
                    "taskkill refused"
                );
                TerminateOutcome::Denied
            }
            Err(e) => {
                tracing::warn!(pid, error = %e, "taskkill unavailable");
                TerminateOutcome::Denied
            }
        }
    }
}
