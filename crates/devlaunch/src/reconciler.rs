//! One reconciliation pass: reuse a matching instance, or tear down whatever
//! holds the ports and start a fresh backend/frontend pair.

use std::{future::Future, path::Path, pin::Pin, time::Duration};

use devlaunch_process::{HealthStatus, PassId, PortBinding, ServiceKind, ServiceStatus};
use tracing::{Instrument, info_span};

use crate::{
    browser,
    config::{self, LaunchConfig, ServiceSpec},
    env_file,
    error::LaunchError,
    health,
    launcher::{self, ManagedProcess},
    package_json, port_probe,
    reaper::{ProcessReaper, SystemReaper, TerminateOutcome},
    run_record::{self, RunRecord},
};

const EXISTING_PROBE_DELAY: Duration = Duration::from_millis(100);
const CONFIRM_RETRIES: u32 = 3;
const CONFIRM_DELAY: Duration = Duration::from_millis(500);

/// A launched process the pass still owns.
pub trait Launched {
    fn status(&self) -> ServiceStatus;
    fn detach(self) -> ServiceStatus;
}

impl Launched for ManagedProcess {
    fn status(&self) -> ServiceStatus {
        ManagedProcess::status(self)
    }

    fn detach(self) -> ServiceStatus {
        ManagedProcess::detach(self)
    }
}

/// Everything a pass does to the outside world besides files in the project
/// directory.
#[allow(async_fn_in_trait)]
pub trait Host {
    type Process: Launched;

    async fn is_reachable(&self, port: u16, retries: u32, delay: Duration) -> bool;
    /// Nothing listens on `port` and it can be bound.
    async fn is_port_free(&self, port: u16) -> bool;
    async fn health(&self, binding: &PortBinding) -> HealthStatus;

    async fn terminate_process_on_port(&self, port: u16) -> bool;
    async fn terminate_all_by_name(&self, name: &str) -> usize;
    async fn terminate_pid(&self, pid: u32) -> TerminateOutcome;
    /// Terminates a process from an earlier run if its pid still names it.
    async fn terminate_recorded(&self, recorded: &ServiceStatus) -> TerminateOutcome;

    /// Starts `spec` and waits for its port. Pids are pushed to `spawned`
    /// as soon as they exist.
    async fn launch(
        &self,
        spec: &ServiceSpec,
        log_dir: &Path,
        spawned: &mut Vec<u32>,
    ) -> Result<Self::Process, LaunchError>;

    async fn open_browser(&self, url: &str) -> anyhow::Result<()>;
}

/// The real machine.
#[derive(Debug, Clone)]
pub struct SystemHost<R = SystemReaper> {
    reaper: R,
    poll_interval: Duration,
    health_timeout: Duration,
}

impl<R: ProcessReaper> SystemHost<R> {
    pub fn new(reaper: R) -> Self {
        Self {
            reaper,
            poll_interval: config::poll_interval(),
            health_timeout: config::health_timeout(),
        }
    }
}

impl<R: ProcessReaper> Host for SystemHost<R> {
    type Process = ManagedProcess;

    async fn is_reachable(&self, port: u16, retries: u32, delay: Duration) -> bool {
        port_probe::is_reachable(port, retries, delay).await
    }

    async fn is_port_free(&self, port: u16) -> bool {
        // The bind test alone misses listeners on the other address family.
        port_probe::is_port_free(port) && !port_probe::probe_once(port).await
    }

    async fn health(&self, binding: &PortBinding) -> HealthStatus {
        health::query(binding, self.health_timeout).await
    }

    async fn terminate_process_on_port(&self, port: u16) -> bool {
        self.reaper.terminate_process_on_port(port).await
    }

    async fn terminate_all_by_name(&self, name: &str) -> usize {
        self.reaper.terminate_all_by_name(name).await
    }

    async fn terminate_pid(&self, pid: u32) -> TerminateOutcome {
        self.reaper.terminate_pid(pid).await
    }

    async fn terminate_recorded(&self, recorded: &ServiceStatus) -> TerminateOutcome {
        self.reaper.terminate_recorded(recorded).await
    }

    async fn launch(
        &self,
        spec: &ServiceSpec,
        log_dir: &Path,
        spawned: &mut Vec<u32>,
    ) -> Result<ManagedProcess, LaunchError> {
        launcher::start(spec, log_dir, self.poll_interval, spawned).await
    }

    async fn open_browser(&self, url: &str) -> anyhow::Result<()> {
        browser::open_url(url).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A running pair already served this scan path.
    Reused { url: String, browser_opened: bool },
    Launched {
        url: String,
        services: Vec<ServiceStatus>,
        browser_opened: bool,
    },
}

impl Outcome {
    pub fn url(&self) -> &str {
        match self {
            Outcome::Reused { url, .. } | Outcome::Launched { url, .. } => url,
        }
    }

    pub fn browser_opened(&self) -> bool {
        match self {
            Outcome::Reused { browser_opened, .. } | Outcome::Launched { browser_opened, .. } => {
                *browser_opened
            }
        }
    }
}

/// What a teardown actually stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Services whose port had a process that is now gone.
    pub closed: Vec<(ServiceKind, u16)>,
    /// Recorded or just-spawned pids terminated directly.
    /// Recorded pids that now belong to another program are not counted.
    pub stray: usize,
    /// Processes terminated by the name sweep.
    pub swept: usize,
    pub sweep_names: Vec<String>,
}

impl TeardownReport {
    pub fn total(&self) -> usize {
        self.closed.len() + self.stray + self.swept
    }

    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines = vec![format!("Closed {} processes", self.total())];
        for (kind, port) in &self.closed {
            lines.push(format!("- {kind} (port {port})"));
        }
        if self.stray > 0 {
            lines.push(format!("- {} recorded processes", self.stray));
        }
        if self.swept > 0 {
            lines.push(format!(
                "- {} processes named {}",
                self.swept,
                self.sweep_names.join(", ")
            ));
        }
        lines
    }
}

pub struct Reconciler<H: Host> {
    host: H,
    config: LaunchConfig,
    pass_id: PassId,
}

impl<H: Host> Reconciler<H> {
    pub fn new(host: H, config: LaunchConfig) -> Self {
        Self {
            host,
            config,
            pass_id: PassId::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Runs one pass. Resolving `interrupt` while services are starting
    /// aborts with [`LaunchError::Interrupted`] after cleaning up.
    pub async fn run<F>(&self, interrupt: F) -> Result<Outcome, LaunchError>
    where
        F: Future<Output = ()>,
    {
        let span = info_span!("pass", id = %self.pass_id, scan_path = %self.config.scan_path);
        self.run_inner(interrupt).instrument(span).await
    }

    /// Tears everything down without launching.
    pub async fn close(&self) -> TeardownReport {
        let span = info_span!("close", id = %self.pass_id);
        self.close_inner().instrument(span).await
    }

    async fn run_inner<F>(&self, interrupt: F) -> Result<Outcome, LaunchError>
    where
        F: Future<Output = ()>,
    {
        if self.probe_existing().await {
            let url = self.config.frontend.binding().url();
            tracing::info!(%url, "reusing running instance");
            let browser_opened = self.open_browser(&url).await;
            return Ok(Outcome::Reused {
                url,
                browser_opened,
            });
        }

        let ports = self.ports();
        let report = self.teardown(&ports, &[], &[]).await;
        tracing::info!(closed = report.total(), "teardown finished");

        tracing::info!(path = %self.config.scan_path, "setting scan path");
        if let Err(e) = env_file::write_scan_path(&self.config.env_file, &self.config.scan_path) {
            tracing::warn!(error = %format!("{e:#}"), "could not write env file, continuing");
        }

        let mut interrupt = std::pin::pin!(interrupt);
        let mut spawned = Vec::new();
        let mut launched = Vec::new();
        let result = self
            .launch_all(interrupt.as_mut(), &mut spawned, &mut launched)
            .await;

        let frontend = match result {
            Ok(frontend) => frontend,
            Err(e) => {
                self.fail(&e, &spawned, &launched).await;
                return Err(e);
            }
        };

        let services: Vec<ServiceStatus> = launched.into_iter().map(Launched::detach).collect();
        let record = RunRecord::new(
            self.pass_id.clone(),
            self.config.scan_path.as_str().to_string(),
            services.clone(),
        );
        if let Err(e) = run_record::write(&self.config.run_record_path(), &record).await {
            tracing::warn!(error = %format!("{e:#}"), "could not write run record");
        }

        let url = frontend.url();
        tracing::info!(%url, "services ready");
        let browser_opened = self.open_browser(&url).await;
        Ok(Outcome::Launched {
            url,
            services,
            browser_opened,
        })
    }

    async fn close_inner(&self) -> TeardownReport {
        let record_path = self.config.run_record_path();
        let record = run_record::read(&record_path).await;

        let mut ports = self.ports();
        let mut recorded = Vec::new();
        if let Some(record) = record {
            for s in &record.services {
                if !ports.contains(&(s.kind, s.binding.port)) {
                    ports.push((s.kind, s.binding.port));
                }
            }
            recorded = record.services;
        }

        let report = self.teardown(&ports, &[], &recorded).await;
        run_record::remove(&record_path).await;
        report
    }

    fn ports(&self) -> Vec<(ServiceKind, u16)> {
        ServiceKind::LAUNCH_ORDER
            .iter()
            .map(|&k| (k, self.config.service(k).port))
            .collect()
    }

    async fn probe_existing(&self) -> bool {
        let backend = self.config.backend.binding();
        let frontend = self.config.frontend.binding();
        for binding in [&frontend, &backend] {
            if !self
                .host
                .is_reachable(binding.port, 1, EXISTING_PROBE_DELAY)
                .await
            {
                tracing::debug!(port = binding.port, "no existing instance");
                return false;
            }
        }

        let health = self.host.health(&backend).await;
        match health.scan_path {
            Some(reported) if health.reachable => {
                if self.config.scan_path.matches_reported(&reported) {
                    true
                } else {
                    tracing::info!(%reported, "running instance serves a different path");
                    false
                }
            }
            _ => {
                tracing::info!("running instance did not report its scan path");
                false
            }
        }
    }

    /// Reaps `ports`, terminates `pids` and whichever `recorded` processes
    /// are still the ones recorded, then sweeps by name. Never fails.
    async fn teardown(
        &self,
        ports: &[(ServiceKind, u16)],
        pids: &[u32],
        recorded: &[ServiceStatus],
    ) -> TeardownReport {
        let mut report = TeardownReport {
            sweep_names: self.config.sweep_names.clone(),
            ..TeardownReport::default()
        };

        for &(kind, port) in ports {
            if self.host.terminate_process_on_port(port).await {
                tracing::info!(service = %kind, port, "closed");
                report.closed.push((kind, port));
            }
        }

        for &pid in pids {
            if self.host.terminate_pid(pid).await == TerminateOutcome::Terminated {
                report.stray += 1;
            }
        }

        for status in recorded.iter().filter(|s| s.pid.is_some()) {
            if self.host.terminate_recorded(status).await == TerminateOutcome::Terminated {
                report.stray += 1;
            }
        }

        for name in &self.config.sweep_names {
            report.swept += self.host.terminate_all_by_name(name).await;
        }
        report
    }

    /// Makes sure `spec`'s port is free, falling back to another frontend
    /// port when allowed. Returns the spec to launch.
    async fn claim_port(&self, spec: &ServiceSpec) -> Result<ServiceSpec, LaunchError> {
        if self.host.is_port_free(spec.port).await {
            return Ok(spec.clone());
        }
        if spec.kind != ServiceKind::Frontend || !self.config.port_fallback {
            return Err(LaunchError::PortInUse {
                service: spec.kind,
                port: spec.port,
            });
        }

        let host = &self.host;
        let port = port_probe::find_free_port(
            spec.port.saturating_add(1),
            &[self.config.backend.port],
            move |p| host.is_port_free(p),
        )
        .await?;
        tracing::warn!(from = spec.port, to = port, "frontend port busy, falling back");

        let package_json = self.config.package_json();
        if package_json.exists() {
            match package_json::pin_dev_port_in_file(&package_json, port) {
                Ok(true) => tracing::info!(port, "pinned dev script port in package.json"),
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "could not update package.json"),
            }
        }

        let mut spec = spec.clone();
        spec.port = port;
        Ok(spec)
    }

    /// Launches backend then frontend and confirms both. Returns the
    /// frontend binding actually used.
    async fn launch_all<F>(
        &self,
        mut interrupt: Pin<&mut F>,
        spawned: &mut Vec<u32>,
        launched: &mut Vec<H::Process>,
    ) -> Result<PortBinding, LaunchError>
    where
        F: Future<Output = ()>,
    {
        let log_dir = self.config.log_dir();
        let mut specs = Vec::with_capacity(2);
        for kind in ServiceKind::LAUNCH_ORDER {
            specs.push(self.claim_port(self.config.service(kind)).await?);
        }

        for spec in &specs {
            tracing::info!(service = %spec.kind, port = spec.port, command = %spec.command_line(), "starting");
            let process = tokio::select! {
                biased;
                () = interrupt.as_mut() => return Err(LaunchError::Interrupted),
                res = self.host.launch(spec, &log_dir, spawned) => res?,
            };
            launched.push(process);
        }

        for spec in &specs {
            let ok = tokio::select! {
                biased;
                () = interrupt.as_mut() => return Err(LaunchError::Interrupted),
                ok = self.host.is_reachable(spec.port, CONFIRM_RETRIES, CONFIRM_DELAY) => ok,
            };
            if !ok {
                return Err(LaunchError::NotReachable {
                    service: spec.kind,
                    port: spec.port,
                });
            }
        }

        let frontend = specs
            .iter()
            .find(|s| s.kind == ServiceKind::Frontend)
            .map(ServiceSpec::binding)
            .unwrap_or_else(|| self.config.frontend.binding());
        Ok(frontend)
    }

    async fn fail(&self, err: &LaunchError, spawned: &[u32], launched: &[H::Process]) {
        tracing::error!(error = %err, "pass failed, cleaning up");

        let mut pids: Vec<u32> = launched.iter().filter_map(|p| p.status().pid).collect();
        pids.extend(spawned.iter().copied());
        pids.extend(err.stray_pid());
        pids.sort_unstable();
        pids.dedup();

        let mut ports = self.ports();
        if let LaunchError::LaunchFailed { service, port, .. }
        | LaunchError::LaunchTimeout { service, port, .. }
        | LaunchError::NotReachable { service, port } = err
            && !ports.contains(&(*service, *port))
        {
            ports.push((*service, *port));
        }

        let report = self.teardown(&ports, &pids, &[]).await;
        tracing::info!(closed = report.total(), "cleanup finished");
    }

    async fn open_browser(&self, url: &str) -> bool {
        if !self.config.open_browser {
            return false;
        }
        match self.host.open_browser(url).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(%url, error = %format!("{e:#}"), "could not open browser");
                false
            }
        }
    }
}
