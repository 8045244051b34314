use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use devlaunch_process::{PortBinding, ServiceKind};
use serde::Deserialize;

use crate::scan_path::ScanPath;

pub const CONFIG_FILE_NAME: &str = "devlaunch.toml";
pub const STATE_DIR_NAME: &str = ".devlaunch";

pub const DEFAULT_FRONTEND_PORT: u16 = 3000;
pub const DEFAULT_BACKEND_PORT: u16 = 3001;
const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 30;

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

/// Delay between launch-loop iterations.
pub fn poll_interval() -> Duration {
    Duration::from_millis(
        env_u64("DEVLAUNCH_POLL_INTERVAL_MS")
            .map(|v| v.clamp(50, 10_000))
            .unwrap_or(1000),
    )
}

pub fn health_timeout() -> Duration {
    Duration::from_millis(
        env_u64("DEVLAUNCH_HEALTH_TIMEOUT_MS")
            .map(|v| v.clamp(100, 30_000))
            .unwrap_or(1000),
    )
}

/// How long a terminated process gets to leave the process table.
pub fn stabilize_wait() -> Duration {
    Duration::from_millis(
        env_u64("DEVLAUNCH_STABILIZE_MS")
            .map(|v| v.clamp(0, 10_000))
            .unwrap_or(1000),
    )
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceFileConfig {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub port: Option<u16>,
    pub timeout_secs: Option<u64>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepFileConfig {
    pub names: Option<Vec<String>>,
}

/// Contents of `<project>/devlaunch.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub backend: ServiceFileConfig,
    pub frontend: ServiceFileConfig,
    pub sweep: SweepFileConfig,
    pub env_file: Option<String>,
}

impl FileConfig {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("parse devlaunch.toml")
    }

    /// Missing file means defaults.
    pub fn load(project_dir: &Path) -> anyhow::Result<Self> {
        let path = project_dir.join(CONFIG_FILE_NAME);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::parse(&text).with_context(|| format!("load {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }
}

/// What to run for one service and how long to wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub kind: ServiceKind,
    pub command: String,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    pub port: u16,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
}

impl ServiceSpec {
    pub fn binding(&self) -> PortBinding {
        PortBinding::localhost(self.port)
    }

    pub fn command_line(&self) -> String {
        let mut out = self.command.clone();
        for a in &self.args {
            out.push(' ');
            out.push_str(a);
        }
        out
    }

    fn from_file(
        kind: ServiceKind,
        project_dir: &Path,
        file: &ServiceFileConfig,
        port_override: Option<u16>,
    ) -> Result<Self, crate::error::LaunchError> {
        let (default_args, default_port) = match kind {
            ServiceKind::Backend => (vec!["src/backend/server.js"], DEFAULT_BACKEND_PORT),
            ServiceKind::Frontend => (vec!["setup-claude.mjs"], DEFAULT_FRONTEND_PORT),
        };
        let command = file.command.clone().unwrap_or_else(|| "node".to_string());
        if command.trim().is_empty() {
            return Err(crate::error::LaunchError::Config(format!(
                "{} command is empty",
                kind.as_str()
            )));
        }
        let port = port_override.or(file.port).unwrap_or(default_port);
        if port == 0 {
            return Err(crate::error::LaunchError::Config(format!(
                "{} port must be non-zero",
                kind.as_str()
            )));
        }
        let timeout_secs = file
            .timeout_secs
            .unwrap_or(DEFAULT_LAUNCH_TIMEOUT_SECS)
            .clamp(1, 60 * 60);

        Ok(Self {
            kind,
            command,
            args: file
                .args
                .clone()
                .unwrap_or_else(|| default_args.into_iter().map(String::from).collect()),
            work_dir: project_dir.to_path_buf(),
            port,
            timeout: Duration::from_secs(timeout_secs),
            env: file.env.clone(),
        })
    }
}

/// Everything one pass needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub project_dir: PathBuf,
    pub scan_path: ScanPath,
    pub backend: ServiceSpec,
    pub frontend: ServiceSpec,
    pub sweep_names: Vec<String>,
    pub env_file: PathBuf,
    pub open_browser: bool,
    pub port_fallback: bool,
}

/// Command-line inputs that feed into [`LaunchConfig`].
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub project_dir: Option<PathBuf>,
    pub scan_path: Option<PathBuf>,
    pub frontend_port: Option<u16>,
    pub backend_port: Option<u16>,
    pub no_browser: bool,
    pub port_fallback: bool,
}

impl LaunchConfig {
    pub fn resolve(overrides: Overrides) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir().context("read current directory")?;
        let project_dir = match overrides.project_dir.clone() {
            Some(p) if p.is_absolute() => p,
            Some(p) => cwd.join(p),
            None => cwd.clone(),
        };
        if !project_dir.is_dir() {
            return Err(crate::error::LaunchError::ProjectNotFound(project_dir).into());
        }
        let file = FileConfig::load(&project_dir)?;
        let scan_path = ScanPath::resolve(overrides.scan_path.as_deref().unwrap_or(&cwd), &cwd);
        Ok(Self::build(project_dir, scan_path, &file, &overrides)?)
    }

    pub fn build(
        project_dir: PathBuf,
        scan_path: ScanPath,
        file: &FileConfig,
        overrides: &Overrides,
    ) -> Result<Self, crate::error::LaunchError> {
        let backend = ServiceSpec::from_file(
            ServiceKind::Backend,
            &project_dir,
            &file.backend,
            overrides.backend_port,
        )?;
        let frontend = ServiceSpec::from_file(
            ServiceKind::Frontend,
            &project_dir,
            &file.frontend,
            overrides.frontend_port,
        )?;
        if backend.port == frontend.port {
            return Err(crate::error::LaunchError::Config(format!(
                "backend and frontend share port {}",
                backend.port
            )));
        }

        let sweep_names = file
            .sweep
            .names
            .clone()
            .unwrap_or_else(|| vec!["node".to_string()])
            .into_iter()
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();

        let env_file = project_dir.join(file.env_file.as_deref().unwrap_or(".env"));

        Ok(Self {
            scan_path,
            backend,
            frontend,
            sweep_names,
            env_file,
            open_browser: !overrides.no_browser,
            port_fallback: overrides.port_fallback,
            project_dir,
        })
    }

    pub fn service(&self, kind: ServiceKind) -> &ServiceSpec {
        match kind {
            ServiceKind::Backend => &self.backend,
            ServiceKind::Frontend => &self.frontend,
        }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.project_dir.join(STATE_DIR_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    pub fn run_record_path(&self) -> PathBuf {
        self.state_dir().join("run.json")
    }

    pub fn package_json(&self) -> PathBuf {
        self.project_dir.join("package.json")
    }
}
