use std::path::PathBuf;

use clap::Parser;

use crate::config::Overrides;

/// Start the frontend/backend pair for a project, reusing a running pair when
/// it already serves the requested path.
#[derive(Parser, Debug)]
#[command(name = "devlaunch", version, about, long_about = None)]
pub struct Cli {
    /// Stop the frontend, the backend and leftover processes, then exit.
    #[arg(short, long)]
    pub close: bool,

    /// Project directory holding the services and `devlaunch.toml`.
    #[arg(long, env = "DEVLAUNCH_PROJECT", value_name = "DIR")]
    pub project: Option<PathBuf>,

    /// Directory the backend should scan. Defaults to the current directory.
    #[arg(long, value_name = "DIR")]
    pub scan_path: Option<PathBuf>,

    #[arg(long, value_name = "PORT")]
    pub frontend_port: Option<u16>,

    #[arg(long, value_name = "PORT")]
    pub backend_port: Option<u16>,

    /// Do not open a browser tab.
    #[arg(long)]
    pub no_browser: bool,

    /// Move the frontend to the next free port if its port stays busy.
    #[arg(long)]
    pub port_fallback: bool,

    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            project_dir: self.project.clone(),
            scan_path: self.scan_path.clone(),
            frontend_port: self.frontend_port,
            backend_port: self.backend_port,
            no_browser: self.no_browser,
            port_fallback: self.port_fallback,
        }
    }

    /// `RUST_LOG` wins over `-v`.
    pub fn default_log_filter(&self) -> &'static str {
        if self.verbose {
            "devlaunch=debug"
        } else {
            "devlaunch=info"
        }
    }
}
