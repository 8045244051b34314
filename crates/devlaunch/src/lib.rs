pub mod browser;
pub mod cli;
pub mod config;
pub mod env_file;
pub mod error;
pub mod health;
pub mod launcher;
pub mod package_json;
pub mod port_probe;
pub mod reaper;
pub mod reconciler;
pub mod run_record;
pub mod scan_path;

pub use config::LaunchConfig;
pub use error::LaunchError;
pub use reconciler::{Host, Outcome, Reconciler, SystemHost, TeardownReport};
