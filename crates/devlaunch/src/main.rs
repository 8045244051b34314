use std::process::ExitCode;

use clap::Parser;
use devlaunch::{
    LaunchConfig, LaunchError, Outcome, Reconciler, SystemHost, cli::Cli, reaper::SystemReaper,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.default_log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e.downcast_ref::<LaunchError>().map_or(1, LaunchError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let config = LaunchConfig::resolve(cli.overrides())?;
    let reconciler = Reconciler::new(SystemHost::new(SystemReaper::default()), config);

    if cli.close {
        let report = reconciler.close().await;
        for line in report.summary_lines() {
            println!("{line}");
        }
        return Ok(());
    }

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let outcome = reconciler.run(interrupt).await?;
    match &outcome {
        Outcome::Reused { url, .. } => println!("Already running with this path: {url}"),
        Outcome::Launched { url, services, .. } => {
            for s in services {
                match s.pid {
                    Some(pid) => {
                        println!("{} running on port {} (pid {pid})", s.kind, s.binding.port)
                    }
                    None => println!("{} running on port {}", s.kind, s.binding.port),
                }
            }
            println!("Ready: {url}");
        }
    }
    if reconciler.config().open_browser && !outcome.browser_opened() {
        println!("Open {} in your browser", outcome.url());
    }
    Ok(())
}
