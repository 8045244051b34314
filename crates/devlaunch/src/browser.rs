use std::{process::Stdio, time::Duration};

use anyhow::Context;
use tokio::process::Command;

/// How long a short-lived opener gets to report failure. Openers that are
/// still running afterwards are assumed to have handed off the URL.
const OPENER_WAIT: Duration = Duration::from_secs(2);

/// The platform's "open this URL with the default handler" command.
pub fn opener_command(url: &str) -> (String, Vec<String>) {
    if cfg!(target_os = "macos") {
        ("open".to_string(), vec![url.to_string()])
    } else if cfg!(windows) {
        // The empty string is `start`'s window title argument.
        (
            "cmd".to_string(),
            vec!["/C".into(), "start".into(), "".into(), url.to_string()],
        )
    } else {
        ("xdg-open".to_string(), vec![url.to_string()])
    }
}

/// Hands `url` to the default browser. Fails if the opener cannot start or
/// exits unsuccessfully within a short wait.
pub async fn open_url(url: &str) -> anyhow::Result<()> {
    let (program, args) = opener_command(url);
    run_opener(&program, &args, OPENER_WAIT).await
}

async fn run_opener(program: &str, args: &[String], wait: Duration) -> anyhow::Result<()> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(windows)]
    cmd.creation_flags(crate::reaper::CREATE_NO_WINDOW);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("launch browser via `{program}`"))?;
    match tokio::time::timeout(wait, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => anyhow::bail!("`{program}` exited with {status}"),
        Ok(Err(e)) => Err(e).with_context(|| format!("wait for `{program}`")),
        Err(_) => {
            tracing::debug!(program, "opener still running, assuming it took the url");
            Ok(())
        }
    }
}
