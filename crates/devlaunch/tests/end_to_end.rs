//! Drives the compiled binary and the real host against scratch projects.
//!
//! Every project sweeps by a name no real process has, so these tests never
//! touch unrelated processes on the machine running them.

use std::{
    net::TcpListener,
    path::Path,
    process::{Command, Output},
    time::Duration,
};

use devlaunch::{
    LaunchConfig, Outcome, Reconciler, SystemHost,
    config::{FileConfig, Overrides},
    port_probe,
    reaper::SystemReaper,
    scan_path::ScanPath,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const SWEEP_NOBODY: &str = "[sweep]\nnames = [\"devlaunch-test-no-such-process\"]\n";

fn free_port() -> u16 {
    TcpListener::bind(("127.0.0.1", 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn free_pair() -> (u16, u16) {
    loop {
        let (a, b) = (free_port(), free_port());
        if a != b {
            return (a, b);
        }
    }
}

fn devlaunch(project: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_devlaunch"))
        .arg("--project")
        .arg(project)
        .arg("--no-browser")
        .args(args)
        .env("DEVLAUNCH_STABILIZE_MS", "100")
        .env("DEVLAUNCH_POLL_INTERVAL_MS", "100")
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

#[test]
fn close_with_nothing_running_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("devlaunch.toml"), SWEEP_NOBODY).unwrap();
    let (fe, be) = free_pair();

    let out = devlaunch(
        dir.path(),
        &[
            "--close",
            "--frontend-port",
            &fe.to_string(),
            "--backend-port",
            &be.to_string(),
        ],
    );

    assert!(out.status.success(), "{out:?}");
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Closed 0 processes"), "{stdout}");
}

#[test]
fn missing_project_dir_fails() {
    let dir = tempfile::tempdir().unwrap();
    let out = devlaunch(&dir.path().join("nope"), &["--close"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("project directory not found"));
}

#[cfg(unix)]
#[test]
fn backend_that_dies_reports_its_output() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("devlaunch.toml"),
        format!(
            "{SWEEP_NOBODY}\n[backend]\ncommand = \"sh\"\nargs = [\"-c\", \"echo ENOENT >&2; exit 1\"]\n\n[frontend]\ncommand = \"sh\"\nargs = [\"-c\", \"sleep 30\"]\n"
        ),
    )
    .unwrap();
    let (fe, be) = free_pair();

    let out = devlaunch(
        dir.path(),
        &[
            "--frontend-port",
            &fe.to_string(),
            "--backend-port",
            &be.to_string(),
        ],
    );

    assert_eq!(out.status.code(), Some(1), "{out:?}");
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("ENOENT"), "{stderr}");
    assert!(stderr.contains("Backend exited before port"), "{stderr}");
    assert_eq!(
        std::fs::read_to_string(dir.path().join(".env")).unwrap(),
        format!(
            "SCAN_PATH={}\n",
            ScanPath::resolve(&std::env::current_dir().unwrap(), Path::new("/"))
        )
    );
    assert!(!dir.path().join(".devlaunch/run.json").exists());

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        assert!(!port_probe::is_reachable(be, 1, Duration::ZERO).await);
        assert!(!port_probe::is_reachable(fe, 1, Duration::ZERO).await);
    });
}

/// Accepts forever, answering every request with the given health body.
async fn serve_health(listener: tokio::net::TcpListener, body: String) {
    loop {
        let Ok((mut sock, _)) = listener.accept().await else {
            return;
        };
        let body = body.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            if matches!(sock.read(&mut buf).await, Ok(0) | Err(_)) {
                return;
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = sock.write_all(response.as_bytes()).await;
            let _ = sock.shutdown().await;
        });
    }
}

async fn accept_forever(listener: tokio::net::TcpListener) {
    while listener.accept().await.is_ok() {}
}

#[tokio::test]
async fn running_pair_with_same_path_is_reused() {
    let project = tempfile::tempdir().unwrap();
    let scan = tempfile::tempdir().unwrap();
    let scan_path = ScanPath::resolve(scan.path(), project.path());

    let backend = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let frontend = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let be = backend.local_addr().unwrap().port();
    let fe = frontend.local_addr().unwrap().port();
    let body = serde_json::json!({"status": "ok", "scanPath": scan_path.as_str()}).to_string();
    tokio::spawn(serve_health(backend, body));
    tokio::spawn(accept_forever(frontend));

    let file = FileConfig::parse(SWEEP_NOBODY).unwrap();
    let overrides = Overrides {
        frontend_port: Some(fe),
        backend_port: Some(be),
        no_browser: true,
        ..Overrides::default()
    };
    let config =
        LaunchConfig::build(project.path().to_path_buf(), scan_path, &file, &overrides).unwrap();
    let host = SystemHost::new(SystemReaper::new(Duration::from_millis(100)));
    let reconciler = Reconciler::new(host, config);

    let outcome = reconciler.run(std::future::pending()).await.unwrap();

    assert_eq!(
        outcome,
        Outcome::Reused {
            url: format!("http://localhost:{fe}"),
            browser_opened: false,
        }
    );
    assert!(!project.path().join(".env").exists());
    assert!(port_probe::is_reachable(be, 1, Duration::ZERO).await);
}
