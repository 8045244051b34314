use std::{future::Future, io::ErrorKind, net::TcpListener, time::Duration};

use devlaunch_process::LOCALHOST;

use crate::error::LaunchError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// One connect attempt against `localhost:port`.
///
/// Refused, reset and timed-out connections all read as "not up yet".
pub async fn probe_once(port: u16) -> bool {
    matches!(
        tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio::net::TcpStream::connect((LOCALHOST, port))
        )
        .await,
        Ok(Ok(_))
    )
}

/// Tries up to `retries` connects (at least one), sleeping `delay` after each
/// failed attempt except the last.
pub async fn is_reachable(port: u16, retries: u32, delay: Duration) -> bool {
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        if probe_once(port).await {
            return true;
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }
    false
}

pub fn is_port_free(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(_) => true,
        Err(e) => {
            if e.kind() != ErrorKind::AddrInUse {
                tracing::debug!(port, error = %e, "bind probe failed");
            }
            false
        }
    }
}

/// First port in `[start, 65535)` outside `skip` that `is_free` accepts.
pub async fn find_free_port<F, Fut>(
    start: u16,
    skip: &[u16],
    mut is_free: F,
) -> Result<u16, LaunchError>
where
    F: FnMut(u16) -> Fut,
    Fut: Future<Output = bool>,
{
    for port in start.max(1)..u16::MAX {
        if skip.contains(&port) {
            continue;
        }
        if is_free(port).await {
            return Ok(port);
        }
    }
    Err(LaunchError::PortUnavailable { start })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn closed_port() -> u16 {
        // Bind then drop: the port is very likely closed right after.
        let l = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn closed_port_is_unreachable_within_budget() {
        let port = closed_port();
        let started = Instant::now();
        let ok = is_reachable(port, 3, Duration::from_millis(50)).await;
        assert!(!ok);
        // 2 sleeps of 50ms plus three refused connects.
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn listening_port_is_reachable_first_try() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_reachable(port, 5, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn zero_retries_still_probes_once() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_reachable(port, 0, Duration::from_millis(1)).await);
    }

    #[test]
    fn bound_port_is_not_free() {
        let l = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = l.local_addr().unwrap().port();
        assert!(!is_port_free(port));
    }

    #[tokio::test]
    async fn find_free_port_skips_bound_port() {
        let l = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = l.local_addr().unwrap().port();
        if port == u16::MAX - 1 {
            return;
        }
        let found = find_free_port(port, &[], |p| async move { is_port_free(p) })
            .await
            .unwrap();
        assert!(found > port);
    }

    #[tokio::test]
    async fn find_free_port_honors_skip_list() {
        let found = find_free_port(4000, &[4000, 4001], |p| async move { p != 4002 })
            .await
            .unwrap();
        assert_eq!(found, 4003);
    }

    #[tokio::test]
    async fn find_free_port_exhausted_range_is_fatal() {
        // The scan range is empty when starting at the last port.
        let err = find_free_port(u16::MAX, &[], |_| async { true })
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::PortUnavailable { start } if start == u16::MAX));

        let err = find_free_port(65530, &[], |_| async { false })
            .await
            .unwrap_err();
        assert!(matches!(err, LaunchError::PortUnavailable { start: 65530 }));
    }
}
