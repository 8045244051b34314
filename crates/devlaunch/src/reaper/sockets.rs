//! Maps a local TCP port to the pids holding sockets on it.
//!
//! The parsers are platform independent so they can be tested everywhere;
//! only [`pids_on_port`] touches the live system.

use std::collections::BTreeSet;

/// Socket inodes from a `/proc/net/tcp` or `/proc/net/tcp6` table whose local
/// port is `port`. Sockets without an inode (TIME_WAIT and friends) carry no
/// owner and are skipped.
pub fn parse_proc_net_tcp(text: &str, port: u16) -> Vec<u64> {
    let mut out = Vec::new();
    for line in text.lines().skip(1) {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 10 {
            continue;
        }
        let Some((_, port_hex)) = cols[1].rsplit_once(':') else {
            continue;
        };
        let Ok(local_port) = u16::from_str_radix(port_hex, 16) else {
            continue;
        };
        if local_port != port {
            continue;
        }
        match cols[9].parse::<u64>() {
            Ok(0) | Err(_) => continue,
            Ok(inode) => out.push(inode),
        }
    }
    out
}

/// `netstat -ano -p TCP` rows whose local address ends in `:port`.
pub fn parse_netstat(text: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut out = BTreeSet::new();
    for line in text.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
            continue;
        }
        if !cols[1].ends_with(&suffix) {
            continue;
        }
        if let Ok(pid) = cols[cols.len() - 1].parse::<u32>()
            && pid != 0
        {
            out.insert(pid);
        }
    }
    out.into_iter().collect()
}

/// `lsof -t` prints one pid per line.
pub fn parse_lsof_pids(text: &str) -> Vec<u32> {
    let set: BTreeSet<u32> = text
        .lines()
        .filter_map(|l| l.trim().parse::<u32>().ok())
        .filter(|pid| *pid != 0)
        .collect();
    set.into_iter().collect()
}

#[cfg(target_os = "linux")]
pub fn pids_on_port(port: u16) -> Vec<u32> {
    let mut inodes = BTreeSet::new();
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(text) = std::fs::read_to_string(table) {
            inodes.extend(parse_proc_net_tcp(&text, port));
        }
    }
    if inodes.is_empty() {
        return Vec::new();
    }

    let needles: BTreeSet<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();
    let Ok(proc_dir) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in proc_dir.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        // Other users' fd tables are unreadable; that process is skipped.
        let fds = match std::fs::read_dir(entry.path().join("fd")) {
            Ok(fds) => fds,
            Err(e) => {
                if e.kind() == std::io::ErrorKind::PermissionDenied {
                    tracing::trace!(pid, "fd table not readable");
                }
                continue;
            }
        };
        let holds = fds.flatten().any(|fd| {
            std::fs::read_link(fd.path())
                .map(|t| needles.contains(t.to_string_lossy().as_ref()))
                .unwrap_or(false)
        });
        if holds {
            out.push(pid);
        }
    }
    out
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn pids_on_port(port: u16) -> Vec<u32> {
    match std::process::Command::new("lsof")
        .args(["-nP", "-t", &format!("-iTCP:{port}")])
        .output()
    {
        Ok(out) => parse_lsof_pids(&String::from_utf8_lossy(&out.stdout)),
        Err(e) => {
            tracing::warn!(port, error = %e, "lsof unavailable");
            Vec::new()
        }
    }
}

#[cfg(windows)]
pub fn pids_on_port(port: u16) -> Vec<u32> {
    use std::os::windows::process::CommandExt;

    match std::process::Command::new("netstat")
        .args(["-ano", "-p", "TCP"])
        .creation_flags(super::CREATE_NO_WINDOW)
        .output()
    {
        Ok(out) => parse_netstat(&String::from_utf8_lossy(&out.stdout), port),
        Err(e) => {
            tracing::warn!(port, error = %e, "netstat unavailable");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_NET_TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0BB9 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41234 1 0000000000000000 100 0 0 10 0
   1: 00000000:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 41250 1 0000000000000000 100 0 0 10 0
   2: 0100007F:0BB9 0100007F:D2F0 06 00000000:00000000 03:00000F2A 00000000     0        0 0 3 0000000000000000
   3: 0100007F:D2F0 0100007F:0BB9 01 00000000:00000000 00:00000000 00000000  1000        0 41300 1 0000000000000000 20 4 30 10 -1
";

    const PROC_NET_TCP6: &str = "  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000000000000:0BB8 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 51000 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn proc_table_matches_local_port_only() {
        // 0x0BB9 = 3001; the TIME_WAIT row has inode 0, the client row's
        // local port is the ephemeral one.
        assert_eq!(parse_proc_net_tcp(PROC_NET_TCP, 3001), vec![41234]);
        assert_eq!(parse_proc_net_tcp(PROC_NET_TCP, 3000), vec![41250]);
        assert!(parse_proc_net_tcp(PROC_NET_TCP, 8080).is_empty());
    }

    #[test]
    fn proc_tcp6_table_is_understood() {
        assert_eq!(parse_proc_net_tcp(PROC_NET_TCP6, 3000), vec![51000]);
    }

    #[test]
    fn netstat_rows_are_filtered_by_local_port() {
        let text = "
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:3000           0.0.0.0:0              LISTENING       1200
  TCP    [::]:3000              [::]:0                 LISTENING       1200
  TCP    127.0.0.1:30001        0.0.0.0:0              LISTENING       777
  TCP    127.0.0.1:52110        127.0.0.1:3000         ESTABLISHED     999
  TCP    127.0.0.1:3000         127.0.0.1:52110        TIME_WAIT       0
";
        assert_eq!(parse_netstat(text, 3000), vec![1200]);
        assert_eq!(parse_netstat(text, 30001), vec![777]);
    }

    #[test]
    fn lsof_output_is_deduplicated() {
        assert_eq!(parse_lsof_pids("412\n99\n412\n\n"), vec![99, 412]);
    }
}
