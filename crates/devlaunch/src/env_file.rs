use std::path::Path;

use anyhow::Context;

use crate::scan_path::ScanPath;

pub const SCAN_PATH_KEY: &str = "SCAN_PATH";

pub fn render(scan_path: &ScanPath) -> String {
    format!("{SCAN_PATH_KEY}={}\n", scan_path.as_str())
}

/// Overwrites `path` with a single `SCAN_PATH` entry for the backend to pick
/// up at startup.
pub fn write_scan_path(path: &Path, scan_path: &ScanPath) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    std::fs::write(path, render(scan_path)).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join(".env");
        std::fs::write(&env, "SCAN_PATH=/old\nPORT=9\n").unwrap();

        write_scan_path(&env, &ScanPath::from_canonical(r"D:\work\notes")).unwrap();

        assert_eq!(std::fs::read_to_string(&env).unwrap(), "SCAN_PATH=D:/work/notes\n");
    }

    #[test]
    fn unwritable_target_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be.
        let env = dir.path().join(".env");
        std::fs::create_dir(&env).unwrap();
        let err = write_scan_path(&env, &ScanPath::from_canonical("/x")).unwrap_err();
        assert!(format!("{err:#}").contains(".env"));
    }
}
