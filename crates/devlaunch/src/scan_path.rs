//! Canonical form of the directory the backend is asked to scan.
//!
//! The same string is written to the env file and compared against what the
//! backend reports, so both sides go through [`normalize_lexical`]:
//! forward slashes, no trailing separator (roots excepted) and no Windows
//! verbatim prefix. Symlinks are resolved only for the local side, where the
//! path can be inspected. Case is folded for comparison on Windows and macOS.

use std::{
    fmt,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPath(String);

impl ScanPath {
    /// Absolutizes `path` against `cwd`, resolves symlinks when the path
    /// exists and normalizes separators.
    pub fn resolve(path: &Path, cwd: &Path) -> Self {
        let abs: PathBuf = if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        };
        let resolved = std::fs::canonicalize(&abs).unwrap_or(abs);
        Self(normalize_lexical(&resolved.to_string_lossy()))
    }

    /// Wraps an already-normalized string.
    pub fn from_canonical(s: impl Into<String>) -> Self {
        Self(normalize_lexical(&s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True only when `reported` names this exact directory.
    pub fn matches_reported(&self, reported: &str) -> bool {
        let reported = reported.trim();
        if reported.is_empty() {
            return false;
        }
        let other = normalize_lexical(reported);
        if case_insensitive_fs() {
            self.0.eq_ignore_ascii_case(&other)
        } else {
            self.0 == other
        }
    }
}

impl fmt::Display for ScanPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize_lexical(raw: &str) -> String {
    let mut s = raw.replace('\\', "/");
    if let Some(rest) = s.strip_prefix("//?/UNC/") {
        s = format!("//{rest}");
    } else if let Some(rest) = s.strip_prefix("//?/") {
        s = rest.to_string();
    }
    while s.len() > 1 && s.ends_with('/') && !is_drive_root(&s) {
        s.pop();
    }
    s
}

fn is_drive_root(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() == 3 && b[0].is_ascii_alphabetic() && b[1] == b':' && b[2] == b'/'
}

fn case_insensitive_fs() -> bool {
    cfg!(any(windows, target_os = "macos"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slashes_are_dropped() {
        assert_eq!(normalize_lexical("/home/me/notes///"), "/home/me/notes");
        assert_eq!(normalize_lexical("/"), "/");
    }

    #[test]
    fn windows_paths_use_forward_slashes() {
        assert_eq!(normalize_lexical(r"D:\work\notes\"), "D:/work/notes");
        assert_eq!(normalize_lexical(r"C:\"), "C:/");
        assert_eq!(normalize_lexical(r"\\?\D:\work"), "D:/work");
        assert_eq!(normalize_lexical(r"\\?\UNC\srv\share"), "//srv/share");
    }

    #[test]
    fn reported_path_with_other_separators_matches() {
        let p = ScanPath::from_canonical("D:/work/notes");
        assert!(p.matches_reported(r"D:\work\notes"));
        assert!(p.matches_reported("D:/work/notes/"));
        assert!(!p.matches_reported("D:/work/other"));
        assert!(!p.matches_reported(""));
    }

    #[test]
    fn case_handling_follows_platform() {
        let p = ScanPath::from_canonical("/Work/Notes");
        assert_eq!(p.matches_reported("/work/notes"), case_insensitive_fs());
    }

    #[test]
    fn resolve_relative_against_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let p = ScanPath::resolve(Path::new("sub"), dir.path());
        let expected = std::fs::canonicalize(dir.path().join("sub")).unwrap();
        assert_eq!(p.as_str(), normalize_lexical(&expected.to_string_lossy()));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_follows_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let via_link = ScanPath::resolve(&link, dir.path());
        let direct = ScanPath::resolve(&real, dir.path());
        assert_eq!(via_link, direct);
    }

    #[test]
    fn missing_path_is_kept_lexically() {
        let p = ScanPath::resolve(Path::new("/definitely/not/here/"), Path::new("/"));
        assert!(p.as_str().ends_with("/definitely/not/here"));
    }
}
