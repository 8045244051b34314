use std::path::Path;

use anyhow::Context;
use serde_json::Value;

const NEXT_DEV: &str = "next dev";

/// Points a `next dev` script at `port`. Returns false when there is nothing
/// to change (no `scripts.dev`, a non-Next script, or already pinned).
pub fn pin_dev_port(doc: &mut Value, port: u16) -> bool {
    let Some(dev) = doc
        .get_mut("scripts")
        .and_then(|s| s.get_mut("dev"))
    else {
        return false;
    };
    let Some(current) = dev.as_str() else {
        return false;
    };
    if !current.contains(NEXT_DEV) {
        return false;
    }
    let wanted = format!("{NEXT_DEV} -p {port}");
    if current == wanted {
        return false;
    }
    *dev = Value::String(wanted);
    true
}

/// Rewrites `package.json` in place, keeping key order and two-space indent.
pub fn pin_dev_port_in_file(path: &Path, port: u16) -> anyhow::Result<bool> {
    let text = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut doc: Value =
        serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
    if !pin_dev_port(&mut doc, port) {
        return Ok(false);
    }
    let mut out = serde_json::to_string_pretty(&doc).context("serialize package.json")?;
    out.push('\n');
    std::fs::write(path, out).with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_dev_script_gets_port() {
        let mut doc = serde_json::json!({"scripts": {"dev": "next dev --turbo", "build": "next build"}});
        assert!(pin_dev_port(&mut doc, 3005));
        assert_eq!(doc["scripts"]["dev"], "next dev -p 3005");
        assert_eq!(doc["scripts"]["build"], "next build");
        assert!(!pin_dev_port(&mut doc, 3005));
    }

    #[test]
    fn other_dev_scripts_are_left_alone() {
        let mut doc = serde_json::json!({"scripts": {"dev": "vite"}});
        assert!(!pin_dev_port(&mut doc, 3005));
        let mut doc = serde_json::json!({"name": "x"});
        assert!(!pin_dev_port(&mut doc, 3005));
    }

    #[test]
    fn file_rewrite_preserves_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(
            &path,
            r#"{"name":"app","version":"1.0.0","scripts":{"dev":"next dev","start":"next start"},"dependencies":{}}"#,
        )
        .unwrap();

        assert!(pin_dev_port_in_file(&path, 3100).unwrap());

        let text = std::fs::read_to_string(&path).unwrap();
        let name_at = text.find("\"name\"").unwrap();
        let scripts_at = text.find("\"scripts\"").unwrap();
        let deps_at = text.find("\"dependencies\"").unwrap();
        assert!(name_at < scripts_at && scripts_at < deps_at);
        assert!(text.contains("\"dev\": \"next dev -p 3100\""));
        assert!(text.contains("\n  \"name\""));
    }
}
