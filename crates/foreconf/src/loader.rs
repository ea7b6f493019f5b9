//! `apps.json` parsing.
//!
//! ```json
//! { "Apps": [
//!     { "App": "CustomA", "Bin": "/opt/apps/custom_a" },
//!     { "App": "CustomB", "Bin": "/opt/apps/custom_b", "View": 30001 }
//! ] }
//! ```
//!
//! Invalid entries are warned about and skipped; a duplicate `App` keeps
//! its first position but the last bin (and view) wins. An empty result
//! is an error, the manager cannot run without templates.

use std::path::Path;

use tracing::{info, warn};

use crate::ConfigError;

/// One installed-app template as declared by the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Type name, the identity of the template.
    pub app: String,
    /// Path to the executable to spawn.
    pub bin: String,
    /// Parameter id where the app publishes its view port, when it has a
    /// browser view at all.
    pub view: Option<i32>,
}

/// Read and parse a manifest file.
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestEntry>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    parse_manifest(&contents)
}

/// Parse manifest JSON text.
pub fn parse_manifest(contents: &str) -> Result<Vec<ManifestEntry>, ConfigError> {
    let doc: serde_json::Value = serde_json::from_str(contents)?;
    let apps = doc
        .get("Apps")
        .and_then(|v| v.as_array())
        .ok_or(ConfigError::MissingApps)?;

    let mut entries: Vec<ManifestEntry> = Vec::with_capacity(apps.len());
    for node in apps {
        let Some(node) = node.as_object() else {
            warn!("app node is not an object");
            continue;
        };
        let (Some(app), Some(bin)) = (
            node.get("App").and_then(|v| v.as_str()),
            node.get("Bin").and_then(|v| v.as_str()),
        ) else {
            warn!("app node has no \"App\" or \"Bin\" string");
            continue;
        };
        let view = match node.get("View") {
            None => None,
            Some(view) => match view.as_u64() {
                Some(id) => Some(id as i32),
                None => {
                    warn!(app, "\"View\" is not an unsigned integer, ignored");
                    None
                }
            },
        };

        match entries.iter_mut().find(|entry| entry.app == app) {
            None => {
                match view {
                    Some(view) => info!(app, bin, view, "app registered"),
                    None => info!(app, bin, "app registered"),
                }
                entries.push(ManifestEntry {
                    app: app.to_string(),
                    bin: bin.to_string(),
                    view,
                });
            }
            Some(existing) => {
                if existing.bin != bin {
                    info!(app, from = existing.bin, to = bin, "bin path changed");
                    existing.bin = bin.to_string();
                }
                if let Some(view) = view {
                    if existing.view != Some(view) {
                        info!(app, view, "view port parameter changed");
                        existing.view = Some(view);
                    }
                }
            }
        }
    }

    if entries.is_empty() {
        return Err(ConfigError::Empty);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn happy_path() {
        let entries = parse_manifest(
            r#"{ "Apps": [
                { "App": "CustomA", "Bin": "/opt/a" },
                { "App": "CustomB", "Bin": "/opt/b", "View": 30001 }
            ] }"#,
        )
        .unwrap();
        assert_eq!(
            entries,
            vec![
                ManifestEntry {
                    app: "CustomA".into(),
                    bin: "/opt/a".into(),
                    view: None,
                },
                ManifestEntry {
                    app: "CustomB".into(),
                    bin: "/opt/b".into(),
                    view: Some(30001),
                },
            ]
        );
    }

    #[test]
    fn duplicate_app_last_bin_wins() {
        let entries = parse_manifest(
            r#"{ "Apps": [
                { "App": "X", "Bin": "/old" },
                { "App": "X", "Bin": "/new", "View": 5 }
            ] }"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].bin, "/new");
        assert_eq!(entries[0].view, Some(5));
    }

    #[test]
    fn invalid_entries_are_skipped() {
        let entries = parse_manifest(
            r#"{ "Apps": [
                "not an object",
                { "App": "NoBin" },
                { "Bin": "/no-app" },
                { "App": "Good", "Bin": "/g", "View": "oops" }
            ] }"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].app, "Good");
        assert_eq!(entries[0].view, None);
    }

    #[test]
    fn empty_manifest_is_an_error() {
        assert!(matches!(
            parse_manifest(r#"{ "Apps": [] }"#),
            Err(ConfigError::Empty)
        ));
        assert!(matches!(
            parse_manifest(r#"{ "Apps": [ { "App": "X" } ] }"#),
            Err(ConfigError::Empty)
        ));
    }

    #[test]
    fn missing_apps_array_is_an_error() {
        assert!(matches!(
            parse_manifest(r#"{ "apps": [] }"#),
            Err(ConfigError::MissingApps)
        ));
        assert!(matches!(
            parse_manifest(r#"{ "Apps": 3 }"#),
            Err(ConfigError::MissingApps)
        ));
        assert!(matches!(parse_manifest("nonsense"), Err(ConfigError::Json(_))));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apps.json");
        std::fs::write(&path, r#"{ "Apps": [ { "App": "A", "Bin": "/a" } ] }"#).unwrap();
        let entries = load_manifest(&path).unwrap();
        assert_eq!(entries[0].app, "A");

        let missing = dir.path().join("nope.json");
        assert!(matches!(
            load_manifest(&missing),
            Err(ConfigError::FileRead { .. })
        ));
    }
}
