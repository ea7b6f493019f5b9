//! Installed templates and created instances.
//!
//! Templates are keyed by the hash of their type name and outlive every
//! instance; instances are keyed by listening port and reference their
//! template by hash, so nothing holds a pointer across the two tables.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use foreconf::ManifestEntry;
use forenet::ConnId;
use foreproto::AppMetadata;

/// Process-lifetime hash of a type-name string.
pub fn type_hash(type_name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    type_name.hash(&mut hasher);
    hasher.finish()
}

/// An installed app template. Metadata stays empty until the first
/// instance delivers it.
#[derive(Debug)]
pub struct InstalledApp {
    pub type_name: String,
    pub bin: String,
    pub view_port_parameter: Option<i32>,
    pub metadata: Option<AppMetadata>,
}

impl InstalledApp {
    fn from_entry(entry: ManifestEntry) -> Self {
        Self {
            type_name: entry.app,
            bin: entry.bin,
            view_port_parameter: entry.view,
            metadata: None,
        }
    }
}

/// A created app instance. `connection` stays 0 until the worker's first
/// parameters frame identifies it.
#[derive(Debug, Clone)]
pub struct CreatedApp {
    pub type_hash: u64,
    pub type_name: String,
    pub pid: u32,
    pub created: DateTime<Utc>,
    pub connection: ConnId,
}

/// Both tables, each under its own lock. Lock order when both are held:
/// `created` before `installed`.
pub struct Registry {
    installed: Mutex<HashMap<u64, InstalledApp>>,
    created: Mutex<BTreeMap<u16, CreatedApp>>,
}

impl Registry {
    pub fn new(entries: Vec<ManifestEntry>) -> Self {
        let installed = entries
            .into_iter()
            .map(|entry| (type_hash(&entry.app), InstalledApp::from_entry(entry)))
            .collect();
        Self {
            installed: Mutex::new(installed),
            created: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_installed<R>(&self, f: impl FnOnce(&HashMap<u64, InstalledApp>) -> R) -> R {
        f(&self.installed.lock().unwrap())
    }

    pub fn with_installed_mut<R>(&self, f: impl FnOnce(&mut HashMap<u64, InstalledApp>) -> R) -> R {
        f(&mut self.installed.lock().unwrap())
    }

    pub fn with_created<R>(&self, f: impl FnOnce(&BTreeMap<u16, CreatedApp>) -> R) -> R {
        f(&self.created.lock().unwrap())
    }

    pub fn with_created_mut<R>(&self, f: impl FnOnce(&mut BTreeMap<u16, CreatedApp>) -> R) -> R {
        f(&mut self.created.lock().unwrap())
    }

    pub fn installed_bin(&self, hash: u64) -> Option<(String, String)> {
        self.with_installed(|installed| {
            installed
                .get(&hash)
                .map(|app| (app.type_name.clone(), app.bin.clone()))
        })
    }

    /// Raw metadata text of a template, when already delivered.
    pub fn metadata_text(&self, hash: u64) -> Option<String> {
        self.with_installed(|installed| {
            installed
                .get(&hash)
                .and_then(|app| app.metadata.as_ref())
                .map(|meta| meta.raw().to_string())
        })
    }

    pub fn created_connection(&self, port: u16) -> Option<ConnId> {
        self.with_created(|created| created.get(&port).map(|app| app.connection))
    }

    pub fn any_instance_of(&self, hash: u64) -> bool {
        self.with_created(|created| created.values().any(|app| app.type_hash == hash))
    }

    /// Instance whose worker speaks on `connection`.
    pub fn port_of_connection(&self, connection: ConnId) -> Option<(u16, u64)> {
        self.with_created(|created| {
            created
                .iter()
                .find(|(_, app)| app.connection == connection)
                .map(|(port, app)| (*port, app.type_hash))
        })
    }

    /// Clear both tables (manager pause).
    pub fn clear(&self) {
        self.created.lock().unwrap().clear();
        self.installed.lock().unwrap().clear();
    }

    /// Replace the installed table from a re-read manifest.
    pub fn reload(&self, entries: Vec<ManifestEntry>) {
        let mut installed = self.installed.lock().unwrap();
        *installed = entries
            .into_iter()
            .map(|entry| (type_hash(&entry.app), InstalledApp::from_entry(entry)))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        Registry::new(vec![
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
        ])
    }

    #[test]
    fn hash_is_stable_per_name() {
        assert_eq!(type_hash("CustomA"), type_hash("CustomA"));
        assert_ne!(type_hash("CustomA"), type_hash("CustomB"));
    }

    #[test]
    fn installed_lookup() {
        let registry = registry();
        let hash = type_hash("CustomA");
        assert_eq!(
            registry.installed_bin(hash),
            Some(("CustomA".into(), "/opt/a".into()))
        );
        assert_eq!(registry.metadata_text(hash), None);
        assert_eq!(registry.installed_bin(type_hash("Nope")), None);
    }

    #[test]
    fn created_instances_by_port_and_connection() {
        let registry = registry();
        let hash = type_hash("CustomA");
        registry.with_created_mut(|created| {
            created.insert(
                3500,
                CreatedApp {
                    type_hash: hash,
                    type_name: "CustomA".into(),
                    pid: 101,
                    created: Utc::now(),
                    connection: 0,
                },
            );
        });
        assert_eq!(registry.created_connection(3500), Some(0));
        assert!(registry.any_instance_of(hash));
        assert_eq!(registry.port_of_connection(7), None);

        registry.with_created_mut(|created| {
            created.get_mut(&3500).unwrap().connection = 7;
        });
        assert_eq!(registry.port_of_connection(7), Some((3500, hash)));
    }
}
