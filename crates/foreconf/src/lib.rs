//! foreconf - Manifest loading and settings for the Foreman gateway.
//!
//! The manager is configured by exactly one file: `apps.json` next to its
//! own executable, listing the app templates it may spawn. Everything
//! else (listen address, web static root) is derived from the executable
//! directory, with `FOREMAN_*` environment variables as overrides for
//! tests and unusual deployments.

mod loader;
mod settings;

pub use loader::{load_manifest, parse_manifest, ManifestEntry};
pub use settings::Settings;

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest has no \"Apps\" array")]
    MissingApps,
    #[error("manifest registered no usable apps")]
    Empty,
    #[error("cannot locate the executable directory: {0}")]
    ExecutableDir(std::io::Error),
}
