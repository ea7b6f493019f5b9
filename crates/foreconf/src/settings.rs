//! Runtime settings: everything the manager needs besides the manifest.
//!
//! The manager takes no command-line flags. It anchors itself to its own
//! executable directory: `apps.json` is read from there and `web/` under
//! it is the static root. `FOREMAN_*` environment variables override the
//! derived values.

use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::warn;

use crate::ConfigError;

/// The control-plane port every deployment shares.
pub const DEFAULT_LISTEN_PORT: u16 = 1134;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Control-plane bind address.
    pub listen: SocketAddr,
    /// Directory served for `/`, css, js and image routes.
    pub web_root: PathBuf,
    /// The `apps.json` manifest location.
    pub manifest_path: PathBuf,
}

impl Settings {
    /// Derive settings from the executable directory plus `FOREMAN_LISTEN`,
    /// `FOREMAN_WEB_ROOT` and `FOREMAN_APPS` overrides.
    pub fn discover() -> Result<Self, ConfigError> {
        let exe_dir = std::env::current_exe()
            .and_then(|exe| {
                exe.parent()
                    .map(PathBuf::from)
                    .ok_or_else(|| std::io::Error::other("executable has no parent directory"))
            })
            .map_err(ConfigError::ExecutableDir)?;
        Ok(Self::from_dir(&exe_dir))
    }

    /// Settings anchored at an explicit directory, environment overrides
    /// applied.
    pub fn from_dir(dir: &std::path::Path) -> Self {
        let listen = match std::env::var("FOREMAN_LISTEN") {
            Ok(raw) => match raw.parse() {
                Ok(addr) => addr,
                Err(_) => {
                    warn!(%raw, "FOREMAN_LISTEN is not a socket address, using the default");
                    default_listen()
                }
            },
            Err(_) => default_listen(),
        };
        let web_root = std::env::var_os("FOREMAN_WEB_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| dir.join("web"));
        let manifest_path = std::env::var_os("FOREMAN_APPS")
            .map(PathBuf::from)
            .unwrap_or_else(|| dir.join("apps.json"));
        Self {
            listen,
            web_root,
            manifest_path,
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn derived_from_directory() {
        // Environment overrides are process-global; keep to the derived
        // paths here and rely on the absence of FOREMAN_* in the test env.
        let settings = Settings::from_dir(std::path::Path::new("/opt/foreman"));
        assert_eq!(settings.web_root, PathBuf::from("/opt/foreman/web"));
        assert_eq!(settings.manifest_path, PathBuf::from("/opt/foreman/apps.json"));
        assert_eq!(settings.listen.port(), DEFAULT_LISTEN_PORT);
    }
}
