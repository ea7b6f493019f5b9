//! Manager entry point.
//!
//! No flags: the manager anchors itself to its executable directory,
//! reads `apps.json` from there, serves `web/` as the static root, and
//! listens on 0.0.0.0:1134. See `foreconf::Settings` for the `FOREMAN_*`
//! overrides.

use anyhow::{bail, Context, Result};
use foreconf::{load_manifest, Settings};
use forenet::{Server, ServerConfig};
use foreman::{supervisor, Manager};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if !supervisor::bash_available() {
        bail!("can't access /bin/bash, terminating");
    }

    let settings = Settings::discover().context("failed to derive settings")?;
    let entries =
        load_manifest(&settings.manifest_path).context("failed to load the app manifest")?;
    info!(
        manifest = %settings.manifest_path.display(),
        apps = entries.len(),
        "manifest applied"
    );

    let config = ServerConfig::default();
    // Boot override: the browser UI polls aggressively, never starve it.
    config.set_max_connections_one_ip(99_999);

    let server = Server::new(config);
    let (manager, deaths) = Manager::new(server.clone(), &settings, entries);
    server.bind_handler(manager.clone());
    let bound = server
        .start(settings.listen)
        .context("failed to start the server")?;
    info!(%bound, "control plane is listening");
    manager.spawn_reaper(deaths);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install the SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm.recv() => info!("termination requested"),
    }

    manager.stop();
    Ok(())
}
