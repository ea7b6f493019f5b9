//! Worker process spawning and reaping.
//!
//! A worker is launched as `/bin/bash -c "<bin> '<json>'"` in its own
//! session with descriptors >= 3 closed, so nothing of the manager's
//! leaks into it. Exits are observed by a per-child monitor task that
//! forwards a death event over a channel; a single reaper task owned by
//! the manager consumes the channel and runs the pending-record fan-out.
//! Nothing ever runs in signal context.

use std::net::Ipv4Addr;

use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Io(#[from] std::io::Error),
    #[error("spawned worker has no pid")]
    NoPid,
}

/// A child process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeathEvent {
    pub port: u16,
    pub pid: u32,
    pub exit_code: Option<i32>,
}

/// Everything a worker needs on its command line, rendered as one JSON
/// argument (all values as strings).
#[derive(Debug, Clone)]
pub struct WorkerBlob {
    pub name: String,
    pub ip: Ipv4Addr,
    pub port: u16,
    pub manager_port: u16,
    pub parent_path: String,
    pub log_level: i16,
    pub log_in_console: bool,
    pub log_in_file: bool,
    pub separate_days_logging: bool,
}

impl WorkerBlob {
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "name": self.name,
            "ip": self.ip.to_string(),
            "port": self.port.to_string(),
            "managerPort": self.manager_port.to_string(),
            "parentPath": self.parent_path,
            "logLevel": self.log_level.to_string(),
            "logInConsole": self.log_in_console.to_string(),
            "logInFile": self.log_in_file.to_string(),
            "separateDaysLogging": self.separate_days_logging.to_string(),
        })
        .to_string()
    }
}

pub struct Supervisor {
    deaths: mpsc::UnboundedSender<DeathEvent>,
}

impl Supervisor {
    /// Returns the supervisor and the receiving end for the reaper task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeathEvent>) {
        let (deaths, rx) = mpsc::unbounded_channel();
        (Self { deaths }, rx)
    }

    /// Spawn a worker and arm its monitor. Returns the pid.
    pub fn spawn_worker(&self, bin: &str, port: u16, blob: &WorkerBlob) -> Result<u32, SpawnError> {
        let command_line = format!("{} '{}'", bin, blob.to_json());
        debug!(bin, port, "spawning worker");

        let mut command = Command::new("/bin/bash");
        command.arg("-c").arg(&command_line);
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                let max = libc::sysconf(libc::_SC_OPEN_MAX);
                let max = if max > 0 { max as i32 } else { 1024 };
                for fd in 3..max {
                    // EBADF for never-opened descriptors is expected.
                    libc::close(fd);
                }
                Ok(())
            });
        }

        let mut child = command.spawn()?;
        let pid = child.id().ok_or(SpawnError::NoPid)?;
        info!(bin, port, pid, "worker created");

        let deaths = self.deaths.clone();
        tokio::spawn(async move {
            let exit_code = match child.wait().await {
                Ok(status) => {
                    info!(port, pid, code = status.code(), "worker terminated");
                    status.code()
                }
                Err(err) => {
                    warn!(port, pid, %err, "wait for worker failed");
                    None
                }
            };
            let _ = deaths.send(DeathEvent {
                port,
                pid,
                exit_code,
            });
        });
        Ok(pid)
    }
}

/// True when `/bin/bash` is present and executable; the manager cannot
/// spawn anything without it.
pub fn bash_available() -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata("/bin/bash")
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Default log parent directory for a worker: its bin path up to a
/// trailing `build/` component, else the bin's parent directory.
pub fn derive_parent_path(bin: &str) -> Option<String> {
    if let Some(pos) = bin.rfind("build/") {
        return Some(bin[..pos].to_string());
    }
    bin.rfind('/').map(|pos| bin[..pos].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn blob_renders_all_values_as_strings() {
        let blob = WorkerBlob {
            name: "CustomA".into(),
            ip: Ipv4Addr::LOCALHOST,
            port: 3500,
            manager_port: 1134,
            parent_path: "/opt/apps/".into(),
            log_level: 1,
            log_in_console: false,
            log_in_file: true,
            separate_days_logging: true,
        };
        let parsed: serde_json::Value = serde_json::from_str(&blob.to_json()).unwrap();
        assert_eq!(parsed["name"], "CustomA");
        assert_eq!(parsed["ip"], "127.0.0.1");
        assert_eq!(parsed["port"], "3500");
        assert_eq!(parsed["managerPort"], "1134");
        assert_eq!(parsed["logLevel"], "1");
        assert_eq!(parsed["logInFile"], "true");
        assert_eq!(parsed["separateDaysLogging"], "true");
    }

    #[test]
    fn parent_path_derivation() {
        assert_eq!(
            derive_parent_path("/opt/apps/build/custom_a"),
            Some("/opt/apps/".to_string())
        );
        assert_eq!(
            derive_parent_path("/opt/apps/custom_a"),
            Some("/opt/apps".to_string())
        );
        assert_eq!(derive_parent_path("custom_a"), None);
    }

    #[tokio::test]
    async fn spawn_reports_death() {
        let (supervisor, mut deaths) = Supervisor::new();
        let blob = WorkerBlob {
            name: "true".into(),
            ip: Ipv4Addr::LOCALHOST,
            port: 3999,
            manager_port: 1134,
            parent_path: "/tmp".into(),
            log_level: 1,
            log_in_console: false,
            log_in_file: false,
            separate_days_logging: true,
        };
        let pid = supervisor.spawn_worker("/bin/true", 3999, &blob).unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), deaths.recv())
            .await
            .expect("death event in time")
            .expect("channel open");
        assert_eq!(event.port, 3999);
        assert_eq!(event.pid, pid);
        assert_eq!(event.exit_code, Some(0));
    }
}
