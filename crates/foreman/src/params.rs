//! The manager's own parameters, exposed over the binary protocol like
//! any worker's: a `ParametersRequest` gets a snapshot, an `ActionModify`
//! mutates the mutable subset live.
//!
//! Ids: `1001` web sources path; `1000001..1000005` server tunables;
//! `1000006..1000009` const server facts (state, connection limit,
//! listening ip and port). `2000002` reports the manager's lifecycle the
//! same way workers report theirs.

use std::path::Path;
use std::sync::Mutex;

use forenet::Server;
use foreproto::{ParameterSet, Value, WorkerState, PARAM_LIFECYCLE_STATE, PARAM_LISTEN_PORT};
use tracing::warn;

pub const PARAM_WEB_SOURCES_PATH: u64 = 1001;
pub const PARAM_SECONDS_BETWEEN_TRY_TO_CONNECT: u64 = 1_000_001;
pub const PARAM_LIMIT_CONNECT_ATTEMPTS: u64 = 1_000_002;
pub const PARAM_MAX_CONNECTIONS_ONE_IP: u64 = 1_000_003;
pub const PARAM_RECV_BUFFER_SIZE: u64 = 1_000_004;
pub const PARAM_RECV_BUFFER_SIZE_LIMIT: u64 = 1_000_005;
pub const PARAM_SERVER_STATE: u64 = 1_000_006;
pub const PARAM_SOMAXCONN: u64 = 1_000_007;
pub const PARAM_LISTENING_IP: u64 = 1_000_008;

pub struct OwnParameters {
    web_sources_path: Mutex<String>,
}

impl OwnParameters {
    pub fn new(web_root: &Path) -> Self {
        Self {
            web_sources_path: Mutex::new(web_root.to_string_lossy().into_owned()),
        }
    }

    pub fn web_sources_path(&self) -> String {
        self.web_sources_path.lock().unwrap().clone()
    }

    /// Current values, const facts included.
    pub fn snapshot(&self, server: &Server, paused: bool) -> ParameterSet {
        let config = server.config();
        let lifecycle = if paused {
            WorkerState::Paused
        } else {
            WorkerState::Running
        };
        let mut params = ParameterSet::new();
        params
            .set(
                PARAM_WEB_SOURCES_PATH,
                Value::String(self.web_sources_path()),
            )
            .set(
                PARAM_SECONDS_BETWEEN_TRY_TO_CONNECT,
                Value::Uint32(config.seconds_between_try_to_connect()),
            )
            .set(
                PARAM_LIMIT_CONNECT_ATTEMPTS,
                Value::Uint64(config.limit_connect_attempts() as u64),
            )
            .set(
                PARAM_MAX_CONNECTIONS_ONE_IP,
                Value::Uint64(config.max_connections_one_ip() as u64),
            )
            .set(
                PARAM_RECV_BUFFER_SIZE,
                Value::Uint64(config.recv_buffer_size() as u64),
            )
            .set(
                PARAM_RECV_BUFFER_SIZE_LIMIT,
                Value::Uint64(config.recv_buffer_size_limit() as u64),
            )
            .set(PARAM_SERVER_STATE, Value::Int16(server.state() as i16))
            .set(PARAM_SOMAXCONN, Value::Uint64(config.somaxconn() as u64))
            .set(
                PARAM_LISTENING_IP,
                Value::String(
                    server
                        .listen_addr()
                        .map(|addr| addr.ip().to_string())
                        .unwrap_or_default(),
                ),
            )
            .set(PARAM_LISTEN_PORT, Value::Uint16(server.listen_port()))
            .set(PARAM_LIFECYCLE_STATE, Value::Int16(lifecycle as i16));
        params
    }

    /// Apply an `ActionModify` addressed to the manager itself. The web
    /// sources path may not change while the manager is running.
    pub fn apply_modify(&self, server: &Server, running: bool, update: &ParameterSet) {
        for (id, value) in update.iter() {
            match *id {
                PARAM_WEB_SOURCES_PATH => {
                    if running {
                        warn!("web sources path change is interrupted while running");
                        continue;
                    }
                    if let Value::String(path) = value {
                        *self.web_sources_path.lock().unwrap() = path.clone();
                    }
                }
                PARAM_SECONDS_BETWEEN_TRY_TO_CONNECT => match unsigned(value) {
                    Some(v) => server.config().set_seconds_between_try_to_connect(v as u32),
                    None => warn!(id, "update has an unusable type"),
                },
                PARAM_LIMIT_CONNECT_ATTEMPTS => match unsigned(value) {
                    Some(v) => server.config().set_limit_connect_attempts(v as usize),
                    None => warn!(id, "update has an unusable type"),
                },
                PARAM_MAX_CONNECTIONS_ONE_IP => match unsigned(value) {
                    Some(v) => server.config().set_max_connections_one_ip(v as usize),
                    None => warn!(id, "update has an unusable type"),
                },
                PARAM_RECV_BUFFER_SIZE => match unsigned(value) {
                    Some(v) => server.config().set_recv_buffer_size(v as usize),
                    None => warn!(id, "update has an unusable type"),
                },
                PARAM_RECV_BUFFER_SIZE_LIMIT => match unsigned(value) {
                    Some(v) => server.config().set_recv_buffer_size_limit(v as usize),
                    None => warn!(id, "update has an unusable type"),
                },
                other => warn!(id = other, "modify for an unknown or const parameter"),
            }
        }
    }
}

fn unsigned(value: &Value) -> Option<u64> {
    match value {
        Value::Uint8(v) => Some(u64::from(*v)),
        Value::Uint16(v) => Some(u64::from(*v)),
        Value::Uint32(v) => Some(u64::from(*v)),
        Value::Uint64(v) => Some(*v),
        Value::Int32(v) if *v >= 0 => Some(*v as u64),
        Value::Int64(v) if *v >= 0 => Some(*v as u64),
        _ => None,
    }
}
