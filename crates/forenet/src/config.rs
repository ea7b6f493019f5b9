//! Live-mutable server tunables.
//!
//! Everything here except `somaxconn` can be changed while the server is
//! running; new values apply to subsequent connections and connect
//! attempts. The listen address is not part of this set, it is fixed at
//! `start`.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use foreproto::codec::{DEFAULT_RECV_BUFFER_SIZE, DEFAULT_RECV_BUFFER_SIZE_LIMIT};

pub const DEFAULT_SECONDS_BETWEEN_TRY_TO_CONNECT: u32 = 1;
pub const DEFAULT_LIMIT_CONNECT_ATTEMPTS: usize = 1;
pub const DEFAULT_MAX_CONNECTIONS_ONE_IP: usize = 99_999;
pub const DEFAULT_SOMAXCONN: usize = 4096;

#[derive(Debug)]
pub struct ServerConfig {
    seconds_between_try_to_connect: AtomicU32,
    limit_connect_attempts: AtomicUsize,
    max_connections_one_ip: AtomicUsize,
    recv_buffer_size: AtomicUsize,
    recv_buffer_size_limit: AtomicUsize,
    somaxconn: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SOMAXCONN)
    }
}

impl ServerConfig {
    pub fn new(somaxconn: usize) -> Self {
        Self {
            seconds_between_try_to_connect: AtomicU32::new(DEFAULT_SECONDS_BETWEEN_TRY_TO_CONNECT),
            limit_connect_attempts: AtomicUsize::new(DEFAULT_LIMIT_CONNECT_ATTEMPTS),
            max_connections_one_ip: AtomicUsize::new(DEFAULT_MAX_CONNECTIONS_ONE_IP),
            recv_buffer_size: AtomicUsize::new(DEFAULT_RECV_BUFFER_SIZE),
            recv_buffer_size_limit: AtomicUsize::new(DEFAULT_RECV_BUFFER_SIZE_LIMIT),
            somaxconn,
        }
    }

    pub fn seconds_between_try_to_connect(&self) -> u32 {
        self.seconds_between_try_to_connect.load(Ordering::Relaxed)
    }

    pub fn set_seconds_between_try_to_connect(&self, value: u32) {
        self.seconds_between_try_to_connect.store(value, Ordering::Relaxed);
    }

    pub fn limit_connect_attempts(&self) -> usize {
        self.limit_connect_attempts.load(Ordering::Relaxed)
    }

    pub fn set_limit_connect_attempts(&self, value: usize) {
        self.limit_connect_attempts.store(value, Ordering::Relaxed);
    }

    pub fn max_connections_one_ip(&self) -> usize {
        self.max_connections_one_ip.load(Ordering::Relaxed)
    }

    pub fn set_max_connections_one_ip(&self, value: usize) {
        self.max_connections_one_ip.store(value, Ordering::Relaxed);
    }

    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_recv_buffer_size(&self, value: usize) {
        self.recv_buffer_size.store(value, Ordering::Relaxed);
    }

    pub fn recv_buffer_size_limit(&self) -> usize {
        self.recv_buffer_size_limit.load(Ordering::Relaxed)
    }

    pub fn set_recv_buffer_size_limit(&self, value: usize) {
        self.recv_buffer_size_limit.store(value, Ordering::Relaxed);
    }

    pub fn somaxconn(&self) -> usize {
        self.somaxconn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.seconds_between_try_to_connect(), 1);
        assert_eq!(config.limit_connect_attempts(), 1);
        assert_eq!(config.max_connections_one_ip(), 99_999);
        assert_eq!(config.recv_buffer_size(), 3);
        assert_eq!(config.recv_buffer_size_limit(), 1024);
    }

    #[test]
    fn live_mutation() {
        let config = ServerConfig::default();
        config.set_max_connections_one_ip(2);
        config.set_recv_buffer_size_limit(4096);
        assert_eq!(config.max_connections_one_ip(), 2);
        assert_eq!(config.recv_buffer_size_limit(), 4096);
    }
}
