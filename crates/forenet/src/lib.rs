//! forenet - Concurrent TCP connection server for the Foreman gateway.
//!
//! One [`Server`] owns a listening socket, the registries of inbound and
//! outbound connections, and the admission limits. Every open connection
//! gets a reader task (frames are dispatched inline, so per-connection
//! ordering holds and a handler runs on at most one task at a time per
//! connection) and a writer task fed by a channel, so no caller lock is
//! ever held across a blocking send.
//!
//! Connections are identified by stable integer ids, not socket handles:
//! an outbound connection flagged for reconnection keeps its id across a
//! socket death.

pub mod config;
pub mod handler;
pub mod server;

pub use config::ServerConfig;
pub use handler::ConnectionHandler;
pub use server::{ConnId, NetError, Server, ServerState};
