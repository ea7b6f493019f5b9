//! foreman - Process-supervision gateway.
//!
//! One manager process spawns and supervises a fleet of worker apps. A
//! browser UI talks JSON-over-HTTP to the manager; workers speak the
//! framed binary protocol back to it, both on the same listening port.
//! The manager correlates every asynchronous HTTP request with the worker
//! message (or child death) that answers it, coalescing concurrent
//! callers so each worker sees at most one RPC per action at a time.

pub mod api;
pub mod engine;
pub mod manager;
pub mod params;
pub mod registry;
pub mod responses;
pub mod supervisor;

pub use engine::{Carrier, Engine, Transport};
pub use manager::Manager;
pub use registry::{type_hash, CreatedApp, InstalledApp, Registry};
pub use supervisor::{DeathEvent, Supervisor};
