//! foreproto - Wire protocol for the Foreman process gateway
//!
//! Everything that travels between the manager and its workers is a frame:
//! a fixed 8-byte header (cipher + total length, both little-endian u32)
//! followed by a cipher-specific body. Three binary ciphers are defined
//! (parameters, action, metadata); anything that looks like ASCII text is
//! handed to the HTTP parser instead, so a single listening socket can
//! serve both the browser control plane and the worker fleet.
//!
//! The crate is deliberately I/O-free. [`codec::FrameReader`] is an
//! incremental state machine fed raw bytes; the connection server owns the
//! sockets and drives it.

pub mod action;
pub mod codec;
pub mod frame;
pub mod http;
pub mod metadata;
pub mod params;
pub mod value;

pub use action::Action;
pub use codec::{Event, FrameReader};
pub use frame::{
    Frame, FrameError, CIPHER_ACTION, CIPHER_HTTP, CIPHER_METADATA, CIPHER_PARAMETERS, HEADER_LEN,
};
pub use http::{HttpRequest, HttpResponse};
pub use metadata::{coerce_json, AppMetadata};
pub use params::{ParameterSet, WorkerState, PARAM_LIFECYCLE_STATE, PARAM_LISTEN_PORT};
pub use value::{ColumnSchema, Duration, ScalarType, TableData, Timer, Value};
