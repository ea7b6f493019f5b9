//! The dispatch seam between the connection server and whatever speaks
//! the protocols.

use async_trait::async_trait;
use foreproto::{Frame, HttpRequest};

use crate::server::ConnId;

/// Receives everything a connection produces. Invoked from the owning
/// connection's reader task, one call at a time per connection, in
/// on-wire order.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A complete binary frame, dispatched by cipher.
    async fn handle_frame(&self, connection: ConnId, frame: Frame);

    /// A complete HTTP request from the shared listener.
    async fn handle_http(&self, connection: ConnId, request: HttpRequest);

    /// An outbound connection flagged `reconnect` came back with its id
    /// preserved.
    async fn handle_reconnect(&self, connection: ConnId) {
        let _ = connection;
    }

    /// The connection is gone and will not return.
    async fn handle_disconnect(&self, connection: ConnId) {
        let _ = connection;
    }
}
