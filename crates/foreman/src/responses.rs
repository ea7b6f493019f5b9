//! Control-plane response bodies.
//!
//! Every API answer is HTTP 200; the `status` field inside the body is
//! authoritative. The shapes here are the complete response vocabulary of
//! the manager.

use bytes::Bytes;
use foreproto::{HttpResponse, ParameterSet};

pub fn negative(message: &str) -> Bytes {
    HttpResponse::negative(message)
}

/// `{"status":true}`
pub fn ok() -> Bytes {
    HttpResponse::json(&serde_json::json!({ "status": true }))
}

/// `{"status":true,"port":N}` for a successful spawn.
pub fn created(port: u16) -> Bytes {
    HttpResponse::json(&serde_json::json!({ "status": true, "port": port }))
}

/// `{"status":true,"result":B}` for a completed pause/run action.
pub fn action_result(result: bool) -> Bytes {
    HttpResponse::json(&serde_json::json!({ "status": true, "result": result }))
}

/// `{"status":false}` for pause/run callers whose worker died first.
pub fn action_result_failed() -> Bytes {
    HttpResponse::json(&serde_json::json!({ "status": false }))
}

/// `{"status":true,"parameters":{…}}` for a parameters snapshot.
pub fn parameters(params: &ParameterSet) -> Bytes {
    HttpResponse::json(&serde_json::json!({ "status": true, "parameters": params.to_json() }))
}

/// `{"status":true,"metadata":…}` with the worker's document inlined
/// verbatim.
pub fn metadata(raw: &str) -> Bytes {
    HttpResponse::raw_json(&format!("{{\"status\":true,\"metadata\":{}}}", raw))
}

/// Terminal answer for non-delete records when the manager pauses.
pub fn manager_paused() -> Bytes {
    negative("Manager is paused")
}

/// Terminal answer for port-keyed records when the worker died.
pub fn app_terminated() -> Bytes {
    negative("App is terminated")
}
