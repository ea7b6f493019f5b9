//! The HTTP control plane: static routes for the browser UI and the
//! `/api` endpoint, type-dispatched on the `Type` header.
//!
//! Synchronous requests are answered in place; asynchronous ones
//! (parameters, metadata, pause, run, delete) register a pending record
//! with the correlation engine and produce no bytes here, the engine
//! answers later over the same carrier connection.

use std::net::Ipv4Addr;

use bytes::Bytes;
use chrono::Utc;
use foreproto::{coerce_json, Action, HttpRequest, HttpResponse, ParameterSet};
use forenet::ConnId;
use rand::Rng;
use tracing::{debug, error};

use crate::engine::Carrier;
use crate::manager::Manager;
use crate::registry::{type_hash, CreatedApp};
use crate::responses;
use crate::supervisor::{derive_parent_path, WorkerBlob};

/// Lowest port an instance may listen on; the draw range is
/// `[PORT_FLOOR, 65535)`.
const PORT_FLOOR: u16 = 3000;

/// Give up drawing a free port after this many attempts.
const PORT_DRAW_ATTEMPTS: usize = 50_000;

/// Worker log levels accepted by `createApp`.
const LOG_LEVEL_ERROR: i16 = 0;
const LOG_LEVEL_WARNING: i16 = 1;
const LOG_LEVEL_PROTOCOL: i16 = 4;

pub async fn handle(manager: &Manager, connection: ConnId, request: HttpRequest) {
    let respond = |bytes: Bytes| manager.engine().send(connection, bytes);

    debug!(url = %request.url, method = %request.method, "http request");
    if request.method != "GET" {
        respond(HttpResponse::not_found());
        return;
    }

    if request.url == "/api" {
        dispatch_api(manager, connection, &request);
        return;
    }

    serve_static(manager, connection, &request).await;
}

fn dispatch_api(manager: &Manager, connection: ConnId, request: &HttpRequest) {
    let respond = |bytes: Bytes| manager.engine().send(connection, bytes);
    let negative = |message: String| {
        debug!(%message, "negative response");
        respond(responses::negative(&message));
    };

    let Some(kind) = request.header("Type") else {
        negative("Key by Type is not found".into());
        return;
    };
    debug!(kind, "api request");

    match kind {
        "getInstalledApps" => respond(get_installed_apps(manager)),
        "getCreatedApps" => respond(get_created_apps(manager)),
        "createApp" => respond(create_app(manager, request)),
        "getMetadata" => {
            if let Some(bytes) = get_metadata(manager, connection, request) {
                respond(bytes);
            }
        }
        "getParameters" => {
            if let Some(bytes) = get_parameters(manager, connection, request) {
                respond(bytes);
            }
        }
        "pause" => {
            if let Some(bytes) = pause_or_run(manager, connection, request, true) {
                respond(bytes);
            }
        }
        "run" => {
            if let Some(bytes) = pause_or_run(manager, connection, request, false) {
                respond(bytes);
            }
        }
        "delete" => {
            if let Some(bytes) = delete(manager, connection, request) {
                respond(bytes);
            }
        }
        "modify" => respond(modify(manager, request)),
        other => negative(format!("Key by Type in header is unknown: {other}")),
    }
}

fn get_installed_apps(manager: &Manager) -> Bytes {
    let apps: Vec<serde_json::Value> = manager.registry().with_installed(|installed| {
        installed
            .values()
            .map(|app| match app.view_port_parameter {
                Some(view) => serde_json::json!({ "type": app.type_name, "viewPortParameter": view }),
                None => serde_json::json!({ "type": app.type_name }),
            })
            .collect()
    });
    HttpResponse::json(&serde_json::json!({ "status": true, "apps": apps }))
}

fn get_created_apps(manager: &Manager) -> Bytes {
    let apps: Vec<serde_json::Value> = manager.registry().with_created(|created| {
        created
            .iter()
            .map(|(port, app)| {
                serde_json::json!({
                    "type": app.type_name,
                    "port": port,
                    "pid": app.pid,
                    "creation time": app.created.format("%Y-%m-%d %H:%M:%S").to_string(),
                })
            })
            .collect()
    });
    HttpResponse::json(&serde_json::json!({ "status": true, "apps": apps }))
}

/// Draw a free port uniformly from `[PORT_FLOOR, 65535)`, giving up
/// after a bounded number of attempts.
fn draw_port(created: &std::collections::BTreeMap<u16, CreatedApp>) -> Option<u16> {
    let mut rng = rand::thread_rng();
    for _ in 0..PORT_DRAW_ATTEMPTS {
        let candidate = rng.gen_range(PORT_FLOOR..u16::MAX);
        if !created.contains_key(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Pull and parse the `Port` header shared by every per-instance request.
fn parse_port(request: &HttpRequest) -> Result<u16, String> {
    let Some(raw) = request.header("Port") else {
        return Err("Key 'Port' in header is not found".into());
    };
    if raw.is_empty() {
        return Err("Key 'Port' in header is empty".into());
    }
    raw.parse::<u16>()
        .map_err(|_| format!("Key 'Port' in header cannot be converted properly: {raw}"))
}

fn create_app(manager: &Manager, request: &HttpRequest) -> Bytes {
    let Some(app_type) = request.header("AppType") else {
        return responses::negative("Key 'AppType' in header is not found");
    };
    let hash = type_hash(app_type);
    let Some((type_name, bin)) = manager.registry().installed_bin(hash) else {
        return responses::negative(&format!("Unknown app type: {app_type}"));
    };

    let ip = match request.header("ip") {
        Some(raw) if !raw.is_empty() => match raw.parse::<Ipv4Addr>() {
            Ok(ip) => ip,
            Err(_) => {
                return responses::negative(&format!("Invalid ip in http request: {raw}"));
            }
        },
        _ => Ipv4Addr::LOCALHOST,
    };

    let explicit_port = match request.header("port") {
        Some(raw) if !raw.is_empty() && raw != "0" => match raw.parse::<u16>() {
            Ok(port) => Some(port),
            Err(_) => {
                return responses::negative(&format!("Broken port in http request: {raw}"));
            }
        },
        _ => None,
    };

    let parent_path = match request.header("parentPath") {
        Some(raw) if !raw.is_empty() => raw.to_string(),
        _ => match derive_parent_path(&bin) {
            Some(path) => path,
            None => {
                return responses::negative(&format!("Invalid bin path in http request: {bin}"));
            }
        },
    };

    let log_level = match request.header("logLevel") {
        Some(raw) if !raw.is_empty() => match raw.parse::<i16>() {
            Ok(level) if (LOG_LEVEL_ERROR..=LOG_LEVEL_PROTOCOL).contains(&level) => level,
            Ok(_) | Err(_) => {
                return responses::negative(&format!("Invalid log level in http request: {raw}"));
            }
        },
        _ => LOG_LEVEL_WARNING,
    };

    let log_in_console = request.header("logInConsole") == Some("true");
    let log_in_file = request.header("logInFile") == Some("true");
    let separate_days_logging = request.header("separateDaysLogging") != Some("false");
    let name = request
        .header("name")
        .filter(|raw| !raw.is_empty())
        .unwrap_or(&type_name)
        .to_string();

    // Port selection, spawn, and registration happen under the created
    // lock so two concurrent creates cannot claim one port.
    manager.registry().with_created_mut(|created| {
        let port = match explicit_port {
            Some(port) => {
                if created.contains_key(&port) {
                    return responses::negative(&format!(
                        "App with port: {port} is already created"
                    ));
                }
                port
            }
            None => match draw_port(created) {
                Some(port) => port,
                None => {
                    let message = format!("Cannot generate an unique port for app: {type_name}");
                    error!(%message);
                    return responses::negative(&message);
                }
            },
        };

        let blob = WorkerBlob {
            name: name.clone(),
            ip,
            port,
            manager_port: manager.server().listen_port(),
            parent_path: parent_path.clone(),
            log_level,
            log_in_console,
            log_in_file,
            separate_days_logging,
        };

        match manager.supervisor().spawn_worker(&bin, port, &blob) {
            Ok(pid) => {
                created.insert(
                    port,
                    CreatedApp {
                        type_hash: hash,
                        type_name: type_name.clone(),
                        pid,
                        created: Utc::now(),
                        connection: 0,
                    },
                );
                responses::created(port)
            }
            Err(err) => {
                responses::negative(&format!("Can't create instance of : {type_name}, error: {err}"))
            }
        }
    })
}

/// `Some(bytes)` answers now; `None` means a pending record owns the
/// response.
fn get_metadata(manager: &Manager, connection: ConnId, request: &HttpRequest) -> Option<Bytes> {
    let Some(app_type) = request.header("AppType") else {
        return Some(responses::negative("Key 'AppType' in header is not found"));
    };
    let hash = type_hash(app_type);
    if manager.registry().installed_bin(hash).is_none() {
        return Some(responses::negative(&format!("Unknown app type: {app_type}")));
    }
    if let Some(text) = manager.registry().metadata_text(hash) {
        return Some(responses::metadata(&text));
    }
    if !manager.registry().any_instance_of(hash) {
        return Some(responses::negative(&format!(
            "No instance of app {app_type} is created"
        )));
    }
    manager.engine().request_metadata(hash, Carrier { connection });
    None
}

fn get_parameters(manager: &Manager, connection: ConnId, request: &HttpRequest) -> Option<Bytes> {
    let port = match parse_port(request) {
        Ok(port) => port,
        Err(message) => return Some(responses::negative(&message)),
    };
    match manager.registry().created_connection(port) {
        None => Some(responses::negative(&format!(
            "App with port: {port} is not found"
        ))),
        Some(0) => Some(responses::negative(&format!(
            "App with port: {port} is not connected yet"
        ))),
        Some(worker) => {
            manager
                .engine()
                .request_parameters(port, worker, Carrier { connection });
            None
        }
    }
}

fn pause_or_run(
    manager: &Manager,
    connection: ConnId,
    request: &HttpRequest,
    pausing: bool,
) -> Option<Bytes> {
    let port = match parse_port(request) {
        Ok(port) => port,
        Err(message) => return Some(responses::negative(&message)),
    };
    // The opposing action's sentinel is the admission gate, checked
    // before the instance is even looked up.
    let opposing = if pausing {
        manager.engine().run_in_flight(port)
    } else {
        manager.engine().pause_in_flight(port)
    };
    if opposing {
        return Some(responses::negative("Another action is a process"));
    }
    match manager.registry().created_connection(port) {
        None => Some(responses::negative(&format!(
            "App with port: {port} is not found"
        ))),
        Some(0) => Some(responses::negative(&format!(
            "App with port: {port} is not connected yet"
        ))),
        Some(worker) => {
            let admitted = if pausing {
                manager
                    .engine()
                    .request_pause(port, worker, Carrier { connection })
            } else {
                manager
                    .engine()
                    .request_run(port, worker, Carrier { connection })
            };
            match admitted {
                Ok(()) => None,
                Err(conflict) => Some(responses::negative(&conflict.to_string())),
            }
        }
    }
}

fn delete(manager: &Manager, connection: ConnId, request: &HttpRequest) -> Option<Bytes> {
    let port = match parse_port(request) {
        Ok(port) => port,
        Err(message) => return Some(responses::negative(&message)),
    };
    match manager.registry().created_connection(port) {
        None => Some(responses::negative(&format!(
            "App with port: {port} is not found"
        ))),
        Some(0) => Some(responses::negative(&format!(
            "App with port: {port} is not connected yet"
        ))),
        Some(worker) => {
            manager
                .engine()
                .request_delete(port, worker, Carrier { connection });
            None
        }
    }
}

fn modify(manager: &Manager, request: &HttpRequest) -> Bytes {
    let port = match parse_port(request) {
        Ok(port) => port,
        Err(message) => return responses::negative(&message),
    };
    let Some(app) = manager.registry().with_created(|created| created.get(&port).cloned()) else {
        return responses::negative(&format!("App with port: {port} is not found"));
    };
    if app.connection == 0 {
        return responses::negative(&format!("App with port: {port} is not connected yet"));
    }
    let metadata = manager
        .registry()
        .with_installed(|installed| {
            installed
                .get(&app.type_hash)
                .and_then(|template| template.metadata.clone())
        });
    let Some(metadata) = metadata else {
        return responses::negative(&format!("Metadata for app with port: {port} is not valid"));
    };
    if !metadata.has_mutable() {
        return responses::negative(&format!(
            "Metadata for app with port: {port} does not contain mutable parameters"
        ));
    }

    let Some(raw) = request.header("Parameters") else {
        return responses::negative("Key 'Parameters' in header is not found");
    };
    let Ok(update_json) = serde_json::from_str::<serde_json::Value>(raw) else {
        return responses::negative("Parameters JSON is not valid");
    };
    let Some(entries) = update_json.as_object() else {
        return responses::negative("Parameters JSON is not valid");
    };

    let mut update = ParameterSet::new();
    for (key, node) in entries {
        let Ok(id) = key.parse::<u64>() else {
            return responses::negative(&format!("Key {key} cannot be converted properly"));
        };
        let Some(declared) = metadata.mutable_type(id) else {
            debug!(id, port, "parameter is not mutable or has no usable type, skipped");
            continue;
        };
        let schema = manager.engine().column_schema(id);
        match coerce_json(declared, node, schema.as_ref()) {
            Some(value) => {
                update.set(id, value);
            }
            None => {
                error!(
                    id,
                    port,
                    declared = declared.name(),
                    "update is not a valid value for the declared type"
                );
            }
        }
    }

    if update.is_empty() {
        return responses::negative("No parameters to update");
    }
    manager
        .engine()
        .send(app.connection, Action::Modify(update).to_frame().encode());
    responses::ok()
}

async fn serve_static(manager: &Manager, connection: ConnId, request: &HttpRequest) {
    let respond = |bytes: Bytes| manager.engine().send(connection, bytes);
    let root = manager.own_parameters().web_sources_path();
    let url = &request.url;

    if url.contains("..") {
        respond(HttpResponse::not_found());
        return;
    }

    let (path, content_type) = if url == "/" {
        (format!("{root}/html/index.html"), "text/html")
    } else {
        match request.format() {
            Some("css") => (format!("{root}/css{url}"), "text/css"),
            Some("js") => (format!("{root}/js{url}"), "application/javascript"),
            Some("ico") => (format!("{root}/images{url}"), "image/x-icon"),
            Some("png") => (format!("{root}/images{url}"), "image/png"),
            Some("jpg") => (format!("{root}/images{url}"), "image/jpeg"),
            _ => {
                respond(HttpResponse::not_found());
                return;
            }
        }
    };

    match tokio::fs::read(&path).await {
        Ok(content) => respond(HttpResponse::file(content_type, &content)),
        Err(err) => {
            debug!(%path, %err, "static source is not readable");
            respond(HttpResponse::not_found());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn request(headers: &str) -> HttpRequest {
        let mut buf = BytesMut::from(format!("GET /api HTTP/1.1\r\n{headers}\r\n").as_bytes());
        HttpRequest::parse(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn port_header_parsing() {
        assert_eq!(parse_port(&request("Port: 3500\r\n")), Ok(3500));
        assert!(parse_port(&request("Host: x\r\n")).is_err());
        assert!(parse_port(&request("Port: \r\n")).is_err());
        assert!(parse_port(&request("Port: eleven\r\n")).is_err());
        assert!(parse_port(&request("Port: 70000\r\n")).is_err());
    }

    #[test]
    fn port_draw_avoids_occupied_and_stays_in_range() {
        let created = BTreeMap::new();
        for _ in 0..64 {
            let port = draw_port(&created).unwrap();
            assert!((PORT_FLOOR..u16::MAX).contains(&port));
        }
    }

    #[test]
    fn port_draw_gives_up_when_every_candidate_is_taken() {
        let dummy = CreatedApp {
            type_hash: 1,
            type_name: "X".into(),
            pid: 1,
            created: Utc::now(),
            connection: 0,
        };
        let created: BTreeMap<u16, CreatedApp> =
            (PORT_FLOOR..u16::MAX).map(|port| (port, dummy.clone())).collect();
        assert_eq!(draw_port(&created), None);
    }
}
