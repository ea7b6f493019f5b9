//! The manager: one object wired into the connection server as its
//! dispatcher, owning the registries, the correlation engine, and the
//! supervisor.
//!
//! Frames are dispatched by cipher: parameters and metadata frames feed
//! the correlation engine, action frames either come from workers
//! (hello) or address the manager itself (pause, run, delete, modify,
//! parameters/metadata requests), and HTTP goes to the control-plane
//! dispatcher.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use foreconf::{load_manifest, ManifestEntry, Settings};
use forenet::{ConnId, ConnectionHandler, Server};
use foreproto::{
    Action, AppMetadata, Frame, ParameterSet, CIPHER_ACTION, CIPHER_METADATA, CIPHER_PARAMETERS,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api;
use crate::engine::{Engine, Transport};
use crate::params::OwnParameters;
use crate::registry::Registry;
use crate::supervisor::{DeathEvent, Supervisor};

/// Engine transport backed by the connection server's writer channels.
struct ServerTransport(Arc<Server>);

impl Transport for ServerTransport {
    fn send(&self, connection: ConnId, bytes: Bytes) {
        if let Err(err) = self.0.send(connection, bytes) {
            debug!(connection, %err, "send skipped");
        }
    }
}

pub struct Manager {
    server: Arc<Server>,
    registry: Registry,
    engine: Engine,
    supervisor: Supervisor,
    own: OwnParameters,
    paused: AtomicBool,
    manifest_path: PathBuf,
}

impl Manager {
    /// Build the manager and hand back the death-event stream for
    /// [`Manager::spawn_reaper`].
    pub fn new(
        server: Arc<Server>,
        settings: &Settings,
        entries: Vec<ManifestEntry>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DeathEvent>) {
        let (supervisor, deaths) = Supervisor::new();
        let manager = Arc::new(Self {
            engine: Engine::new(Box::new(ServerTransport(server.clone()))),
            registry: Registry::new(entries),
            supervisor,
            own: OwnParameters::new(&settings.web_root),
            paused: AtomicBool::new(false),
            manifest_path: settings.manifest_path.clone(),
            server,
        });
        (manager, deaths)
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn own_parameters(&self) -> &OwnParameters {
        &self.own
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Consume death events until the channel closes. One task per
    /// manager; the fan-out itself runs synchronously per event.
    pub fn spawn_reaper(self: &Arc<Self>, mut deaths: mpsc::UnboundedReceiver<DeathEvent>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(event) = deaths.recv().await {
                manager.handle_child_exit(event);
            }
            debug!("reaper task finished");
        });
    }

    /// A child exited: answer every pending record keyed on its port,
    /// fail metadata waiters when it was the type's last instance, and
    /// forget the instance.
    pub fn handle_child_exit(&self, event: DeathEvent) {
        info!(
            port = event.port,
            pid = event.pid,
            code = event.exit_code,
            "reaping worker"
        );
        self.registry.with_created_mut(|created| {
            let Some(app) = created.remove(&event.port) else {
                warn!(port = event.port, pid = event.pid, "exited worker is not registered");
                return;
            };
            self.engine.fail_for_port(event.port);
            if !created.values().any(|other| other.type_hash == app.type_hash) {
                self.engine.fail_metadata_for_type(app.type_hash);
            }
        });
    }

    /// Drain every pending record with its terminal response and drop all
    /// app state. Idempotent.
    pub fn pause(&self) {
        if self.paused.swap(true, Ordering::SeqCst) {
            debug!("manager is already paused");
            return;
        }
        info!("manager is pausing, draining pending requests");
        self.engine.drain_all();
        self.registry.clear();
    }

    /// Leave the paused state by re-reading the manifest. A manifest that
    /// no longer loads stops the manager instead.
    pub fn resume(&self) {
        if !self.is_paused() {
            return;
        }
        match load_manifest(&self.manifest_path) {
            Ok(entries) => {
                info!("manager is resuming");
                self.registry.reload(entries);
                self.paused.store(false, Ordering::SeqCst);
            }
            Err(err) => {
                error!(%err, "manifest is no longer loadable, stopping");
                self.stop();
            }
        }
    }

    /// Pause, then shut the server down for good.
    pub fn stop(&self) {
        self.pause();
        self.server.stop();
    }

    // ---- binary protocol ----------------------------------------------

    /// A parameters frame from some connection. Frames carrying the
    /// publisher's listening port identify (and on first contact, bind)
    /// the instance; everything else is noise.
    fn on_parameters(&self, connection: ConnId, params: ParameterSet) {
        let Some(port) = params.listen_port() else {
            warn!(connection, "parameters update without port");
            return;
        };

        let mut known = false;
        let mut ask_metadata = false;
        self.registry.with_created_mut(|created| {
            let Some(app) = created.get_mut(&port) else {
                error!(port, "app is not found");
                return;
            };
            known = true;
            if app.connection == 0 {
                debug!(app = %app.type_name, port, connection, "first parameters update");
                app.connection = connection;
                let hash = app.type_hash;
                ask_metadata = self.registry.with_installed(|installed| {
                    installed
                        .get(&hash)
                        .is_some_and(|template| template.metadata.is_none())
                });
            } else {
                debug!(app = %app.type_name, port, "parameters update");
            }
        });
        if !known {
            return;
        }
        if ask_metadata {
            self.engine
                .send(connection, Action::MetadataRequest.to_frame().encode());
        }
        self.engine.on_parameters_frame(port, &params);
    }

    /// A metadata frame from a worker: first delivery populates the
    /// template, registers table column schemas, and fans out to every
    /// waiting caller.
    fn on_metadata(&self, connection: ConnId, text: &str) {
        let Some((port, hash)) = self.registry.port_of_connection(connection) else {
            error!(connection, "metadata update from unknown app");
            return;
        };
        debug!(port, "metadata update");

        let mut fan_out: Option<String> = None;
        self.registry.with_installed_mut(|installed| {
            let Some(template) = installed.get_mut(&hash) else {
                error!(port, "installed app for metadata is not found");
                return;
            };
            if template.metadata.is_some() {
                warn!(app = %template.type_name, "metadata is already handled");
                return;
            }
            match AppMetadata::parse(text) {
                Ok(metadata) => {
                    self.engine.register_columns(metadata.table_schemas());
                    fan_out = Some(metadata.raw().to_string());
                    template.metadata = Some(metadata);
                }
                Err(err) => {
                    error!(app = %template.type_name, %err, "metadata is not valid");
                }
            }
        });
        if let Some(raw) = fan_out {
            self.engine.drain_metadata(hash, &raw);
        }
    }

    /// An action frame. Hello comes from workers; the rest address the
    /// manager itself.
    fn on_action(&self, connection: ConnId, action: Action) {
        debug!(connection, action = action.name(), "action frame");
        match action {
            Action::Hello => {
                self.engine
                    .send(connection, Action::ParametersRequest.to_frame().encode());
            }
            Action::ParametersRequest => {
                let snapshot = self.own.snapshot(&self.server, self.is_paused());
                self.engine.send(connection, snapshot.to_frame().encode());
            }
            Action::MetadataRequest => {
                debug!(connection, "manager has no metadata to deliver");
            }
            Action::Pause => self.pause(),
            Action::Run => self.resume(),
            Action::Delete => self.stop(),
            Action::Modify(update) => {
                self.own
                    .apply_modify(&self.server, !self.is_paused(), &update);
            }
        }
    }
}

#[async_trait]
impl ConnectionHandler for Manager {
    async fn handle_frame(&self, connection: ConnId, frame: Frame) {
        match frame.cipher {
            CIPHER_PARAMETERS => {
                match ParameterSet::decode_body(frame.body, |id| self.engine.column_schema(id)) {
                    Ok(params) => self.on_parameters(connection, params),
                    Err(err) => error!(connection, %err, "broken parameters frame"),
                }
            }
            CIPHER_ACTION => {
                match Action::decode_body(frame.body, |id| self.engine.column_schema(id)) {
                    Ok(action) => self.on_action(connection, action),
                    Err(err) => error!(connection, %err, "broken action frame"),
                }
            }
            CIPHER_METADATA => match std::str::from_utf8(&frame.body) {
                Ok(text) => self.on_metadata(connection, text),
                Err(_) => error!(connection, "metadata frame is not UTF-8"),
            },
            other => error!(connection, cipher = other, "unknown protocol"),
        }
    }

    async fn handle_http(&self, connection: ConnId, request: foreproto::HttpRequest) {
        api::handle(self, connection, request).await;
    }
}
