//! The connection server: accept loop, outbound connects, registries,
//! admission control, orderly shutdown.
//!
//! Lifecycle is `Initialization -> Running -> Stopped`. `start` may only
//! be called from `Initialization`; `stop` is idempotent and after it no
//! connection state mutation is permitted. Every registry mutation
//! happens under one closing-connection lock, and outbound writes travel
//! through per-connection channels so the lock is never held across a
//! send.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use foreproto::codec::Event;
use foreproto::{Action, FrameReader};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::handler::ConnectionHandler;

/// Stable process-lifetime connection identifier, distinct from any
/// socket handle so reconnection preserves identity.
pub type ConnId = i32;

/// Sleep before re-scanning when the global connection limit is reached.
const FULL_SLEEP: Duration = Duration::from_secs(10);

/// Read chunk size per `recv`.
const READ_CHUNK: usize = 4096;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initialization = 0,
    Running = 1,
    Stopped = 2,
}

impl ServerState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Running,
            2 => Self::Stopped,
            _ => Self::Initialization,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Initialization => "Initialization",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("server is not in the initialization state")]
    AlreadyStarted,
    #[error("server is stopped")]
    Stopped,
    #[error("no handler bound")]
    NoHandler,
    #[error("connection id {0} is already registered")]
    DuplicateId(ConnId),
    #[error("connection id {0} is not registered")]
    ConnectionNotFound(ConnId),
    #[error("connect to {addr} failed after {attempts} attempt(s)")]
    ConnectFailed { addr: SocketAddr, attempts: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct InboundEntry {
    ip: IpAddr,
    tx: mpsc::UnboundedSender<Bytes>,
}

struct OutboundEntry {
    addr: SocketAddr,
    reconnect: bool,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
struct Registries {
    inbound: HashMap<ConnId, InboundEntry>,
    outbound: HashMap<ConnId, OutboundEntry>,
    per_ip: HashMap<IpAddr, Vec<ConnId>>,
}

impl Registries {
    fn contains(&self, id: ConnId) -> bool {
        self.inbound.contains_key(&id) || self.outbound.contains_key(&id)
    }
}

/// What the reader task should do after its socket died.
enum CloseOutcome {
    /// Entry already gone (server stopped or never registered).
    AlreadyClosed,
    Closed,
    Reconnect { addr: SocketAddr },
}

pub struct Server {
    config: ServerConfig,
    state: AtomicU8,
    handler: OnceLock<Arc<dyn ConnectionHandler>>,
    /// The closing-connection lock: every registry mutation goes through it.
    registries: Mutex<Registries>,
    counter: AtomicUsize,
    shutdown: CancellationToken,
    listen_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: AtomicU8::new(ServerState::Initialization as u8),
            handler: OnceLock::new(),
            registries: Mutex::new(Registries::default()),
            counter: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            listen_addr: Mutex::new(None),
        })
    }

    /// Install the dispatcher. Must happen before `start`.
    pub fn bind_handler(&self, handler: Arc<dyn ConnectionHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("handler is already bound");
        }
    }

    fn handler(&self) -> Arc<dyn ConnectionHandler> {
        self.handler
            .get()
            .expect("handler bound before start")
            .clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    /// Open connections right now.
    pub fn connection_count(&self) -> usize {
        self.counter.load(Ordering::SeqCst)
    }

    /// The address `start` actually bound (port resolved when 0 was asked).
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.listen_addr.lock().unwrap()
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    /// Remote IP of an inbound connection.
    pub fn connection_ip(&self, id: ConnId) -> Option<IpAddr> {
        self.registries.lock().unwrap().inbound.get(&id).map(|e| e.ip)
    }

    /// Bind, listen, and spawn the accept loop. Only valid from
    /// `Initialization`.
    pub fn start(self: &Arc<Self>, addr: SocketAddr) -> Result<SocketAddr, NetError> {
        if self.state() != ServerState::Initialization {
            debug!(state = self.state().name(), "server cannot be started");
            return Err(NetError::AlreadyStarted);
        }
        if self.handler.get().is_none() {
            return Err(NetError::NoHandler);
        }

        let listener = build_listener(addr, self.config.somaxconn())?;
        let local = listener.local_addr()?;
        let listener = TcpListener::from_std(listener)?;
        *self.listen_addr.lock().unwrap() = Some(local);
        self.state.store(ServerState::Running as u8, Ordering::SeqCst);
        info!(%local, "server started");

        let server = self.clone();
        tokio::spawn(async move { server.accept_loop(listener).await });
        Ok(local)
    }

    /// Stop accepting, close every connection, forbid further mutation.
    /// Idempotent.
    pub fn stop(&self) {
        if self.state.swap(ServerState::Stopped as u8, Ordering::SeqCst)
            == ServerState::Stopped as u8
        {
            debug!("server is already stopped");
            return;
        }
        info!("server is stopping");
        self.shutdown.cancel();

        let mut registries = self.registries.lock().unwrap();
        for (id, _) in registries.inbound.drain() {
            self.counter.fetch_sub(1, Ordering::SeqCst);
            info!(id, "closing inbound connection");
        }
        for (id, _) in registries.outbound.drain() {
            self.counter.fetch_sub(1, Ordering::SeqCst);
            info!(id, "closing outbound connection");
        }
        registries.per_ip.clear();
        drop(registries);
        info!("server stopped");
    }

    /// Queue bytes for a connection's writer.
    pub fn send(&self, id: ConnId, bytes: Bytes) -> Result<(), NetError> {
        let registries = self.registries.lock().unwrap();
        let tx = registries
            .inbound
            .get(&id)
            .map(|e| &e.tx)
            .or_else(|| registries.outbound.get(&id).map(|e| &e.tx))
            .ok_or(NetError::ConnectionNotFound(id))?;
        tx.send(bytes).map_err(|_| NetError::ConnectionNotFound(id))
    }

    /// Establish an outbound connection with a caller-chosen stable id.
    /// On success the reader task is running and a `Hello` action frame
    /// has been queued.
    pub async fn open_connect(
        self: &Arc<Self>,
        id: ConnId,
        addr: SocketAddr,
        reconnect: bool,
    ) -> Result<(), NetError> {
        if self.state() == ServerState::Stopped {
            info!(id, %addr, "connect interrupted, server is stopped");
            return Err(NetError::Stopped);
        }
        if self.registries.lock().unwrap().contains(id) {
            return Err(NetError::DuplicateId(id));
        }
        info!(id, %addr, reconnect, "connecting");
        let stream = self.establish(id, addr).await?;
        self.attach_outbound(id, addr, reconnect, stream)?;
        Ok(())
    }

    /// Close an outbound connection and disable its reconnection.
    /// Dropping the writer sender closes the socket's write half and the
    /// reader observes the close; since the entry is already gone, the
    /// reader will not attempt to reconnect.
    pub fn close_connect(&self, id: ConnId) {
        let mut registries = self.registries.lock().unwrap();
        match registries.outbound.remove(&id) {
            Some(_entry) => {
                info!(id, "closing outbound connection, reconnection disabled");
                self.counter.fetch_sub(1, Ordering::SeqCst);
            }
            None => warn!(id, "outbound connection is not found"),
        }
    }

    async fn establish(&self, id: ConnId, addr: SocketAddr) -> Result<TcpStream, NetError> {
        let limit = self.config.limit_connect_attempts().max(1);
        let mut attempt = 1usize;
        loop {
            if self.state() == ServerState::Stopped {
                return Err(NetError::Stopped);
            }
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        warn!(id, %err, "failed to set TCP_NODELAY");
                    }
                    info!(id, %addr, "connected");
                    return Ok(stream);
                }
                Err(err) => {
                    warn!(id, %addr, attempt, %err, "connect attempt failed");
                    if attempt >= limit {
                        return Err(NetError::ConnectFailed {
                            addr,
                            attempts: attempt,
                        });
                    }
                    attempt += 1;
                    tokio::time::sleep(Duration::from_secs(
                        self.config.seconds_between_try_to_connect() as u64,
                    ))
                    .await;
                }
            }
        }
    }

    fn attach_outbound(
        self: &Arc<Self>,
        id: ConnId,
        addr: SocketAddr,
        reconnect: bool,
        stream: TcpStream,
    ) -> Result<(), NetError> {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut registries = self.registries.lock().unwrap();
            if self.state() == ServerState::Stopped {
                return Err(NetError::Stopped);
            }
            if registries.contains(id) {
                return Err(NetError::DuplicateId(id));
            }
            registries.outbound.insert(
                id,
                OutboundEntry {
                    addr,
                    reconnect,
                    tx,
                },
            );
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
        self.spawn_writer(id, write_half, rx);
        let server = self.clone();
        tokio::spawn(async move { server.connection_task(id, read_half).await });
        if self.is_running() {
            let _ = self.send(id, Action::Hello.to_frame().encode());
        }
        Ok(())
    }

    /// Re-register an outbound connection after its socket died, keeping
    /// the id. Returns the new read half for the surviving reader task.
    fn reattach_outbound(
        self: &Arc<Self>,
        id: ConnId,
        addr: SocketAddr,
        stream: TcpStream,
    ) -> Result<OwnedReadHalf, NetError> {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut registries = self.registries.lock().unwrap();
            if self.state() == ServerState::Stopped {
                return Err(NetError::Stopped);
            }
            registries.outbound.insert(
                id,
                OutboundEntry {
                    addr,
                    reconnect: true,
                    tx,
                },
            );
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
        self.spawn_writer(id, write_half, rx);
        if self.is_running() {
            let _ = self.send(id, Action::Hello.to_frame().encode());
        }
        Ok(read_half)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            if self.connection_count() >= self.config.somaxconn() {
                info!(
                    limit = self.config.somaxconn(),
                    "connection limit reached, sleeping"
                );
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(FULL_SLEEP) => continue,
                }
            }

            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("server state is Stopped, leaving the accept loop");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        if self.state() == ServerState::Stopped {
                            return;
                        }
                        error!(%err, "accept failed");
                        continue;
                    }
                },
            };
            if self.state() != ServerState::Running {
                continue;
            }
            if let Err(err) = stream.set_nodelay(true) {
                warn!(%err, "failed to set TCP_NODELAY");
            }

            let ip = peer.ip();
            let (read_half, write_half) = stream.into_split();
            let (tx, rx) = mpsc::unbounded_channel();
            let id = {
                let mut registries = self.registries.lock().unwrap();
                let id = draw_id(&registries);
                if !admit(&mut registries, id, ip, self.config.max_connections_one_ip()) {
                    info!(%ip, id, "connection rejected by the IP filter");
                    continue;
                }
                registries.inbound.insert(id, InboundEntry { ip, tx });
                self.counter.fetch_add(1, Ordering::SeqCst);
                id
            };
            info!(id, %ip, "connection accepted");

            self.spawn_writer(id, write_half, rx);
            let server = self.clone();
            tokio::spawn(async move { server.connection_task(id, read_half).await });
        }
    }

    fn spawn_writer(
        &self,
        id: ConnId,
        mut write_half: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Bytes>,
    ) {
        let token = self.shutdown.clone();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(bytes) => {
                            if let Err(err) = write_half.write_all(&bytes).await {
                                debug!(id, %err, "write failed");
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = write_half.shutdown().await;
        });
    }

    /// One task per connection id. Survives outbound reconnection.
    async fn connection_task(self: Arc<Self>, id: ConnId, mut read_half: OwnedReadHalf) {
        loop {
            self.read_loop(id, &mut read_half).await;
            match self.close_connection(id) {
                CloseOutcome::Reconnect { addr } => {
                    info!(id, %addr, "reconnecting");
                    tokio::time::sleep(Duration::from_secs(
                        self.config.seconds_between_try_to_connect() as u64,
                    ))
                    .await;
                    match self.establish(id, addr).await {
                        Ok(stream) => match self.reattach_outbound(id, addr, stream) {
                            Ok(new_read_half) => {
                                read_half = new_read_half;
                                self.handler().handle_reconnect(id).await;
                                continue;
                            }
                            Err(err) => {
                                warn!(id, %err, "reattach after reconnect failed");
                            }
                        },
                        Err(err) => {
                            warn!(id, %err, "reconnect failed");
                        }
                    }
                    self.handler().handle_disconnect(id).await;
                    return;
                }
                CloseOutcome::Closed => {
                    self.handler().handle_disconnect(id).await;
                    return;
                }
                CloseOutcome::AlreadyClosed => {
                    self.handler().handle_disconnect(id).await;
                    return;
                }
            }
        }
    }

    async fn read_loop(&self, id: ConnId, read_half: &mut OwnedReadHalf) {
        let mut reader = FrameReader::new(
            self.config.recv_buffer_size(),
            self.config.recv_buffer_size_limit(),
        );
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            let read = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                read = read_half.read(&mut chunk) => read,
            };
            match read {
                Ok(0) => {
                    info!(id, "connection closed by peer");
                    return;
                }
                Ok(n) => {
                    trace!(id, bytes = n, "received");
                    reader.push(&chunk[..n]);
                    loop {
                        match reader.next() {
                            Ok(Some(Event::Frame(frame))) => {
                                self.handler().handle_frame(id, frame).await;
                            }
                            Ok(Some(Event::Http(request))) => {
                                self.handler().handle_http(id, request).await;
                            }
                            Ok(Some(Event::Dropped { cipher, declared })) => {
                                warn!(id, cipher, declared, "frame dropped");
                            }
                            Ok(None) => break,
                            Err(err) => {
                                error!(id, %err, "framing violation, closing connection");
                                return;
                            }
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(err) if err.kind() == std::io::ErrorKind::ConnectionReset => {
                    debug!(id, "connection reset by peer");
                    return;
                }
                Err(err) => {
                    error!(id, %err, "recv returned an unrecoverable error");
                    return;
                }
            }
        }
    }

    /// Remove the id from its registry under the closing-connection lock.
    fn close_connection(&self, id: ConnId) -> CloseOutcome {
        let mut registries = self.registries.lock().unwrap();
        if let Some(entry) = registries.inbound.remove(&id) {
            self.counter.fetch_sub(1, Ordering::SeqCst);
            if let Some(ids) = registries.per_ip.get_mut(&entry.ip) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    registries.per_ip.remove(&entry.ip);
                }
            }
            info!(
                id,
                active = self.counter.load(Ordering::SeqCst),
                "inbound connection closed"
            );
            return CloseOutcome::Closed;
        }
        if let Some(entry) = registries.outbound.remove(&id) {
            self.counter.fetch_sub(1, Ordering::SeqCst);
            info!(
                id,
                active = self.counter.load(Ordering::SeqCst),
                "outbound connection closed"
            );
            if entry.reconnect && self.state() != ServerState::Stopped {
                return CloseOutcome::Reconnect { addr: entry.addr };
            }
            return CloseOutcome::Closed;
        }
        CloseOutcome::AlreadyClosed
    }
}

fn draw_id(registries: &Registries) -> ConnId {
    loop {
        let id: ConnId = rand::random();
        if id != 0 && !registries.contains(id) {
            return id;
        }
    }
}

fn admit(registries: &mut Registries, id: ConnId, ip: IpAddr, limit: usize) -> bool {
    let ids = registries.per_ip.entry(ip).or_default();
    if ids.len() >= limit {
        return false;
    }
    ids.push(id);
    true
}

fn build_listener(addr: SocketAddr, backlog: usize) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as usize) as i32)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
