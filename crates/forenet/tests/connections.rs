//! Loopback integration tests for the connection server: dispatch,
//! admission, outbound connect/reconnect, orderly shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use forenet::{ConnId, ConnectionHandler, NetError, Server, ServerConfig};
use foreproto::{Action, Frame, HttpRequest, ParameterSet, Value, CIPHER_PARAMETERS, HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const TICK: Duration = Duration::from_secs(5);

#[derive(Debug, PartialEq)]
enum Recorded {
    Frame(ConnId, Frame),
    Http(ConnId, String),
    Reconnect(ConnId),
    Disconnect(ConnId),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Recorded>,
}

#[async_trait]
impl ConnectionHandler for Recorder {
    async fn handle_frame(&self, connection: ConnId, frame: Frame) {
        let _ = self.tx.send(Recorded::Frame(connection, frame));
    }

    async fn handle_http(&self, connection: ConnId, request: HttpRequest) {
        let _ = self.tx.send(Recorded::Http(connection, request.url));
    }

    async fn handle_reconnect(&self, connection: ConnId) {
        let _ = self.tx.send(Recorded::Reconnect(connection));
    }

    async fn handle_disconnect(&self, connection: ConnId) {
        let _ = self.tx.send(Recorded::Disconnect(connection));
    }
}

fn started_server(config: ServerConfig) -> (Arc<Server>, SocketAddr, mpsc::UnboundedReceiver<Recorded>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::new(config);
    server.bind_handler(Arc::new(Recorder { tx }));
    let addr = server
        .start("127.0.0.1:0".parse().unwrap())
        .expect("server starts");
    (server, addr, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Recorded>) -> Recorded {
    timeout(TICK, rx.recv()).await.expect("event in time").expect("channel open")
}

#[tokio::test]
async fn inbound_frame_is_dispatched() {
    let (server, addr, mut rx) = started_server(ServerConfig::default());

    let mut params = ParameterSet::new();
    params.set(42, Value::Int32(7));
    let frame = params.to_frame();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&frame.encode()).await.unwrap();

    match recv(&mut rx).await {
        Recorded::Frame(_, got) => {
            assert_eq!(got.cipher, CIPHER_PARAMETERS);
            let decoded = ParameterSet::decode_body(got.body, |_| None).unwrap();
            assert_eq!(decoded.get(42), Some(&Value::Int32(7)));
        }
        other => panic!("expected frame, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 1);
    server.stop();
}

#[tokio::test]
async fn http_request_is_dispatched_on_the_same_listener() {
    let (server, addr, mut rx) = started_server(ServerConfig::default());

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /api HTTP/1.1\r\nType: getInstalledApps\r\n\r\n")
        .await
        .unwrap();

    match recv(&mut rx).await {
        Recorded::Http(_, url) => assert_eq!(url, "/api"),
        other => panic!("expected http, got {other:?}"),
    }
    server.stop();
}

#[tokio::test]
async fn per_ip_admission_limit_closes_excess_connections() {
    let config = ServerConfig::default();
    config.set_max_connections_one_ip(1);
    let (server, addr, _rx) = started_server(config);

    let mut first = TcpStream::connect(addr).await.unwrap();
    // Prove the first one is up before racing the second against the limit.
    first
        .write_all(b"GET /x HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let read = timeout(TICK, second.read(&mut buf)).await.expect("server closes in time");
    assert_eq!(read.unwrap(), 0, "second connection should be closed");
    assert_eq!(server.connection_count(), 1);
    server.stop();
}

#[tokio::test]
async fn oversize_frame_is_dropped_but_connection_survives() {
    let config = ServerConfig::default();
    config.set_recv_buffer_size_limit(64);
    let (server, addr, mut rx) = started_server(config);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let oversize = Frame::new(CIPHER_PARAMETERS, Bytes::from(vec![0u8; 128]));
    client.write_all(&oversize.encode()).await.unwrap();

    let mut params = ParameterSet::new();
    params.set(1, Value::Bool(true));
    client.write_all(&params.to_frame().encode()).await.unwrap();

    match recv(&mut rx).await {
        Recorded::Frame(_, got) => {
            assert_eq!(got.body.len() + HEADER_LEN, params.to_frame().wire_len());
        }
        other => panic!("expected the follow-up frame, got {other:?}"),
    }
    server.stop();
}

#[tokio::test]
async fn outbound_connect_sends_hello_and_reconnects_with_same_id() {
    let config = ServerConfig::default();
    config.set_seconds_between_try_to_connect(0);
    config.set_limit_connect_attempts(5);
    let (server, _addr, mut rx) = started_server(config);

    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    server.open_connect(77, peer_addr, true).await.unwrap();

    // First session: read the hello frame, then kill the socket.
    let (mut socket, _) = timeout(TICK, peer.accept()).await.unwrap().unwrap();
    let mut buf = vec![0u8; 64];
    let n = timeout(TICK, socket.read(&mut buf)).await.unwrap().unwrap();
    let hello = Action::Hello.to_frame().encode();
    assert_eq!(&buf[..n], &hello[..]);
    drop(socket);

    // The server re-establishes with the id preserved.
    let (mut socket, _) = timeout(TICK, peer.accept()).await.unwrap().unwrap();
    let n = timeout(TICK, socket.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], &hello[..]);

    match recv(&mut rx).await {
        Recorded::Reconnect(id) => assert_eq!(id, 77),
        other => panic!("expected reconnect, got {other:?}"),
    }

    // Frames still reach the handler after the reconnect.
    let mut params = ParameterSet::new();
    params.set(9, Value::Uint8(3));
    socket.write_all(&params.to_frame().encode()).await.unwrap();
    match recv(&mut rx).await {
        Recorded::Frame(id, _) => assert_eq!(id, 77),
        other => panic!("expected frame, got {other:?}"),
    }
    server.stop();
}

#[tokio::test]
async fn outbound_connect_gives_up_after_attempt_limit() {
    let config = ServerConfig::default();
    config.set_seconds_between_try_to_connect(0);
    config.set_limit_connect_attempts(2);
    let (server, _addr, _rx) = started_server(config);

    // Bind then drop to get a port with nothing listening.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);

    let err = server.open_connect(5, dead_addr, false).await.unwrap_err();
    match err {
        NetError::ConnectFailed { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected connect failure, got {other:?}"),
    }
    assert_eq!(server.connection_count(), 0);
    server.stop();
}

#[tokio::test]
async fn duplicate_outbound_id_is_rejected() {
    let config = ServerConfig::default();
    let (server, _addr, _rx) = started_server(config);

    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let peer_addr = peer.local_addr().unwrap();

    server.open_connect(11, peer_addr, false).await.unwrap();
    let err = server.open_connect(11, peer_addr, false).await.unwrap_err();
    assert!(matches!(err, NetError::DuplicateId(11)));
    server.stop();
}

#[tokio::test]
async fn stop_closes_connections_and_forbids_new_work() {
    let (server, addr, mut rx) = started_server(ServerConfig::default());

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"GET /x HTTP/1.1\r\n\r\n").await.unwrap();
    match recv(&mut rx).await {
        Recorded::Http(..) => {}
        other => panic!("expected http, got {other:?}"),
    }

    server.stop();
    server.stop(); // idempotent

    let mut buf = [0u8; 1];
    let read = timeout(TICK, client.read(&mut buf)).await.expect("close in time");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert_eq!(server.connection_count(), 0);

    match recv(&mut rx).await {
        Recorded::Disconnect(_) => {}
        other => panic!("expected disconnect, got {other:?}"),
    }

    let err = server.send(1, Bytes::from_static(b"x")).unwrap_err();
    assert!(matches!(err, NetError::ConnectionNotFound(1)));

    // A stopped server cannot be started again.
    assert!(server.start("127.0.0.1:0".parse().unwrap()).is_err());
}
