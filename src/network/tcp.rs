//! TCP socket wrapper
//!
//! Owns one TCP socket and exposes listen/connect/send/receive as
//! fire-and-forget operations. Every operation runs on its own task and
//! reports completion through the socket's [`EventSink`]; no I/O error ever
//! escapes a task, it becomes a [`SocketEvent::Error`] instead.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpSocket as TokioTcpSocket, TcpStream};
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};

use super::{
    lock, Endpoint, EventSink, NetworkError, NetworkErrorKind, NetworkResult, SocketEvent,
    Transport, RECEIVE_BUFFER_SIZE,
};

/// Lifecycle of a socket wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Fresh or shut down; ready for listen/connect
    Idle,
    /// Waiting for one inbound connection
    Listening,
    /// Outbound connection in progress
    Connecting,
    /// Stream established
    Connected,
    /// An error or close was reported; shutdown is required before reuse
    Closed,
}

struct TcpInner {
    state: SocketState,
    sink: Option<EventSink>,
    reader: Option<Arc<tokio::sync::Mutex<OwnedReadHalf>>>,
    writer: Option<Arc<tokio::sync::Mutex<OwnedWriteHalf>>>,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    tasks: Vec<AbortHandle>,
    /// Bumped on shutdown so late completions of abandoned tasks are dropped
    generation: u64,
}

impl TcpInner {
    fn emit(&self, event: SocketEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn install(&mut self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not disable Nagle: {}", e);
        }
        self.local_addr = stream.local_addr().ok();
        self.peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        self.reader = Some(Arc::new(tokio::sync::Mutex::new(reader)));
        self.writer = Some(Arc::new(tokio::sync::Mutex::new(writer)));
        self.state = SocketState::Connected;
    }

    fn fail(&mut self, error: NetworkError) {
        tracing::warn!("TCP socket error: {}", error);
        self.state = SocketState::Closed;
        self.emit(SocketEvent::Error(error));
    }

    fn track<T>(&mut self, handle: JoinHandle<T>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(handle.abort_handle());
    }
}

/// Run `apply` on the socket state unless the socket was shut down since the
/// operation was issued.
fn complete(inner: &Mutex<TcpInner>, generation: u64, apply: impl FnOnce(&mut TcpInner)) {
    let mut guard = lock(inner);
    if guard.generation == generation {
        apply(&mut guard);
    }
}

/// Asynchronous TCP socket raising completion events
pub struct TcpSocket {
    runtime: Handle,
    inner: Arc<Mutex<TcpInner>>,
}

impl TcpSocket {
    /// Create an idle socket delivering events to `sink`.
    ///
    /// Must be called from within a tokio runtime; operations are spawned on it.
    pub fn new(sink: EventSink) -> NetworkResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| NetworkError::invalid_state("TCP socket needs a tokio runtime"))?;

        Ok(Self {
            runtime,
            inner: Arc::new(Mutex::new(TcpInner {
                state: SocketState::Idle,
                sink: Some(sink),
                reader: None,
                writer: None,
                local_addr: None,
                peer_addr: None,
                tasks: Vec::new(),
                generation: 0,
            })),
        })
    }

    /// Register the event sink again after a shutdown
    pub fn set_event_sink(&self, sink: EventSink) {
        lock(&self.inner).sink = Some(sink);
    }

    pub fn state(&self) -> SocketState {
        lock(&self.inner).state
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner).local_addr
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner).peer_addr
    }

    fn ensure_idle(inner: &TcpInner) -> NetworkResult<()> {
        if inner.state != SocketState::Idle {
            return Err(NetworkError::invalid_state(format!(
                "socket is {:?}; shut it down before reuse",
                inner.state
            )));
        }
        if inner.sink.is_none() {
            return Err(NetworkError::invalid_state("no event sink registered"));
        }
        Ok(())
    }

    /// Bind `local` and accept one inbound connection.
    ///
    /// The bind happens immediately so `local_addr` is known on return. A
    /// bind failure is reported as an error event, not returned.
    pub fn listen(&self, local: &Endpoint) -> NetworkResult<()> {
        let mut inner = lock(&self.inner);
        Self::ensure_idle(&inner)?;

        let listener = {
            let _guard = self.runtime.enter();
            let addr = local.socket_addr();
            let socket = if addr.is_ipv4() {
                TokioTcpSocket::new_v4()
            } else {
                TokioTcpSocket::new_v6()
            };
            // listeners are reopened on the same port after every session
            socket.and_then(|socket| {
                socket.set_reuseaddr(true)?;
                socket.bind(addr)?;
                socket.listen(1)
            })
        };
        let listener = match listener {
            Ok(listener) => listener,
            Err(e) => {
                inner.fail(NetworkError::io(NetworkErrorKind::Bind, local.to_string(), e));
                return Ok(());
            }
        };

        inner.local_addr = listener.local_addr().ok();
        inner.state = SocketState::Listening;
        tracing::info!("Listening on {}", inner.local_addr.unwrap_or(local.socket_addr()));

        let generation = inner.generation;
        let shared = self.inner.clone();
        let handle = self.runtime.spawn(async move {
            let result = listener.accept().await;
            complete(&shared, generation, |inner| match result {
                Ok((stream, remote)) => {
                    tracing::info!("Accepted connection from {}", remote);
                    inner.install(stream);
                    inner.emit(SocketEvent::ClientAccepted { remote });
                }
                Err(e) => inner.fail(NetworkError::io(
                    NetworkErrorKind::Accept,
                    "accepting inbound connection",
                    e,
                )),
            });
        });
        inner.track(handle);
        Ok(())
    }

    /// Start an outbound connection to `remote`
    pub fn connect(&self, remote: &Endpoint) -> NetworkResult<()> {
        let mut inner = lock(&self.inner);
        Self::ensure_idle(&inner)?;
        inner.state = SocketState::Connecting;

        let generation = inner.generation;
        let shared = self.inner.clone();
        let target = remote.socket_addr();
        tracing::info!("Connecting to {}", target);

        let handle = self.runtime.spawn(async move {
            let result = TcpStream::connect(target).await;
            complete(&shared, generation, |inner| match result {
                Ok(stream) => {
                    tracing::info!("Connected to {}", target);
                    inner.install(stream);
                    inner.emit(SocketEvent::Connected);
                }
                Err(e) => inner.fail(NetworkError::io(
                    NetworkErrorKind::Connect,
                    target.to_string(),
                    e,
                )),
            });
        });
        inner.track(handle);
        Ok(())
    }

    /// Issue one write of `bytes`, raising `DataSent` once all were written
    pub fn send(&self, bytes: Bytes) -> NetworkResult<()> {
        let mut inner = lock(&self.inner);
        let writer = match (&inner.writer, inner.state) {
            (Some(writer), SocketState::Connected) => writer.clone(),
            _ => return Err(NetworkError::invalid_state("send on a socket that is not connected")),
        };

        let generation = inner.generation;
        let shared = self.inner.clone();
        let handle = self.runtime.spawn(async move {
            let result = {
                let mut writer = writer.lock().await;
                writer.write_all(&bytes).await
            };
            complete(&shared, generation, |inner| match result {
                Ok(()) => {
                    tracing::trace!("Sent {} bytes", bytes.len());
                    inner.emit(SocketEvent::DataSent);
                }
                Err(e) => inner.fail(NetworkError::io(
                    NetworkErrorKind::Send,
                    format!("writing {} bytes", bytes.len()),
                    e,
                )),
            });
        });
        inner.track(handle);
        Ok(())
    }

    /// Issue one read, raising `DataReceived` with exactly the bytes read
    pub fn receive(&self) -> NetworkResult<()> {
        let mut inner = lock(&self.inner);
        let reader = match (&inner.reader, inner.state) {
            (Some(reader), SocketState::Connected) => reader.clone(),
            _ => {
                return Err(NetworkError::invalid_state(
                    "receive on a socket that is not connected",
                ))
            }
        };

        let generation = inner.generation;
        let shared = self.inner.clone();
        let handle = self.runtime.spawn(async move {
            let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
            let result = {
                let mut reader = reader.lock().await;
                reader.read(&mut buf).await
            };
            complete(&shared, generation, |inner| match result {
                Ok(0) => {
                    tracing::info!("Connection closed by {:?}", inner.peer_addr);
                    inner.state = SocketState::Closed;
                    inner.emit(SocketEvent::ConnectionClosed);
                }
                Ok(n) => {
                    buf.truncate(n);
                    inner.emit(SocketEvent::DataReceived(Bytes::from(buf)));
                }
                Err(e) => inner.fail(NetworkError::io(
                    NetworkErrorKind::Receive,
                    "reading from stream",
                    e,
                )),
            });
        });
        inner.track(handle);
        Ok(())
    }

    /// Tear down the socket and unregister the event sink. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = lock(&self.inner);
        inner.generation = inner.generation.wrapping_add(1);
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        if inner.state != SocketState::Idle {
            tracing::debug!("Shutting down TCP socket ({:?})", inner.state);
        }
        inner.reader = None;
        inner.writer = None;
        inner.sink = None;
        inner.local_addr = None;
        inner.peer_addr = None;
        inner.state = SocketState::Idle;
    }
}

impl Transport for TcpSocket {
    fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    fn send(&self, bytes: Bytes) -> NetworkResult<()> {
        TcpSocket::send(self, bytes)
    }

    fn receive(&self) -> NetworkResult<()> {
        TcpSocket::receive(self)
    }

    fn shutdown(&self) {
        TcpSocket::shutdown(self)
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{TransportEvent, TransportKind};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn loopback(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    async fn next(rx: &mut UnboundedReceiver<TransportEvent>) -> SocketEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for socket event")
            .expect("event sink closed")
            .event
    }

    #[tokio::test]
    async fn test_accept_send_receive() {
        let (server_sink, mut server_rx) = EventSink::channel(TransportKind::Tcp);
        let server = TcpSocket::new(server_sink).unwrap();
        server.listen(&loopback(0)).unwrap();
        let port = server.local_addr().unwrap().port();

        let (client_sink, mut client_rx) = EventSink::channel(TransportKind::Tcp);
        let client = TcpSocket::new(client_sink).unwrap();
        client.connect(&loopback(port)).unwrap();

        assert!(matches!(next(&mut client_rx).await, SocketEvent::Connected));
        assert!(matches!(
            next(&mut server_rx).await,
            SocketEvent::ClientAccepted { .. }
        ));

        server.receive().unwrap();
        client.send(Bytes::from_static(b"abc")).unwrap();
        assert!(matches!(next(&mut client_rx).await, SocketEvent::DataSent));

        match next(&mut server_rx).await {
            SocketEvent::DataReceived(bytes) => assert_eq!(&bytes[..], b"abc"),
            other => panic!("unexpected event {:?}", other),
        }

        client.shutdown();
        server.receive().unwrap();
        assert!(matches!(
            next(&mut server_rx).await,
            SocketEvent::ConnectionClosed
        ));
        assert_eq!(server.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_reuse_requires_shutdown() {
        let (sink, _rx) = EventSink::channel(TransportKind::Tcp);
        let socket = TcpSocket::new(sink.clone()).unwrap();
        socket.listen(&loopback(0)).unwrap();

        let err = socket.connect(&loopback(1)).unwrap_err();
        assert_eq!(err.kind, NetworkErrorKind::InvalidState);

        socket.shutdown();
        socket.shutdown();
        assert!(socket.connect(&loopback(1)).is_err(), "sink must be registered again");

        socket.set_event_sink(sink);
        assert!(socket.listen(&loopback(0)).is_ok());
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let (sink, _rx) = EventSink::channel(TransportKind::Tcp);
        let socket = TcpSocket::new(sink).unwrap();
        assert!(socket.send(Bytes::from_static(b"x")).is_err());
        assert!(socket.receive().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_is_an_event() {
        // Grab a free port and release it so nothing listens there
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let (sink, mut rx) = EventSink::channel(TransportKind::Tcp);
        let socket = TcpSocket::new(sink).unwrap();
        assert!(socket.connect(&loopback(port)).is_ok());

        match next(&mut rx).await {
            SocketEvent::Error(e) => assert_eq!(e.kind, NetworkErrorKind::Connect),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(socket.state(), SocketState::Closed);
    }
}
