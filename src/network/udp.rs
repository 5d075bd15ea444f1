//! UDP socket wrapper
//!
//! One socket serves both directions: it is bound to a local endpoint for
//! receiving and sends every datagram to one fixed remote endpoint. Each
//! received datagram raises exactly one `DataReceived` event. `DataSent` only
//! means the OS accepted the datagram; nothing is retried or acknowledged.

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket as TokioUdpSocket;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};

use super::{
    lock, Endpoint, EventSink, NetworkError, NetworkErrorKind, NetworkResult, SocketEvent,
    Transport,
};

/// Largest datagram a receive operation accepts
const MAX_DATAGRAM_SIZE: usize = 2048;

struct UdpInner {
    socket: Option<Arc<TokioUdpSocket>>,
    remote: Option<SocketAddr>,
    sink: Option<EventSink>,
    tasks: Vec<AbortHandle>,
    generation: u64,
}

impl UdpInner {
    fn emit(&self, event: SocketEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    fn track<T>(&mut self, handle: JoinHandle<T>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(handle.abort_handle());
    }
}

/// Asynchronous UDP socket raising completion events
pub struct UdpSocket {
    runtime: Handle,
    inner: Arc<Mutex<UdpInner>>,
}

impl UdpSocket {
    /// Create an uninitialized socket delivering events to `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(sink: EventSink) -> NetworkResult<Self> {
        let runtime = Handle::try_current()
            .map_err(|_| NetworkError::invalid_state("UDP socket needs a tokio runtime"))?;

        Ok(Self {
            runtime,
            inner: Arc::new(Mutex::new(UdpInner {
                socket: None,
                remote: None,
                sink: Some(sink),
                tasks: Vec::new(),
                generation: 0,
            })),
        })
    }

    /// Bind `local` for receiving and remember `remote` as the send target.
    ///
    /// Bind failures are reported as an error event.
    pub fn initialize(&self, local: &Endpoint, remote: &Endpoint) -> NetworkResult<()> {
        let mut inner = lock(&self.inner);
        if inner.socket.is_some() {
            return Err(NetworkError::invalid_state("UDP socket already initialized"));
        }
        if inner.sink.is_none() {
            return Err(NetworkError::invalid_state("no event sink registered"));
        }

        let socket = {
            let _guard = self.runtime.enter();
            std::net::UdpSocket::bind(local.socket_addr()).and_then(|socket| {
                socket.set_nonblocking(true)?;
                TokioUdpSocket::from_std(socket)
            })
        };

        match socket {
            Ok(socket) => {
                tracing::info!(
                    "UDP bound to {:?}, sending to {}",
                    socket.local_addr().ok(),
                    remote
                );
                inner.socket = Some(Arc::new(socket));
                inner.remote = Some(remote.socket_addr());
            }
            Err(e) => {
                let error = NetworkError::io(NetworkErrorKind::Bind, local.to_string(), e);
                tracing::warn!("UDP socket error: {}", error);
                inner.emit(SocketEvent::Error(error));
            }
        }
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.inner).socket.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner)
            .socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    fn bound(inner: &UdpInner) -> NetworkResult<(Arc<TokioUdpSocket>, SocketAddr)> {
        match (&inner.socket, inner.remote) {
            (Some(socket), Some(remote)) => Ok((socket.clone(), remote)),
            _ => Err(NetworkError::invalid_state("UDP socket not initialized")),
        }
    }

    /// Issue one receive; datagrams from hosts other than the remote's
    /// address are dropped without an event.
    pub fn receive_from(&self) -> NetworkResult<()> {
        let mut inner = lock(&self.inner);
        let (socket, remote) = Self::bound(&inner)?;

        let generation = inner.generation;
        let shared = self.inner.clone();
        let handle = self.runtime.spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            let result = loop {
                match socket.recv_from(&mut buf).await {
                    Ok((_, from)) if from.ip() != remote.ip() => {
                        tracing::debug!("Dropping datagram from unexpected sender {}", from);
                    }
                    Ok((n, _)) => break Ok(n),
                    Err(e) => break Err(e),
                }
            };

            let inner = lock(&shared);
            if inner.generation != generation {
                return;
            }
            match result {
                Ok(n) => {
                    buf.truncate(n);
                    inner.emit(SocketEvent::DataReceived(Bytes::from(buf)));
                }
                Err(e) => inner.emit(SocketEvent::Error(NetworkError::io(
                    NetworkErrorKind::Receive,
                    "receiving datagram",
                    e,
                ))),
            }
        });
        inner.track(handle);
        Ok(())
    }

    /// Send one datagram to the remote endpoint
    pub fn send_to(&self, bytes: Bytes) -> NetworkResult<()> {
        let mut inner = lock(&self.inner);
        let (socket, remote) = Self::bound(&inner)?;

        let generation = inner.generation;
        let shared = self.inner.clone();
        let handle = self.runtime.spawn(async move {
            let result = socket.send_to(&bytes, remote).await;

            let inner = lock(&shared);
            if inner.generation != generation {
                return;
            }
            match result {
                Ok(_) => inner.emit(SocketEvent::DataSent),
                Err(e) => inner.emit(SocketEvent::Error(NetworkError::io(
                    NetworkErrorKind::Send,
                    format!("sending datagram to {}", remote),
                    e,
                ))),
            }
        });
        inner.track(handle);
        Ok(())
    }

    /// Release the socket and unregister the event sink. Idempotent.
    pub fn shutdown(&self) {
        let mut inner = lock(&self.inner);
        inner.generation = inner.generation.wrapping_add(1);
        for task in inner.tasks.drain(..) {
            task.abort();
        }
        if inner.socket.take().is_some() {
            tracing::debug!("Shutting down UDP socket");
        }
        inner.remote = None;
        inner.sink = None;
    }
}

impl Transport for UdpSocket {
    fn is_connected(&self) -> bool {
        self.is_initialized()
    }

    fn send(&self, bytes: Bytes) -> NetworkResult<()> {
        self.send_to(bytes)
    }

    fn receive(&self) -> NetworkResult<()> {
        self.receive_from()
    }

    fn shutdown(&self) {
        UdpSocket::shutdown(self)
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}
