//! Network module - Socket wrappers shared by both ends of a link
//!
//! Provides:
//! - TCP and UDP socket wrappers with completion events
//! - Endpoint parsing and resolution
//! - The `Transport` seam channels drive sockets through

mod endpoint;
mod error;
mod tcp;
mod udp;

pub use endpoint::*;
pub use error::*;
pub use tcp::*;
pub use udp::*;

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::protocol::PROTOCOL_VERSION;

/// Size of the buffer one receive operation reads into
pub const RECEIVE_BUFFER_SIZE: usize = 4096;

/// Configuration for channel operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Protocol version this end was built for
    pub protocol_version: u16,
    /// Minimum time between two samples of the same continuous data type
    pub min_interval: Duration,
    /// Whether data channels open a UDP path for continuous streams
    pub enable_udp: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            min_interval: Duration::ZERO,
            enable_udp: true,
        }
    }
}

impl NetworkConfig {
    pub fn with_min_interval_ms(mut self, millis: u64) -> Self {
        self.min_interval = Duration::from_millis(millis);
        self
    }

    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn without_udp(mut self) -> Self {
        self.enable_udp = false;
        self
    }
}

/// Which socket of a channel an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Tcp,
    Udp,
}

/// Completion events raised by socket wrappers
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// Outbound connection established
    Connected,
    /// Inbound connection accepted
    ClientAccepted { remote: SocketAddr },
    /// One send operation handed all of its bytes to the OS
    DataSent,
    /// Exactly the bytes one receive operation read
    DataReceived(Bytes),
    /// Peer closed the connection
    ConnectionClosed,
    /// A socket operation failed
    Error(NetworkError),
}

/// A socket event tagged with the socket that raised it
#[derive(Debug, Clone)]
pub struct TransportEvent {
    pub source: TransportKind,
    pub event: SocketEvent,
}

/// Where a socket wrapper delivers its completion events
#[derive(Debug, Clone)]
pub struct EventSink {
    source: TransportKind,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

impl EventSink {
    pub fn new(source: TransportKind, tx: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self { source, tx }
    }

    /// Create a sink together with the receiver that drains it
    pub fn channel(source: TransportKind) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(source, tx), rx)
    }

    pub fn source(&self) -> TransportKind {
        self.source
    }

    /// Deliver an event; a dropped receiver means nobody is listening anymore
    pub fn emit(&self, event: SocketEvent) {
        let _ = self.tx.send(TransportEvent {
            source: self.source,
            event,
        });
    }
}

/// The operations a channel needs from a socket.
///
/// `send` and `receive` only issue the operation; completion is reported
/// later through the socket's event sink.
pub trait Transport: Send + Sync {
    /// Whether the socket can currently send and receive
    fn is_connected(&self) -> bool;

    /// Issue one asynchronous write of `bytes`
    fn send(&self, bytes: Bytes) -> NetworkResult<()>;

    /// Issue one asynchronous read
    fn receive(&self) -> NetworkResult<()>;

    /// Tear the socket down, abandoning in-flight operations
    fn shutdown(&self);
}

/// Lock a state mutex. A panic while holding the lock leaves plain data
/// behind, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
