//! Channel module - Stateful links built on top of the socket wrappers
//!
//! A channel owns its sockets and:
//! - Reassembles TCP byte streams into frames
//! - Sends queued items in order, one send in flight at a time
//! - Performs the version handshake (control channel)
//! - Fans TCP and UDP input into one message stream (data channel)
//!
//! Socket completions arrive on one event queue per channel and are applied
//! to the channel state under a single lock.

mod control;
mod data;
mod reassembly;
mod send_queue;
mod throttle;

pub use control::*;
pub use data::*;
pub use reassembly::*;
pub use send_queue::*;
pub use throttle::*;

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::network::{NetworkError, NetworkResult, Transport, TransportEvent};
use crate::protocol::{CodecError, ControlCommand, DataMessage};

/// Channel errors
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol version mismatch: server={server}, client={client}")]
    VersionMismatch { server: u16, client: u16 },

    #[error("Invalid channel state: {0}")]
    InvalidState(String),

    #[error("Protocol error: {0}")]
    Codec(#[from] CodecError),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

/// State of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not started, or shut down
    Idle,
    /// Waiting for a peer to connect
    Listening,
    /// Outbound connection in progress
    Connecting,
    /// Link established
    Connected,
    /// Peer went away or an error occurred; shutdown is expected next
    Closed,
}

/// Events emitted by channels
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Outbound connection established
    Connected,
    /// A peer connected to a listening channel
    ClientAccepted { remote: SocketAddr },
    /// The peer closed the connection
    ConnectionClosed,
    /// Transport, protocol or handshake failure; treat as connection-ending
    Error(ChannelError),
    /// The last queued control command was sent
    ControlCommandSent,
    /// A control command arrived
    ControlCommandReceived(ControlCommand),
    /// A data message arrived, over either transport
    DataMessageReceived(DataMessage),
}

/// Which end of the link a channel plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Server,
    Client,
}

/// An item waiting to be sent, with its encoded bytes
#[derive(Debug)]
pub(crate) struct Pending<T> {
    pub item: T,
    pub bytes: Bytes,
}

/// A transport together with its ordered send queue
pub(crate) struct Link<T> {
    transport: Arc<dyn Transport>,
    queue: SendQueue<Pending<T>>,
}

impl<T> Link<T> {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            queue: SendQueue::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn receive(&self) -> NetworkResult<()> {
        self.transport.receive()
    }

    /// Queue an item, dispatching it right away if nothing is in flight
    pub fn submit(&mut self, item: T, bytes: Bytes) -> NetworkResult<()> {
        match self.queue.submit(Pending { item, bytes }) {
            Some(next) => self.dispatch(next),
            None => Ok(()),
        }
    }

    /// Handle a send completion. Returns `true` once the queue has drained.
    pub fn on_sent(&mut self) -> NetworkResult<bool> {
        match self.queue.complete() {
            Some(next) => self.dispatch(next).map(|_| false),
            None => Ok(true),
        }
    }

    fn dispatch(&mut self, pending: Pending<T>) -> NetworkResult<()> {
        if let Err(e) = self.transport.send(pending.bytes) {
            self.queue.abort_in_flight();
            return Err(e);
        }
        Ok(())
    }

    /// Drop queued items matching `predicate`; the item in flight is unaffected
    pub fn purge(&mut self, predicate: impl Fn(&T) -> bool) -> usize {
        self.queue.remove_where(|pending| predicate(&pending.item))
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_sending(&self) -> bool {
        self.queue.is_sending()
    }

    /// Abandon queued items and tear down the transport
    pub fn shutdown(mut self) {
        self.queue.clear();
        self.transport.shutdown();
    }
}

/// Applies socket events to a channel's state
pub(crate) trait TransportHandler: Send + Sync + 'static {
    fn handle_transport_event(&self, event: TransportEvent);
}

/// Drain a channel's socket events into its handler until the sockets go
/// away or the channel is dropped.
pub(crate) fn spawn_driver<H: TransportHandler>(
    handler: Weak<H>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(handler) = handler.upgrade() else {
                break;
            };
            handler.handle_transport_event(event);
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Transport that records what it is asked to do
    #[derive(Default)]
    pub struct MockTransport {
        pub connected: AtomicBool,
        pub sent: Mutex<Vec<Bytes>>,
        pub receives: AtomicUsize,
        pub shut_down: AtomicBool,
    }

    impl MockTransport {
        pub fn connected() -> Arc<Self> {
            let mock = Self::default();
            mock.connected.store(true, Ordering::SeqCst);
            Arc::new(mock)
        }

        pub fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }

        pub fn receives(&self) -> usize {
            self.receives.load(Ordering::SeqCst)
        }
    }

    impl Transport for MockTransport {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn send(&self, bytes: Bytes) -> NetworkResult<()> {
            if !self.is_connected() {
                return Err(NetworkError::invalid_state("mock not connected"));
            }
            self.sent.lock().unwrap().push(bytes);
            Ok(())
        }

        fn receive(&self) -> NetworkResult<()> {
            self.receives.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn shutdown(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.shut_down.store(true, Ordering::SeqCst);
        }
    }

    /// Drain every event currently queued
    pub fn drain(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}
