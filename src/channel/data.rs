//! Data channel: sensor and gesture messages over TCP and UDP
//!
//! The TCP stream always exists. Once it is up, both ends open a UDP socket
//! on the same addresses so continuous streams can skip TCP's ordering and
//! retransmission. Whatever arrives on either socket is delivered as one
//! stream of `DataMessageReceived` events.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};

use super::{
    spawn_driver, Admission, ChannelError, ChannelEvent, ChannelResult, ChannelState, Link,
    Reassembler, Role, StreamKey, Throttle, TransportHandler,
};
use crate::network::{
    lock, Endpoint, EventSink, NetworkConfig, NetworkError, SocketEvent, TcpSocket, Transport,
    TransportEvent, TransportKind, UdpSocket,
};
use crate::protocol::{DataFrame, DataMessage, DataType, TextAssembler};

/// Which transport a message travels on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// TCP: ordered, retransmitted, any size
    Reliable,
    /// UDP: one datagram, may be lost or reordered
    BestEffort,
}

impl Delivery {
    /// Encode `message` for this transport
    fn encode(self, message: &DataMessage) -> ChannelResult<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Delivery::Reliable => message.encode(&mut buf).map(|_| ())?,
            Delivery::BestEffort => message.encode_datagram(&mut buf)?,
        }
        Ok(buf.freeze())
    }
}

/// A sample held back by the throttle and the timer that will release it
struct Deferred {
    delivery: Delivery,
    timer: Option<AbortHandle>,
}

struct DataState {
    role: Option<Role>,
    state: ChannelState,
    tcp: Option<Link<DataMessage>>,
    udp: Option<Link<DataMessage>>,
    tcp_socket: Option<Arc<TcpSocket>>,
    /// Server endpoint a connecting channel aims its UDP socket at
    remote: Option<Endpoint>,
    /// Feeds the driver; UDP sockets opened later report through it too
    socket_events: Option<mpsc::UnboundedSender<TransportEvent>>,
    runtime: Option<Handle>,
    reassembler: Reassembler,
    text: TextAssembler,
    throttle: Throttle,
    deferred: HashMap<StreamKey, Deferred>,
    driver: Option<JoinHandle<()>>,
}

impl DataState {
    fn udp_ready(&self) -> bool {
        self.udp.as_ref().is_some_and(|link| link.is_connected())
    }

    fn tcp_ready(&self) -> bool {
        self.tcp.as_ref().is_some_and(|link| link.is_connected())
    }

    /// Pick the transport for `data_type`, honouring a forced choice
    fn route(&self, data_type: DataType, forced: Option<Delivery>) -> ChannelResult<Delivery> {
        match forced {
            Some(Delivery::BestEffort) if !self.udp_ready() => Err(ChannelError::InvalidState(
                "no UDP path on this data channel".into(),
            )),
            Some(delivery) => Ok(delivery),
            None if data_type.is_continuous() && self.udp_ready() => Ok(Delivery::BestEffort),
            None => Ok(Delivery::Reliable),
        }
    }

    fn dispatch(
        &mut self,
        message: DataMessage,
        bytes: Bytes,
        delivery: Delivery,
    ) -> ChannelResult<()> {
        let link = match delivery {
            Delivery::Reliable => self.tcp.as_mut(),
            Delivery::BestEffort => self.udp.as_mut(),
        };
        let link = link
            .ok_or_else(|| ChannelError::InvalidState("transport went away".into()))?;
        tracing::trace!("Queueing {} via {:?}", message.data_type(), delivery);
        link.submit(message, bytes)?;
        Ok(())
    }

    /// Forget the flush scheduled for `key`, returning the delivery it was
    /// queued with
    fn take_deferred(&mut self, key: &StreamKey) -> Delivery {
        match self.deferred.remove(key) {
            Some(Deferred { delivery, timer }) => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                delivery
            }
            None => Delivery::Reliable,
        }
    }

    /// Queue a sample the throttle held back; UDP samples fall back to TCP
    /// when the UDP path has gone away meanwhile
    fn release(&mut self, message: DataMessage, delivery: Delivery) -> ChannelResult<()> {
        let delivery = match delivery {
            Delivery::BestEffort if !self.udp_ready() => Delivery::Reliable,
            delivery => delivery,
        };
        let bytes = delivery.encode(&message)?;
        self.dispatch(message, bytes, delivery)
    }

    fn cancel_timers(&mut self) {
        for (_, deferred) in self.deferred.drain() {
            if let Some(timer) = deferred.timer {
                timer.abort();
            }
        }
    }

    fn close_udp(&mut self) {
        if let Some(udp) = self.udp.take() {
            udp.shutdown();
        }
    }
}

struct DataInner {
    config: NetworkConfig,
    state: Mutex<DataState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl DataInner {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, state: &mut DataState, error: ChannelError) {
        tracing::warn!("Data channel error: {}", error);
        state.state = ChannelState::Closed;
        self.emit(ChannelEvent::Error(error));
    }

    /// A UDP failure only costs the UDP path; TCP keeps carrying everything
    fn fail_udp(&self, state: &mut DataState, error: NetworkError) {
        tracing::warn!("UDP path lost, falling back to TCP: {}", error);
        state.close_udp();
        self.emit(ChannelEvent::Error(error.into()));
    }

    fn arm(&self, state: &mut DataState, source: TransportKind) {
        let link = match source {
            TransportKind::Tcp => state.tcp.as_ref(),
            TransportKind::Udp => state.udp.as_ref(),
        };
        let Some(result) = link.map(|link| link.receive()) else {
            return;
        };
        if let Err(e) = result {
            match source {
                TransportKind::Tcp => self.fail(state, e.into()),
                TransportKind::Udp => self.fail_udp(state, e),
            }
        }
    }

    /// Open the UDP path once TCP is up: bind `local`, send to `remote`
    fn open_udp(&self, state: &mut DataState, local: Endpoint, remote: Endpoint) {
        if !self.config.enable_udp || state.udp.is_some() {
            return;
        }
        let Some(tx) = state.socket_events.clone() else {
            return;
        };

        let socket = match UdpSocket::new(EventSink::new(TransportKind::Udp, tx)) {
            Ok(socket) => socket,
            Err(e) => return self.fail_udp(state, e),
        };
        if let Err(e) = socket.initialize(&local, &remote) {
            return self.fail_udp(state, e);
        }
        if !socket.is_initialized() {
            // bind failure arrives as an error event
            return;
        }

        tracing::info!("UDP path {} -> {}", local, remote);
        state.udp = Some(Link::new(Arc::new(socket)));
        self.arm(state, TransportKind::Udp);
    }

    fn on_received(&self, state: &mut DataState, source: TransportKind, bytes: &[u8]) {
        match source {
            TransportKind::Tcp => {
                for frame in state.reassembler.feed::<DataFrame>(bytes) {
                    match frame.and_then(|frame| state.text.accept(frame)) {
                        Ok(Some(message)) => self.emit(ChannelEvent::DataMessageReceived(message)),
                        Ok(None) => {}
                        Err(e) => {
                            tracing::warn!("Dropping malformed data frame: {}", e);
                            self.emit(ChannelEvent::Error(e.into()));
                        }
                    }
                }
            }
            TransportKind::Udp => match DataMessage::decode_datagram(bytes) {
                Ok(message) => self.emit(ChannelEvent::DataMessageReceived(message)),
                Err(e) => {
                    tracing::warn!("Dropping malformed datagram: {}", e);
                    self.emit(ChannelEvent::Error(e.into()));
                }
            },
        }
    }

    fn on_sent(&self, state: &mut DataState, source: TransportKind) {
        let link = match source {
            TransportKind::Tcp => state.tcp.as_mut(),
            TransportKind::Udp => state.udp.as_mut(),
        };
        let Some(Err(e)) = link.map(|link| link.on_sent()) else {
            return;
        };
        match source {
            TransportKind::Tcp => self.fail(state, e.into()),
            TransportKind::Udp => self.fail_udp(state, e),
        }
    }

    fn submit(
        self: &Arc<Self>,
        state: &mut DataState,
        message: DataMessage,
        forced: Option<Delivery>,
    ) -> ChannelResult<()> {
        if !state.tcp_ready() {
            return Err(ChannelError::InvalidState(
                "data channel is not connected".into(),
            ));
        }

        let data_type = message.data_type();
        let delivery = state.route(data_type, forced)?;
        let bytes = delivery.encode(&message)?;

        match state.throttle.admit(message, Instant::now()) {
            Admission::Send { flushed, message } => {
                for (key, held) in flushed {
                    let held_delivery = state.take_deferred(&key);
                    state.release(held, held_delivery)?;
                }
                state.dispatch(message, bytes, delivery)
            }
            Admission::Deferred { key, until } => {
                let timer = self.schedule_flush(state, key, until);
                state.deferred.insert(key, Deferred { delivery, timer });
                Ok(())
            }
            Admission::Coalesced { key } => {
                if let Some(deferred) = state.deferred.get_mut(&key) {
                    deferred.delivery = delivery;
                }
                Ok(())
            }
        }
    }

    fn schedule_flush(
        self: &Arc<Self>,
        state: &DataState,
        key: StreamKey,
        until: Instant,
    ) -> Option<AbortHandle> {
        let runtime = state.runtime.as_ref()?;
        let inner: Weak<Self> = Arc::downgrade(self);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(until)).await;
            if let Some(inner) = inner.upgrade() {
                inner.flush_deferred(key);
            }
        });
        Some(handle.abort_handle())
    }

    fn flush_deferred(&self, key: StreamKey) {
        let mut state = lock(&self.state);
        // this runs on the timer task itself, so the handle is dropped, not aborted
        let Some(deferred) = state.deferred.remove(&key) else {
            return;
        };
        let Some(message) = state.throttle.take_due(key, Instant::now()) else {
            return;
        };
        if !state.tcp_ready() {
            return;
        }

        if let Err(e) = state.release(message, deferred.delivery) {
            self.fail(&mut state, e);
        }
    }

    fn handle(self: &Arc<Self>, event: TransportEvent) {
        let mut state = lock(&self.state);
        let source = event.source;

        match event.event {
            SocketEvent::Connected => {
                state.state = ChannelState::Connected;
                self.emit(ChannelEvent::Connected);
                self.arm(&mut state, TransportKind::Tcp);

                let local = state.tcp_socket.as_ref().and_then(|s| s.local_addr());
                if let (Some(Role::Client), Some(local), Some(remote)) =
                    (state.role, local, state.remote)
                {
                    self.open_udp(&mut state, local.into(), remote);
                }
            }
            SocketEvent::ClientAccepted { remote } => {
                state.state = ChannelState::Connected;
                self.emit(ChannelEvent::ClientAccepted { remote });
                self.arm(&mut state, TransportKind::Tcp);

                let local = state.tcp_socket.as_ref().and_then(|s| s.local_addr());
                if let (Some(Role::Server), Some(local)) = (state.role, local) {
                    self.open_udp(&mut state, local.into(), remote.into());
                }
            }
            SocketEvent::DataSent => self.on_sent(&mut state, source),
            SocketEvent::DataReceived(bytes) => {
                self.on_received(&mut state, source, &bytes);
                self.arm(&mut state, source);
            }
            SocketEvent::ConnectionClosed => {
                tracing::info!("Data connection closed by peer");
                state.state = ChannelState::Closed;
                self.emit(ChannelEvent::ConnectionClosed);
            }
            SocketEvent::Error(e) => match source {
                TransportKind::Tcp => self.fail(&mut state, e.into()),
                TransportKind::Udp => self.fail_udp(&mut state, e),
            },
        }
    }
}

/// Driver entry point; the handler needs an owning handle to open UDP and
/// arm throttle timers.
struct DataHandler(Weak<DataInner>);

impl TransportHandler for DataHandler {
    fn handle_transport_event(&self, event: TransportEvent) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle(event);
        }
    }
}

/// Channel carrying data messages from the device to the PC
pub struct DataChannel {
    inner: Arc<DataInner>,
    handler: Arc<DataHandler>,
    event_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
}

impl DataChannel {
    pub fn new(config: NetworkConfig) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        let throttle = Throttle::new(config.min_interval);
        let inner = Arc::new(DataInner {
            config,
            state: Mutex::new(DataState {
                role: None,
                state: ChannelState::Idle,
                tcp: None,
                udp: None,
                tcp_socket: None,
                remote: None,
                socket_events: None,
                runtime: None,
                reassembler: Reassembler::new(),
                text: TextAssembler::new(),
                throttle,
                deferred: HashMap::new(),
                driver: None,
            }),
            events,
        });
        let handler = Arc::new(DataHandler(Arc::downgrade(&inner)));

        Self {
            inner,
            handler,
            event_rx: Some(event_rx),
        }
    }

    /// Take the receiver for channel events (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.event_rx.take()
    }

    /// Wait for one device on `local`. Must be called within a tokio runtime.
    pub fn listen(&self, local: &Endpoint) -> ChannelResult<()> {
        self.start(Role::Server, None, |socket| socket.listen(local))
    }

    /// Connect to a server at `remote`. Must be called within a tokio runtime.
    pub fn connect(&self, remote: &Endpoint) -> ChannelResult<()> {
        self.start(Role::Client, Some(*remote), |socket| socket.connect(remote))
    }

    fn start(
        &self,
        role: Role,
        remote: Option<Endpoint>,
        open: impl FnOnce(&TcpSocket) -> Result<(), NetworkError>,
    ) -> ChannelResult<()> {
        let mut state = lock(&self.inner.state);
        if state.tcp.is_some() {
            return Err(ChannelError::InvalidState(
                "data channel already started; shut it down first".into(),
            ));
        }

        let (tx, socket_events) = mpsc::unbounded_channel();
        let socket = Arc::new(TcpSocket::new(EventSink::new(TransportKind::Tcp, tx.clone()))?);
        open(&socket)?;

        attach_locked(&mut state, socket.clone(), None, role);
        state.state = match role {
            Role::Server => ChannelState::Listening,
            Role::Client => ChannelState::Connecting,
        };
        state.tcp_socket = Some(socket);
        state.remote = remote;
        state.socket_events = Some(tx);
        state.driver = Some(spawn_driver(Arc::downgrade(&self.handler), socket_events));
        Ok(())
    }

    /// Queue a message. Continuous streams go over UDP when it is up,
    /// everything else over TCP.
    ///
    /// Fails with `InvalidState` when not connected, or with a codec error
    /// when the message cannot be encoded; nothing is queued in either case.
    pub fn send(&self, message: DataMessage) -> ChannelResult<()> {
        let mut state = lock(&self.inner.state);
        self.inner.submit(&mut state, message, None)
    }

    /// Queue a message on a specific transport
    pub fn send_with(&self, message: DataMessage, delivery: Delivery) -> ChannelResult<()> {
        let mut state = lock(&self.inner.state);
        self.inner.submit(&mut state, message, Some(delivery))
    }

    /// Drop every queued message of `data_type`, including samples held back
    /// by the throttle. Messages already handed to a socket still go out.
    pub fn purge_from_queue(&self, data_type: DataType) -> usize {
        let mut state = lock(&self.inner.state);
        let matches = |message: &DataMessage| message.data_type() == data_type;

        let mut removed = 0;
        if let Some(tcp) = state.tcp.as_mut() {
            removed += tcp.purge(matches);
        }
        if let Some(udp) = state.udp.as_mut() {
            removed += udp.purge(matches);
        }
        removed += state.throttle.discard(data_type);
        state.deferred.retain(|key, deferred| {
            if key.data_type != data_type {
                return true;
            }
            if let Some(timer) = deferred.timer.take() {
                timer.abort();
            }
            false
        });

        tracing::debug!("Purged {} queued {} message(s)", removed, data_type);
        removed
    }

    /// Abandon queued messages and release both sockets. Idempotent.
    pub fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        state.cancel_timers();
        state.close_udp();
        if let Some(tcp) = state.tcp.take() {
            tracing::debug!("Shutting down data channel ({:?})", state.state);
            tcp.shutdown();
        }
        state.tcp_socket = None;
        state.remote = None;
        state.socket_events = None;
        state.runtime = None;
        state.role = None;
        state.reassembler.clear();
        state.text.clear();
        state.throttle.clear();
        state.state = ChannelState::Idle;
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner.state).state
    }

    /// Whether the UDP path is up
    pub fn has_udp(&self) -> bool {
        lock(&self.inner.state).udp_ready()
    }

    /// Messages waiting behind the ones in flight, across both transports
    pub fn pending(&self) -> usize {
        let state = lock(&self.inner.state);
        let tcp = state.tcp.as_ref().map_or(0, |link| link.pending());
        let udp = state.udp.as_ref().map_or(0, |link| link.pending());
        tcp + udp
    }

    pub fn is_sending(&self) -> bool {
        let state = lock(&self.inner.state);
        let tcp = state.tcp.as_ref().is_some_and(|link| link.is_sending());
        let udp = state.udp.as_ref().is_some_and(|link| link.is_sending());
        tcp || udp
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.state)
            .tcp_socket
            .as_ref()
            .and_then(|socket| socket.local_addr())
    }

    /// Drive the channel through mock transports instead of real sockets
    #[cfg(test)]
    pub(crate) fn attach(
        &self,
        tcp: Arc<dyn Transport>,
        udp: Option<Arc<dyn Transport>>,
        role: Role,
    ) {
        let mut state = lock(&self.inner.state);
        attach_locked(&mut state, tcp, udp, role);
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, source: TransportKind, event: SocketEvent) {
        self.inner.handle(TransportEvent { source, event });
    }
}

fn attach_locked(
    state: &mut DataState,
    tcp: Arc<dyn Transport>,
    udp: Option<Arc<dyn Transport>>,
    role: Role,
) {
    state.state = if tcp.is_connected() {
        ChannelState::Connected
    } else {
        ChannelState::Idle
    };
    state.tcp = Some(Link::new(tcp));
    state.udp = udp.map(Link::new);
    state.role = Some(role);
    state.runtime = Handle::try_current().ok();
    state.reassembler.clear();
    state.text.clear();
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}
