//! Control channel: ordered delivery of control commands over TCP
//!
//! The server end pushes a configuration command carrying its protocol
//! version as the first item after a device connects. The device end checks
//! that version against its own before passing any configuration on.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{
    spawn_driver, ChannelError, ChannelEvent, ChannelResult, ChannelState, Link, Reassembler,
    Role, TransportHandler,
};
use crate::network::{
    lock, Endpoint, EventSink, NetworkConfig, NetworkError, SocketEvent, TcpSocket, Transport,
    TransportEvent, TransportKind,
};
use crate::protocol::{encode_frame, ControlCommand, ControllerConfiguration};

/// Fail with `VersionMismatch` unless both ends speak the same protocol
pub fn check_version(server: u16, client: u16) -> ChannelResult<()> {
    if server != client {
        return Err(ChannelError::VersionMismatch { server, client });
    }
    Ok(())
}

struct ControlState {
    role: Option<Role>,
    state: ChannelState,
    link: Option<Link<ControlCommand>>,
    socket: Option<Arc<TcpSocket>>,
    reassembler: Reassembler,
    driver: Option<JoinHandle<()>>,
}

impl ControlState {
    fn new() -> Self {
        Self {
            role: None,
            state: ChannelState::Idle,
            link: None,
            socket: None,
            reassembler: Reassembler::new(),
            driver: None,
        }
    }
}

struct ControlInner {
    config: NetworkConfig,
    handshake: ControllerConfiguration,
    state: Mutex<ControlState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl ControlInner {
    fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    fn fail(&self, state: &mut ControlState, error: ChannelError) {
        tracing::warn!("Control channel error: {}", error);
        state.state = ChannelState::Closed;
        self.emit(ChannelEvent::Error(error));
    }

    fn arm_receive(&self, state: &mut ControlState) {
        let result = match &state.link {
            Some(link) => link.receive(),
            None => return,
        };
        if let Err(e) = result {
            self.fail(state, e.into());
        }
    }

    fn on_received(&self, state: &mut ControlState, bytes: &[u8]) {
        for result in state.reassembler.feed::<ControlCommand>(bytes) {
            match result {
                Ok(command) => self.on_command(state, command),
                Err(e) => {
                    tracing::warn!("Dropping malformed control frame: {}", e);
                    self.emit(ChannelEvent::Error(e.into()));
                }
            }
        }
    }

    fn on_command(&self, state: &ControlState, command: ControlCommand) {
        tracing::debug!("Received control command {:?}", command);

        if let (Some(Role::Client), ControlCommand::Configure(config)) = (state.role, &command) {
            if let Err(e) = check_version(config.server_version, self.config.protocol_version) {
                tracing::error!("Handshake failed: {}", e);
                self.emit(ChannelEvent::Error(e));
                return;
            }
            tracing::info!("Handshake complete (protocol v{})", config.server_version);
        }

        self.emit(ChannelEvent::ControlCommandReceived(command));
    }

    fn submit(&self, state: &mut ControlState, command: ControlCommand) -> ChannelResult<()> {
        let link = state
            .link
            .as_mut()
            .filter(|link| link.is_connected())
            .ok_or_else(|| ChannelError::InvalidState("control channel is not connected".into()))?;

        let mut buf = BytesMut::new();
        encode_frame(&command, &mut buf)?;
        tracing::trace!("Queueing control command {:?}", command);
        link.submit(command, buf.freeze())?;
        Ok(())
    }
}

impl TransportHandler for ControlInner {
    fn handle_transport_event(&self, event: TransportEvent) {
        let mut state = lock(&self.state);

        match event.event {
            SocketEvent::Connected => {
                state.state = ChannelState::Connected;
                self.emit(ChannelEvent::Connected);
                self.arm_receive(&mut state);
            }
            SocketEvent::ClientAccepted { remote } => {
                state.state = ChannelState::Connected;
                self.emit(ChannelEvent::ClientAccepted { remote });
                self.arm_receive(&mut state);

                if state.role == Some(Role::Server) {
                    let handshake = ControlCommand::Configure(self.handshake.clone());
                    if let Err(e) = self.submit(&mut state, handshake) {
                        self.fail(&mut state, e);
                    }
                }
            }
            SocketEvent::DataSent => {
                let Some(link) = state.link.as_mut() else {
                    return;
                };
                match link.on_sent() {
                    Ok(true) => self.emit(ChannelEvent::ControlCommandSent),
                    Ok(false) => {}
                    Err(e) => self.fail(&mut state, e.into()),
                }
            }
            SocketEvent::DataReceived(bytes) => {
                self.on_received(&mut state, &bytes);
                self.arm_receive(&mut state);
            }
            SocketEvent::ConnectionClosed => {
                tracing::info!("Control connection closed by peer");
                state.state = ChannelState::Closed;
                self.emit(ChannelEvent::ConnectionClosed);
            }
            SocketEvent::Error(e) => self.fail(&mut state, e.into()),
        }
    }
}

/// TCP channel carrying control commands from the PC to the device
pub struct ControlChannel {
    inner: Arc<ControlInner>,
    event_rx: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
}

impl ControlChannel {
    /// Create an idle channel.
    ///
    /// `handshake` is what a listening channel pushes to each device it
    /// accepts; a connecting channel checks incoming configurations against
    /// `config.protocol_version`.
    pub fn new(config: NetworkConfig, handshake: ControllerConfiguration) -> Self {
        let (events, event_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(ControlInner {
                config,
                handshake,
                state: Mutex::new(ControlState::new()),
                events,
            }),
            event_rx: Some(event_rx),
        }
    }

    /// Take the receiver for channel events (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.event_rx.take()
    }

    /// Wait for one device on `local`. Must be called within a tokio runtime.
    pub fn listen(&self, local: &Endpoint) -> ChannelResult<()> {
        self.start(Role::Server, |socket| socket.listen(local))
    }

    /// Connect to a server at `remote`. Must be called within a tokio runtime.
    pub fn connect(&self, remote: &Endpoint) -> ChannelResult<()> {
        self.start(Role::Client, |socket| socket.connect(remote))
    }

    fn start(
        &self,
        role: Role,
        open: impl FnOnce(&TcpSocket) -> Result<(), NetworkError>,
    ) -> ChannelResult<()> {
        let mut state = lock(&self.inner.state);
        if state.link.is_some() {
            return Err(ChannelError::InvalidState(
                "control channel already started; shut it down first".into(),
            ));
        }

        let (sink, socket_events) = EventSink::channel(TransportKind::Tcp);
        let socket = Arc::new(TcpSocket::new(sink)?);
        open(&socket)?;

        attach_locked(&mut state, socket.clone(), role);
        state.state = match role {
            Role::Server => ChannelState::Listening,
            Role::Client => ChannelState::Connecting,
        };
        state.socket = Some(socket);
        state.driver = Some(spawn_driver(Arc::downgrade(&self.inner), socket_events));
        Ok(())
    }

    /// Queue a command for delivery.
    ///
    /// Fails with `InvalidState` when not connected; the queue is untouched
    /// in that case.
    pub fn send(&self, command: ControlCommand) -> ChannelResult<()> {
        let mut state = lock(&self.inner.state);
        self.inner.submit(&mut state, command)
    }

    /// Abandon queued commands and release the socket. Idempotent.
    pub fn shutdown(&self) {
        let mut state = lock(&self.inner.state);
        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        if let Some(link) = state.link.take() {
            tracing::debug!("Shutting down control channel ({:?})", state.state);
            link.shutdown();
        }
        state.socket = None;
        state.role = None;
        state.reassembler.clear();
        state.state = ChannelState::Idle;
    }

    pub fn state(&self) -> ChannelState {
        lock(&self.inner.state).state
    }

    /// Commands waiting behind the one in flight
    pub fn pending(&self) -> usize {
        lock(&self.inner.state)
            .link
            .as_ref()
            .map_or(0, |link| link.pending())
    }

    pub fn is_sending(&self) -> bool {
        lock(&self.inner.state)
            .link
            .as_ref()
            .is_some_and(|link| link.is_sending())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.state)
            .socket
            .as_ref()
            .and_then(|socket| socket.local_addr())
    }

    /// Drive the channel through `transport` instead of a real socket
    #[cfg(test)]
    pub(crate) fn attach(&self, transport: Arc<dyn Transport>, role: Role) {
        let mut state = lock(&self.inner.state);
        attach_locked(&mut state, transport, role);
    }

    #[cfg(test)]
    pub(crate) fn inject(&self, source: TransportKind, event: SocketEvent) {
        self.inner
            .handle_transport_event(TransportEvent { source, event });
    }
}

fn attach_locked(state: &mut ControlState, transport: Arc<dyn Transport>, role: Role) {
    state.state = if transport.is_connected() {
        ChannelState::Connected
    } else {
        ChannelState::Idle
    };
    state.link = Some(Link::new(transport));
    state.role = Some(role);
    state.reassembler.clear();
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{drain, MockTransport};
    use crate::protocol::{decode_exact, DataType};
    use bytes::Bytes;
    use std::sync::atomic::Ordering;

    fn encoded(command: &ControlCommand) -> Bytes {
        let mut buf = BytesMut::new();
        encode_frame(command, &mut buf).unwrap();
        buf.freeze()
    }

    fn channel(version: u16) -> (ControlChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
        let mut channel = ControlChannel::new(
            NetworkConfig::default().with_protocol_version(version),
            ControllerConfiguration::new(version),
        );
        let rx = channel.take_event_receiver().unwrap();
        (channel, rx)
    }

    #[test]
    fn test_commands_go_out_in_order_one_at_a_time() {
        let (channel, mut rx) = channel(2);
        let mock = MockTransport::connected();
        channel.attach(mock.clone(), Role::Server);

        let commands = vec![
            ControlCommand::Start(DataType::Accelerometer),
            ControlCommand::Start(DataType::Gyroscope),
            ControlCommand::Stop(DataType::Accelerometer),
        ];
        for command in &commands {
            channel.send(command.clone()).unwrap();
        }
        assert_eq!(mock.sent().len(), 1);
        assert_eq!(channel.pending(), 2);
        assert!(channel.is_sending());

        for _ in 0..3 {
            channel.inject(TransportKind::Tcp, SocketEvent::DataSent);
        }

        let sent: Vec<Bytes> = mock.sent();
        let expected: Vec<Bytes> = commands.iter().map(encoded).collect();
        assert_eq!(sent, expected);
        assert!(!channel.is_sending());

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChannelEvent::ControlCommandSent));
    }

    #[test]
    fn test_send_while_disconnected_leaves_queue_unchanged() {
        let (channel, _rx) = channel(2);
        let err = channel
            .send(ControlCommand::Start(DataType::Compass))
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidState(_)));

        let mock = Arc::new(MockTransport::default());
        channel.attach(mock.clone(), Role::Server);
        let before = channel.pending();
        let err = channel
            .send(ControlCommand::Start(DataType::Compass))
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidState(_)));
        assert_eq!(channel.pending(), before);
        assert!(!channel.is_sending());
        assert!(mock.sent().is_empty());
    }

    #[test]
    fn test_send_after_disconnect_keeps_queued_commands() {
        let (channel, _rx) = channel(2);
        let mock = MockTransport::connected();
        channel.attach(mock.clone(), Role::Server);

        channel.send(ControlCommand::Start(DataType::Touch)).unwrap();
        channel.send(ControlCommand::Start(DataType::Pinch)).unwrap();
        channel.send(ControlCommand::Stop(DataType::Touch)).unwrap();
        assert_eq!(channel.pending(), 2);

        mock.connected.store(false, Ordering::SeqCst);
        let err = channel
            .send(ControlCommand::Stop(DataType::Pinch))
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidState(_)));
        assert_eq!(channel.pending(), 2);
        assert!(channel.is_sending());
        assert_eq!(mock.sent().len(), 1);
    }

    #[test]
    fn test_version_mismatch_is_reported() {
        let (channel, mut rx) = channel(2);
        channel.attach(MockTransport::connected(), Role::Client);

        let configure = ControlCommand::Configure(ControllerConfiguration::new(3));
        channel.inject(TransportKind::Tcp, SocketEvent::DataReceived(encoded(&configure)));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChannelEvent::Error(ChannelError::VersionMismatch { server, client }) => {
                assert_eq!((*server, *client), (3, 2));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_matching_version_is_accepted() {
        let (channel, mut rx) = channel(2);
        channel.attach(MockTransport::connected(), Role::Client);

        let configure = ControlCommand::Configure(ControllerConfiguration::new(2));
        channel.inject(TransportKind::Tcp, SocketEvent::DataReceived(encoded(&configure)));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChannelEvent::ControlCommandReceived(command) => assert_eq!(command, &configure),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_server_pushes_configuration_on_accept() {
        let (channel, mut rx) = channel(2);
        let mock = MockTransport::connected();
        channel.attach(mock.clone(), Role::Server);

        let remote: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        channel.inject(TransportKind::Tcp, SocketEvent::ClientAccepted { remote });

        let sent = mock.sent();
        assert_eq!(sent.len(), 1);
        let first: ControlCommand = decode_exact(&sent[0]).unwrap();
        assert_eq!(
            first,
            ControlCommand::Configure(ControllerConfiguration::new(2))
        );
        assert_eq!(mock.receives(), 1);
        assert_eq!(channel.state(), ChannelState::Connected);

        let events = drain(&mut rx);
        assert!(matches!(events[0], ChannelEvent::ClientAccepted { remote: r } if r == remote));
    }

    #[test]
    fn test_split_commands_are_reassembled() {
        let (channel, mut rx) = channel(2);
        let mock = MockTransport::connected();
        channel.attach(mock.clone(), Role::Client);

        let commands = vec![
            ControlCommand::Start(DataType::Touch),
            ControlCommand::Configure(ControllerConfiguration::new(2).with_tracing("http://diag")),
            ControlCommand::Stop(DataType::Touch),
        ];
        let mut wire = BytesMut::new();
        for command in &commands {
            encode_frame(command, &mut wire).unwrap();
        }
        let wire = wire.freeze();

        for chunk in [wire.slice(..1), wire.slice(1..7), wire.slice(7..)] {
            channel.inject(TransportKind::Tcp, SocketEvent::DataReceived(chunk));
        }

        let received: Vec<ControlCommand> = drain(&mut rx)
            .into_iter()
            .map(|event| match event {
                ChannelEvent::ControlCommandReceived(command) => command,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(received, commands);
        assert_eq!(mock.receives(), 3);
    }

    #[test]
    fn test_shutdown_clears_queue() {
        let (channel, _rx) = channel(2);
        let mock = MockTransport::connected();
        channel.attach(mock.clone(), Role::Server);
        channel.send(ControlCommand::Start(DataType::Tap)).unwrap();
        channel.send(ControlCommand::Start(DataType::Hold)).unwrap();

        channel.shutdown();
        channel.shutdown();
        assert_eq!(channel.pending(), 0);
        assert!(!channel.is_sending());
        assert_eq!(channel.state(), ChannelState::Idle);
        assert!(mock.shut_down.load(Ordering::SeqCst));
    }

    #[test]
    fn test_peer_close_is_reported() {
        let (channel, mut rx) = channel(2);
        channel.attach(MockTransport::connected(), Role::Client);
        channel.inject(TransportKind::Tcp, SocketEvent::ConnectionClosed);

        assert_eq!(channel.state(), ChannelState::Closed);
        let events = drain(&mut rx);
        assert!(matches!(events[0], ChannelEvent::ConnectionClosed));
    }

    #[test]
    fn test_check_version() {
        assert!(check_version(2, 2).is_ok());
        assert!(matches!(
            check_version(3, 2),
            Err(ChannelError::VersionMismatch { server: 3, client: 2 })
        ));
    }
}
