//! Server discovery module
//!
//! A device finds a server on the local network by broadcasting a probe
//! datagram. Every server running a responder answers with the TCP port its
//! control channel listens on.
//!
//! Probe: `MAGIC | 0x01 | version:u16 | nonce:16`
//! Reply: `MAGIC | 0x02 | version:u16 | nonce:16 | port:u16`

use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{DEFAULT_DISCOVERY_PORT, MAGIC_BYTES, PROTOCOL_VERSION};

const PROBE_KIND: u8 = 0x01;
const REPLY_KIND: u8 = 0x02;
const PROBE_LEN: usize = 4 + 1 + 2 + 16;
const REPLY_LEN: usize = PROBE_LEN + 2;
/// Pause after a failed receive before listening again
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,
}

pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Discovery settings shared by client and responder
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Port responders listen on
    pub port: u16,
    /// Where probes are sent
    pub targets: Vec<SocketAddr>,
    /// How long one discovery window stays open
    pub timeout: Duration,
    /// Version carried in probes and replies
    pub protocol_version: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            targets: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                DEFAULT_DISCOVERY_PORT,
            )],
            timeout: Duration::from_secs(3),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

/// A discovery probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub version: u16,
    pub nonce: Uuid,
}

impl Probe {
    pub fn new(version: u16) -> Self {
        Self {
            version,
            nonce: Uuid::new_v4(),
        }
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(PROBE_LEN);
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(PROBE_KIND);
        buf.put_u16(self.version);
        buf.put_slice(self.nonce.as_bytes());
        buf
    }

    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let mut buf = header(datagram, PROBE_KIND, PROBE_LEN)?;
        let version = buf.get_u16();
        let nonce = read_nonce(&mut buf);
        Some(Self { version, nonce })
    }
}

/// A responder's answer to a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub version: u16,
    pub nonce: Uuid,
    /// TCP port of the server's control channel
    pub port: u16,
}

impl Reply {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(REPLY_LEN);
        buf.put_slice(&MAGIC_BYTES);
        buf.put_u8(REPLY_KIND);
        buf.put_u16(self.version);
        buf.put_slice(self.nonce.as_bytes());
        buf.put_u16(self.port);
        buf
    }

    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let mut buf = header(datagram, REPLY_KIND, REPLY_LEN)?;
        let version = buf.get_u16();
        let nonce = read_nonce(&mut buf);
        let port = buf.get_u16();
        Some(Self {
            version,
            nonce,
            port,
        })
    }
}

/// Check magic, kind and exact length; returns the bytes after the kind
fn header(datagram: &[u8], kind: u8, len: usize) -> Option<&[u8]> {
    if datagram.len() != len || datagram[..4] != MAGIC_BYTES || datagram[4] != kind {
        return None;
    }
    Some(&datagram[5..])
}

fn read_nonce(buf: &mut &[u8]) -> Uuid {
    let mut nonce = [0u8; 16];
    buf.copy_to_slice(&mut nonce);
    Uuid::from_bytes(nonce)
}

/// Events from a discovery client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A server answered; one event per reply
    ServerDiscovered { address: SocketAddr },
    /// The window closed without any reply
    TimeoutElapsed,
}

/// Finds servers by broadcasting probes
pub struct DiscoveryClient {
    config: DiscoveryConfig,
    event_tx: mpsc::Sender<DiscoveryEvent>,
    event_rx: Option<mpsc::Receiver<DiscoveryEvent>>,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryClient {
    pub fn new(config: DiscoveryConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(64);
        Self {
            config,
            event_tx,
            event_rx: Some(event_rx),
            task: None,
        }
    }

    /// Take the event receiver
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<DiscoveryEvent>> {
        self.event_rx.take()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Send a probe and open one discovery window.
    ///
    /// Each reply raises `ServerDiscovered`; a window without replies ends
    /// with a single `TimeoutElapsed`.
    pub async fn discover_server(&mut self) -> DiscoveryResult<()> {
        if self.is_running() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        socket.set_broadcast(true)?;

        let probe = Probe::new(self.config.protocol_version);
        let datagram = probe.encode();
        let mut sent = 0;
        for target in &self.config.targets {
            match socket.send_to(&datagram, *target).await {
                Ok(_) => sent += 1,
                Err(e) => tracing::warn!("Failed to send discovery probe to {}: {}", target, e),
            }
        }
        tracing::info!(
            "Sent discovery probe to {} of {} target(s)",
            sent,
            self.config.targets.len()
        );

        let timeout = self.config.timeout;
        let event_tx = self.event_tx.clone();
        self.task = Some(tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + timeout;
            let mut buf = [0u8; 64];
            let mut found = false;

            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => match classify(result, &buf, probe.nonce) {
                        Received::Server { address, version } => {
                            tracing::info!("Discovered server at {} (protocol v{})", address, version);
                            found = true;
                            if event_tx.send(DiscoveryEvent::ServerDiscovered { address }).await.is_err() {
                                return;
                            }
                        }
                        Received::Ignored => {}
                        Received::Failed => {
                            // a persistent socket error must not spin the loop
                            let resume = tokio::time::Instant::now() + RECEIVE_RETRY_DELAY;
                            tokio::time::sleep_until(resume.min(deadline)).await;
                        }
                    },
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }

            if !found {
                tracing::info!("Discovery timed out after {:?}", timeout);
                let _ = event_tx.send(DiscoveryEvent::TimeoutElapsed).await;
            }
        }));
        Ok(())
    }

    /// Close the discovery window early and release the socket
    pub fn shutdown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Outcome of one receive during a discovery window
#[derive(Debug, PartialEq)]
enum Received {
    Server { address: SocketAddr, version: u16 },
    Ignored,
    Failed,
}

fn classify(result: std::io::Result<(usize, SocketAddr)>, buf: &[u8], nonce: Uuid) -> Received {
    let (n, from) = match result {
        Ok(received) => received,
        Err(e) => {
            tracing::debug!("Discovery receive failed: {}", e);
            return Received::Failed;
        }
    };
    let Some(reply) = Reply::decode(&buf[..n.min(buf.len())]) else {
        tracing::debug!("Ignoring stray datagram from {}", from);
        return Received::Ignored;
    };
    if reply.nonce != nonce {
        tracing::debug!("Ignoring reply to another probe from {}", from);
        return Received::Ignored;
    }
    Received::Server {
        address: SocketAddr::new(from.ip(), reply.port),
        version: reply.version,
    }
}

/// Answers discovery probes on behalf of a server
pub struct DiscoveryResponder {
    bind: SocketAddr,
    advertised_port: u16,
    version: u16,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl DiscoveryResponder {
    /// Answer probes arriving on `bind` with `advertised_port`
    pub fn new(bind: SocketAddr, advertised_port: u16, version: u16) -> Self {
        Self {
            bind,
            advertised_port,
            version,
            local_addr: None,
            shutdown_tx: None,
        }
    }

    /// Listen on all interfaces on the configured discovery port
    pub fn from_config(config: &DiscoveryConfig, advertised_port: u16) -> Self {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
        Self::new(bind, advertised_port, config.protocol_version)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Bind and start answering; returns the bound address
    pub async fn start(&mut self) -> DiscoveryResult<SocketAddr> {
        if self.is_running() {
            return Err(DiscoveryError::AlreadyRunning);
        }

        let socket = UdpSocket::bind(self.bind).await?;
        let local_addr = socket.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        let port = self.advertised_port;
        let version = self.version;
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            loop {
                tokio::select! {
                    result = socket.recv_from(&mut buf) => {
                        let (n, from) = match result {
                            Ok(received) => received,
                            Err(e) => {
                                tracing::debug!("Discovery responder receive failed: {}", e);
                                continue;
                            }
                        };
                        let Some(probe) = Probe::decode(&buf[..n]) else {
                            continue;
                        };
                        if probe.version != version {
                            tracing::warn!(
                                "Probe from {} speaks protocol v{}, we speak v{}",
                                from, probe.version, version
                            );
                        }

                        let reply = Reply { version, nonce: probe.nonce, port };
                        match socket.send_to(&reply.encode(), from).await {
                            Ok(_) => tracing::debug!("Answered discovery probe from {}", from),
                            Err(e) => tracing::warn!("Failed to answer probe from {}: {}", from, e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::info!("Discovery responder stopped");
        });

        tracing::info!(
            "Discovery responder on {} advertising port {}",
            local_addr,
            port
        );
        Ok(local_addr)
    }

    /// Stop answering probes
    pub async fn stop(&mut self) -> DiscoveryResult<()> {
        let tx = self.shutdown_tx.take().ok_or(DiscoveryError::NotRunning)?;
        let _ = tx.send(()).await;
        self.local_addr = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio_test::{assert_err, assert_ok};

    fn loopback_client(targets: Vec<SocketAddr>, timeout: Duration) -> DiscoveryClient {
        DiscoveryClient::new(DiscoveryConfig {
            targets,
            timeout,
            ..Default::default()
        })
    }

    async fn responder(advertised_port: u16) -> (DiscoveryResponder, SocketAddr) {
        let mut responder =
            DiscoveryResponder::new("127.0.0.1:0".parse().unwrap(), advertised_port, PROTOCOL_VERSION);
        let addr = responder.start().await.unwrap();
        (responder, addr)
    }

    #[test]
    fn test_probe_and_reply_layout() {
        let probe = Probe::new(2);
        let bytes = probe.encode();
        assert_eq!(bytes.len(), PROBE_LEN);
        assert_eq!(&bytes[..4], b"SLNK");
        assert_eq!(Probe::decode(&bytes), Some(probe));

        let reply = Reply {
            version: 2,
            nonce: probe.nonce,
            port: 24810,
        };
        let bytes = reply.encode();
        assert_eq!(bytes.len(), REPLY_LEN);
        assert_eq!(&bytes[bytes.len() - 2..], &24810u16.to_be_bytes());
        assert_eq!(Reply::decode(&bytes), Some(reply));
    }

    #[test]
    fn test_decode_rejects_foreign_datagrams() {
        let probe = Probe::new(2).encode();
        assert_eq!(Reply::decode(&probe), None);

        let mut bad_magic = probe.clone();
        bad_magic[0] = b'X';
        assert_eq!(Probe::decode(&bad_magic), None);
        assert_eq!(Probe::decode(&probe[..10]), None);
        assert_eq!(Probe::decode(&[]), None);
    }

    #[test]
    fn test_classify_received_datagrams() {
        let probe = Probe::new(PROTOCOL_VERSION);
        let from: SocketAddr = "192.168.1.20:40000".parse().unwrap();
        let reply = Reply {
            version: PROTOCOL_VERSION,
            nonce: probe.nonce,
            port: 24810,
        }
        .encode();

        assert_eq!(
            classify(Ok((reply.len(), from)), &reply, probe.nonce),
            Received::Server {
                address: "192.168.1.20:24810".parse().unwrap(),
                version: PROTOCOL_VERSION,
            }
        );
        assert_eq!(
            classify(Ok((reply.len(), from)), &reply, Uuid::new_v4()),
            Received::Ignored
        );
        let stray = b"hello";
        assert_eq!(classify(Ok((stray.len(), from)), stray, probe.nonce), Received::Ignored);

        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(classify(Err(refused), &[], probe.nonce), Received::Failed);
    }

    #[tokio::test]
    async fn test_no_reply_raises_single_timeout() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = silent.local_addr().unwrap();

        let mut client = loopback_client(vec![target], Duration::from_millis(200));
        let mut events = client.take_event_receiver().unwrap();
        client.discover_server().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(DiscoveryEvent::TimeoutElapsed));

        let more = tokio::time::timeout(Duration::from_millis(300), events.recv()).await;
        assert!(more.is_err(), "exactly one event expected");
    }

    #[tokio::test]
    async fn test_two_servers_raise_two_events() {
        let (mut first, first_addr) = responder(5001).await;
        let (mut second, second_addr) = responder(5002).await;

        let mut client = loopback_client(vec![first_addr, second_addr], Duration::from_millis(500));
        let mut events = client.take_event_receiver().unwrap();
        client.discover_server().await.unwrap();

        let mut found = HashSet::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap();
            match event {
                Some(DiscoveryEvent::ServerDiscovered { address }) => {
                    found.insert(address);
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
        let expected: HashSet<SocketAddr> = ["127.0.0.1:5001", "127.0.0.1:5002"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(found, expected);

        // replies arrived, so the window closes without a timeout event
        let more = tokio::time::timeout(Duration::from_secs(1), events.recv()).await;
        assert!(more.is_err());

        assert_ok!(first.stop().await);
        assert_ok!(second.stop().await);
        let err = assert_err!(first.stop().await);
        assert!(matches!(err, DiscoveryError::NotRunning));
    }

    #[tokio::test]
    async fn test_reply_to_other_probe_is_ignored() {
        let impostor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = impostor.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            if let Ok((_, from)) = impostor.recv_from(&mut buf).await {
                let reply = Reply {
                    version: PROTOCOL_VERSION,
                    nonce: Uuid::new_v4(),
                    port: 1234,
                };
                let _ = impostor.send_to(&reply.encode(), from).await;
            }
        });

        let mut client = loopback_client(vec![target], Duration::from_millis(300));
        let mut events = client.take_event_receiver().unwrap();
        client.discover_server().await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(DiscoveryEvent::TimeoutElapsed));
    }

    #[tokio::test]
    async fn test_second_window_while_running_is_rejected() {
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut client =
            loopback_client(vec![silent.local_addr().unwrap()], Duration::from_secs(5));
        assert_ok!(client.discover_server().await);
        let err = assert_err!(client.discover_server().await);
        assert!(matches!(err, DiscoveryError::AlreadyRunning));
        client.shutdown();
        assert!(!client.is_running());
    }
}
