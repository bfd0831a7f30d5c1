//! In-memory transport with a scripted server
//!
//! [`MockServer`] answers login, heartbeat and message-send requests with
//! configurable result codes, records everything it receives, and can refuse
//! endpoints, delay connects, drop the live connection or push packets.
//! [`MockTransport`] connects the engine to it without sockets, so tests can
//! run under paused tokio time.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use imwire_core::{
    CodecConfig, Endpoint, Frame, PacketDecoder, PacketEncoder, ProtocolConfig, SsoPacket,
    TransportError,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{Connection, Transport};

// ----------------------------------------------------------------------------
// Mock Server
// ----------------------------------------------------------------------------

struct Link {
    id: u64,
    endpoint: Endpoint,
    outbound: mpsc::UnboundedSender<Frame>,
}

struct ServerState {
    protocol: ProtocolConfig,
    refused: HashSet<Endpoint>,
    refuse_all: bool,
    fail_next_connects: u32,
    connect_delay: Option<Duration>,
    /// `None` leaves login requests unanswered
    login_result: Option<u8>,
    /// Per-endpoint login result, overriding `login_result`
    login_overrides: HashMap<Endpoint, u8>,
    heartbeat_replies: bool,
    send_result: u8,
    connects: Vec<Endpoint>,
    received: Vec<SsoPacket>,
    link: Option<Link>,
    next_link: u64,
}

/// Scripted server shared by any number of transports
#[derive(Clone)]
pub struct MockServer {
    state: Arc<Mutex<ServerState>>,
    encoder: Arc<PacketEncoder>,
    decoder: Arc<PacketDecoder>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServer {
    pub fn new() -> Self {
        Self::with_protocol(ProtocolConfig::default())
    }

    pub fn with_protocol(protocol: ProtocolConfig) -> Self {
        let codec = CodecConfig::default();
        Self {
            state: Arc::new(Mutex::new(ServerState {
                protocol,
                refused: HashSet::new(),
                refuse_all: false,
                fail_next_connects: 0,
                connect_delay: None,
                login_result: Some(0),
                login_overrides: HashMap::new(),
                heartbeat_replies: true,
                send_result: 0,
                connects: Vec::new(),
                received: Vec::new(),
                link: None,
                next_link: 1,
            })),
            encoder: Arc::new(PacketEncoder::new(&codec)),
            decoder: Arc::new(PacketDecoder::new(&codec)),
        }
    }

    // ------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------

    pub fn refuse(&self, endpoint: &Endpoint) {
        self.state.lock().refused.insert(endpoint.clone());
    }

    pub fn allow(&self, endpoint: &Endpoint) {
        self.state.lock().refused.remove(endpoint);
    }

    pub fn set_refuse_all(&self, refuse: bool) {
        self.state.lock().refuse_all = refuse;
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().fail_next_connects = count;
    }

    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        self.state.lock().connect_delay = delay;
    }

    pub fn set_login_result(&self, code: u8) {
        self.state.lock().login_result = Some(code);
    }

    /// Never answer login requests
    pub fn set_login_silent(&self) {
        self.state.lock().login_result = None;
    }

    /// Answer logins arriving over `endpoint` with `code`, whatever the global result
    pub fn set_login_result_for(&self, endpoint: &Endpoint, code: u8) {
        self.state.lock().login_overrides.insert(endpoint.clone(), code);
    }

    pub fn set_heartbeat_replies(&self, reply: bool) {
        self.state.lock().heartbeat_replies = reply;
    }

    pub fn set_send_result(&self, code: u8) {
        self.state.lock().send_result = code;
    }

    // ------------------------------------------------------------------
    // Live Connection
    // ------------------------------------------------------------------

    /// Sever the live connection; returns whether one existed
    pub fn drop_connection(&self) -> bool {
        self.state.lock().link.take().is_some()
    }

    /// Push an unsolicited packet over the live connection
    pub fn push(&self, packet: SsoPacket) -> bool {
        let Ok(frame) = self.encoder.encode(&packet) else {
            return false;
        };
        let state = self.state.lock();
        match &state.link {
            Some(link) => link.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().link.is_some()
    }

    pub fn connected_endpoint(&self) -> Option<Endpoint> {
        self.state.lock().link.as_ref().map(|link| link.endpoint.clone())
    }

    /// Every endpoint a connect was attempted to, in order
    pub fn connects(&self) -> Vec<Endpoint> {
        self.state.lock().connects.clone()
    }

    pub fn received(&self) -> Vec<SsoPacket> {
        self.state.lock().received.clone()
    }

    pub fn received_command(&self, command: &str) -> Vec<SsoPacket> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|packet| packet.command == command)
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn open(&self, endpoint: &Endpoint) -> Result<MockConnection, TransportError> {
        let mut state = self.state.lock();
        let refused = state.refuse_all || state.refused.contains(endpoint);
        if refused || state.fail_next_connects > 0 {
            state.fail_next_connects = state.fail_next_connects.saturating_sub(1);
            return Err(TransportError::Connect {
                endpoint: endpoint.clone(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "mock server refused"),
            });
        }

        let id = state.next_link;
        state.next_link += 1;
        let (outbound, inbound) = mpsc::unbounded_channel();
        // a new connection replaces the old one
        state.link = Some(Link {
            id,
            endpoint: endpoint.clone(),
            outbound,
        });

        Ok(MockConnection {
            id,
            endpoint: endpoint.clone(),
            server: self.clone(),
            inbound,
        })
    }

    fn receive(&self, link_id: u64, frame: &Frame) -> io::Result<()> {
        let packets = self
            .decoder
            .decode(frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut state = self.state.lock();
        let live = state.link.as_ref().is_some_and(|link| link.id == link_id);
        if !live {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock connection was dropped",
            ));
        }

        let login_result = state
            .link
            .as_ref()
            .and_then(|link| state.login_overrides.get(&link.endpoint).copied())
            .or(state.login_result);

        for packet in packets {
            let reply = if packet.command == state.protocol.login_command {
                login_result.map(|code| vec![code])
            } else if packet.command == state.protocol.heartbeat_command {
                state.heartbeat_replies.then(Vec::new)
            } else if packet.command == state.protocol.message_send_command {
                Some(vec![state.send_result])
            } else {
                None
            };

            if let Some(body) = reply {
                let response = SsoPacket::new(packet.sequence_id, packet.command.clone(), body);
                if let (Ok(frame), Some(link)) = (self.encoder.encode(&response), &state.link) {
                    let _ = link.outbound.send(frame);
                }
            }
            debug!(command = %packet.command, sequence_id = packet.sequence_id, "mock server received");
            state.received.push(packet);
        }
        Ok(())
    }

    fn release(&self, link_id: u64) {
        let mut state = self.state.lock();
        if state.link.as_ref().is_some_and(|link| link.id == link_id) {
            state.link = None;
        }
    }
}

// ----------------------------------------------------------------------------
// Mock Connection
// ----------------------------------------------------------------------------

pub struct MockConnection {
    id: u64,
    endpoint: Endpoint,
    server: MockServer,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl Connection for MockConnection {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn write_frame(&mut self, frame: &Frame) -> io::Result<()> {
        self.server.receive(self.id, frame)
    }

    async fn read_frame(&mut self) -> io::Result<Frame> {
        self.inbound.recv().await.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionReset,
                "mock server dropped the connection",
            )
        })
    }

    async fn close(&mut self) {
        self.server.release(self.id);
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.server.release(self.id);
    }
}

// ----------------------------------------------------------------------------
// Mock Transport
// ----------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockTransport {
    server: MockServer,
}

impl MockTransport {
    pub fn new(server: MockServer) -> Self {
        Self { server }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, TransportError> {
        let delay = {
            let mut state = self.server.state.lock();
            state.connects.push(endpoint.clone());
            state.connect_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let connection = self.server.open(endpoint)?;
        Ok(Box::new(connection))
    }
}
