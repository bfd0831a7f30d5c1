//! Connection driver task
//!
//! Sole writer of the connection state. Each loop iteration runs the work of
//! the current state (idle, connect, login, serve, close) raced against the
//! command channel, and every state change goes through [`Driver::apply`].

use std::sync::{Arc, Weak};

use imwire_core::codec::wire::ByteReader;
use imwire_core::{
    ConnectionEvent, ConnectionState, Endpoint, Frame, ImwireError, ImwireResult, SsoPacket,
    StateChange, Timestamp, Transition, TransportError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::{Command, HandlerInner, HeartbeatLink, Shared, StateSnapshot};
use crate::auth::{Authenticator, PacketChannel};
use crate::events::{EngineEvent, IncomingMessage};
use crate::heartbeat::HeartbeatSupervisor;
use crate::transport::{Connection, Transport};

enum Flow {
    Continue,
    Exit,
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    handler: Weak<HandlerInner>,
    transport: Arc<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    connection: Option<Box<dyn Connection>>,
    endpoint: Option<Endpoint>,
    session: u64,
    attempts: u32,
    exhausted: bool,
    resume_at: Option<Instant>,
    /// Reason given to the last `close()`, reported on its transitions
    close_reason: Option<String>,
    heartbeat: Option<JoinHandle<()>>,
    finished: bool,
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        commands: mpsc::UnboundedReceiver<Command>,
        handler: Weak<HandlerInner>,
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            shared,
            commands,
            handler,
            transport,
            authenticator,
            connection: None,
            endpoint: None,
            session: 0,
            attempts: 0,
            exhausted: false,
            resume_at: None,
            close_reason: None,
            heartbeat: None,
            finished: false,
        }
    }

    fn state(&self) -> ConnectionState {
        self.shared.snapshot().state
    }

    pub(crate) async fn run(mut self) {
        info!(
            servers = self.shared.config.servers.len(),
            "network driver started"
        );

        loop {
            let flow = match self.state() {
                ConnectionState::Initialized | ConnectionState::Closed => self.idle().await,
                ConnectionState::Connecting => self.connect().await,
                ConnectionState::Loading => self.login().await,
                ConnectionState::Ok => self.serve().await,
                ConnectionState::Closing => self.finish_close().await,
            };
            if let Flow::Exit = flow {
                break;
            }
        }

        self.terminate();
        info!("network driver stopped");
    }

    // ------------------------------------------------------------------
    // Per-State Work
    // ------------------------------------------------------------------

    /// No connection: wait for a command or the backoff deadline
    async fn idle(&mut self) -> Flow {
        let resume_at = self.resume_at;
        tokio::select! {
            command = self.commands.recv() => self.handle_command(command).await,
            _ = sleep_until_some(resume_at) => {
                self.resume_at = None;
                info!(attempt = self.attempts + 1, "backoff elapsed, reconnecting");
                self.apply(ConnectionEvent::Resume);
                Flow::Continue
            }
        }
    }

    async fn connect(&mut self) -> Flow {
        let next = self.shared.servers.read().next_at(Instant::now().into_std());
        let Some(endpoint) = next else {
            error!("server list is empty");
            self.apply(ConnectionEvent::TransportFailed);
            return Flow::Continue;
        };
        self.endpoint = Some(endpoint.clone());
        info!(%endpoint, attempt = self.attempts + 1, "connecting");

        let transport = Arc::clone(&self.transport);
        let waited = self.shared.config.connect_timeout;
        let attempt = async {
            match timeout(waited, transport.connect(&endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout {
                    endpoint: endpoint.clone(),
                    waited,
                }),
            }
        };
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    match result {
                        Ok(connection) => {
                            self.shared.servers.write().record_connected(&endpoint);
                            self.connection = Some(connection);
                            self.apply(ConnectionEvent::TransportEstablished);
                        }
                        Err(failure) => {
                            let reason = match &failure {
                                TransportError::Connect { source, .. }
                                | TransportError::Io { source, .. } => source.to_string(),
                                TransportError::ConnectTimeout { waited, .. } => {
                                    format!("timed out after {:?}", waited)
                                }
                            };
                            let error = ImwireError::connect_failed(endpoint.clone(), reason);
                            warn!(%error, attempt = self.attempts + 1, "connect failed");
                            self.shared
                                .servers
                                .write()
                                .record_failure_at(&endpoint, Instant::now().into_std());
                            self.apply(ConnectionEvent::TransportFailed);
                        }
                    }
                    return Flow::Continue;
                }
                command = self.commands.recv() => {
                    let flow = self.handle_command(command).await;
                    if matches!(flow, Flow::Exit) || self.state() != ConnectionState::Connecting {
                        return flow;
                    }
                }
            }
        }
    }

    async fn login(&mut self) -> Flow {
        let Some(mut connection) = self.connection.take() else {
            self.apply(ConnectionEvent::HandshakeFailed);
            return Flow::Continue;
        };
        let endpoint = connection.endpoint().clone();
        let shared = Arc::clone(&self.shared);
        let authenticator = Arc::clone(&self.authenticator);
        let waited = shared.config.login_timeout;

        let (outcome, flow) = {
            let attempt = async {
                let mut channel = PacketChannel::new(
                    connection.as_mut(),
                    &shared.packet_encoder,
                    &shared.packet_decoder,
                    &shared.sequence,
                );
                match timeout(waited, authenticator.login(&mut channel)).await {
                    Ok(result) => result,
                    Err(_) => Err(ImwireError::auth_failed(
                        endpoint.clone(),
                        format!("login timed out after {:?}", waited),
                    )),
                }
            };
            tokio::pin!(attempt);

            loop {
                tokio::select! {
                    result = &mut attempt => break (Some(result), Flow::Continue),
                    command = self.commands.recv() => {
                        let flow = self.handle_command(command).await;
                        if matches!(flow, Flow::Exit) || self.state() != ConnectionState::Loading {
                            break (None, flow);
                        }
                    }
                }
            }
        };

        match outcome {
            Some(Ok(())) => {
                self.connection = Some(connection);
                self.apply(ConnectionEvent::HandshakeSucceeded);
            }
            Some(Err(error)) => {
                warn!(%endpoint, %error, "login failed");
                connection.close().await;
                self.shared
                    .servers
                    .write()
                    .record_failure_at(&endpoint, Instant::now().into_std());
                self.apply(ConnectionEvent::HandshakeFailed);
            }
            // interrupted by a command that already moved the state
            None => connection.close().await,
        }
        flow
    }

    async fn serve(&mut self) -> Flow {
        let Some(connection) = self.connection.as_mut() else {
            warn!("no connection while OK");
            self.apply(ConnectionEvent::TransportError);
            return Flow::Continue;
        };

        tokio::select! {
            read = connection.read_frame() => {
                match read {
                    Ok(frame) => self.dispatch(frame),
                    Err(error) => {
                        warn!(endpoint = ?self.endpoint, %error, "connection lost");
                        self.apply(ConnectionEvent::TransportError);
                    }
                }
                Flow::Continue
            }
            command = self.commands.recv() => self.handle_command(command).await,
        }
    }

    async fn finish_close(&mut self) -> Flow {
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
        }
        self.apply(ConnectionEvent::CloseCompleted);
        Flow::Continue
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Option<Command>) -> Flow {
        let Some(command) = command else {
            debug!("all handler references dropped");
            self.apply(ConnectionEvent::Cancel);
            return Flow::Exit;
        };

        match command {
            Command::Start => {
                if self.state().on(ConnectionEvent::Start).target().is_some() {
                    self.attempts = 0;
                    self.exhausted = false;
                    self.resume_at = None;
                }
                self.apply(ConnectionEvent::Start);
            }
            Command::Resume => {
                if self.exhausted {
                    warn!("resume ignored: reconnect attempts exhausted, start() required");
                } else {
                    self.resume_at = None;
                    self.apply(ConnectionEvent::Resume);
                }
            }
            Command::Close { reason } => {
                info!(%reason, "close requested");
                self.resume_at = None;
                self.close_reason = Some(reason);
                self.apply(ConnectionEvent::Close);
            }
            Command::Send { frame, reply } => {
                let result = self.write(frame).await;
                let _ = reply.send(result);
            }
            Command::HeartbeatTimeout { session, missed } => {
                if session == self.session && self.state() == ConnectionState::Ok {
                    let error = ImwireError::HeartbeatTimeout { missed };
                    warn!(%error, endpoint = ?self.endpoint, "closing unresponsive connection");
                    self.apply(ConnectionEvent::HeartbeatTimeout);
                } else {
                    debug!(session, current = self.session, "stale heartbeat report");
                }
            }
            Command::Shutdown => {
                info!("shutdown requested");
                self.apply(ConnectionEvent::Cancel);
                return Flow::Exit;
            }
        }
        Flow::Continue
    }

    async fn write(&mut self, frame: Frame) -> ImwireResult<()> {
        let state = self.state();
        let connection = match self.connection.as_mut() {
            Some(connection) if state == ConnectionState::Ok => connection,
            _ => {
                return Err(ImwireError::NotConnected {
                    state,
                    exhausted: self.exhausted,
                })
            }
        };

        let written = connection.write_frame(&frame).await;
        match written {
            Ok(()) => Ok(()),
            Err(source) => {
                let endpoint = connection.endpoint().clone();
                let error = ImwireError::from(TransportError::Io {
                    endpoint,
                    state,
                    source,
                });
                warn!(%error, "write failed");
                self.apply(ConnectionEvent::TransportError);
                Err(error)
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound Traffic
    // ------------------------------------------------------------------

    fn dispatch(&self, frame: Frame) {
        let packets = match self.shared.packet_decoder.decode(&frame) {
            Ok(packets) => packets,
            Err(error) => {
                warn!(%error, "dropping undecodable frame");
                return;
            }
        };
        for packet in packets {
            self.route(packet);
        }
    }

    fn route(&self, packet: SsoPacket) {
        if let Some((_, listener)) = self.shared.listeners.remove(&packet.sequence_id) {
            if listener.send(packet).is_err() {
                debug!("response arrived after its waiter gave up");
            }
            return;
        }

        let protocol = &self.shared.config.protocol;
        if packet.command == protocol.redirect_command {
            self.redirect(&packet);
        } else if protocol.is_message_command(&packet.command) {
            self.deliver_message(packet);
        } else {
            debug!(
                command = %packet.command,
                sequence_id = packet.sequence_id,
                "unsolicited packet"
            );
            self.shared.events.publish(EngineEvent::Packet(packet));
        }
    }

    /// Body is one `host:port` per line
    fn redirect(&self, packet: &SsoPacket) {
        let text = match std::str::from_utf8(&packet.body) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, "redirect body is not UTF-8");
                return;
            }
        };

        let mut endpoints = Vec::new();
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match line.parse::<Endpoint>() {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(error) => warn!(%error, "ignoring redirect entry"),
            }
        }

        let updated = {
            let mut servers = self.shared.servers.write();
            servers
                .replace_list(endpoints)
                .then(|| servers.endpoints().to_vec())
        };
        match updated {
            Some(endpoints) => {
                info!(count = endpoints.len(), "server list replaced by redirect");
                self.shared
                    .events
                    .publish(EngineEvent::ServersUpdated { endpoints });
            }
            None => warn!("redirect carried no usable endpoints"),
        }
    }

    /// Body is the sender id followed by an encoded message
    fn deliver_message(&self, packet: SsoPacket) {
        let mut reader = ByteReader::new(&packet.body);
        let sender = match reader.read_u64() {
            Ok(sender) => sender,
            Err(error) => {
                warn!(command = %packet.command, %error, "malformed incoming message");
                return;
            }
        };

        let decoded = self.shared.message_decoder.decode(reader.rest());
        if decoded.skipped > 0 {
            debug!(
                sender,
                skipped = decoded.skipped,
                "incoming message had undecodable elements"
            );
        }
        self.shared
            .events
            .publish(EngineEvent::Message(IncomingMessage {
                command: packet.command,
                sender,
                elements: decoded.elements,
                flags: decoded.flags,
            }));
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Feed one event to the transition table and publish the result
    fn apply(&mut self, event: ConnectionEvent) -> bool {
        let previous = self.state();
        let next = match previous.on(event) {
            Transition::Moved { to, .. } => to,
            Transition::Ignored => {
                debug!(state = %previous, %event, "transition ignored");
                return false;
            }
        };

        if previous == ConnectionState::Ok && next != ConnectionState::Ok {
            self.stop_heartbeat();
        }
        if next == ConnectionState::Connecting {
            self.session = self.session.wrapping_add(1);
            self.endpoint = None;
            self.close_reason = None;
        }
        let detail = match event {
            ConnectionEvent::Close | ConnectionEvent::CloseCompleted => self.close_reason.clone(),
            _ => None,
        };

        let mut unreachable = false;
        if next == ConnectionState::Closed {
            if previous.holds_transport() {
                if let Some(endpoint) = &self.endpoint {
                    self.shared.servers.write().record_disconnected(endpoint);
                }
            }
            self.connection = None;
            let released = self.shared.release_listeners();
            if released > 0 {
                debug!(released, "released pending response listeners");
            }

            if event.is_failure() {
                self.attempts = self.attempts.saturating_add(1);
                let reconnect = &self.shared.config.reconnect;
                if self.attempts >= reconnect.max_attempts {
                    self.exhausted = true;
                    self.resume_at = None;
                    unreachable = true;
                } else {
                    let delay = reconnect.delay_for(self.attempts);
                    self.resume_at = Some(Instant::now() + delay);
                    info!(attempt = self.attempts, ?delay, "reconnect scheduled");
                }
            } else {
                self.resume_at = None;
            }
        }
        if next == ConnectionState::Ok {
            self.attempts = 0;
        }

        self.shared.publish(StateSnapshot {
            state: next,
            reason: Some(event),
            endpoint: self.endpoint.clone(),
            session: self.session,
            attempts: self.attempts,
            exhausted: self.exhausted,
            terminated: false,
            detail: detail.clone(),
            timestamp: Timestamp::now(),
        });
        info!(from = %previous, to = %next, reason = %event, "connection state changed");
        let change =
            StateChange::new(previous, next, event, self.endpoint.clone()).with_detail(detail);
        self.shared.events.publish(EngineEvent::StateChanged(change));

        if unreachable {
            let error = ImwireError::ReconnectExhausted {
                attempts: self.attempts,
            };
            error!(%error, "automatic reconnect stopped");
            self.shared.events.publish(EngineEvent::NetworkUnreachable {
                attempts: self.attempts,
                last_endpoint: self.endpoint.clone(),
            });
        }
        if next == ConnectionState::Ok {
            self.start_heartbeat();
        }
        true
    }

    fn start_heartbeat(&mut self) {
        let link = HeartbeatLink::new(self.handler.clone(), self.session);
        let supervisor = HeartbeatSupervisor::new(self.shared.config.heartbeat.clone());
        self.heartbeat = Some(supervisor.spawn(link));
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }

    /// Final cleanup; publishes a terminated snapshot so every waiter wakes
    fn terminate(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let current = self.shared.snapshot();
        let cancelled = current.state == ConnectionState::Closed
            && current.reason == Some(ConnectionEvent::Cancel);
        if !cancelled {
            self.apply(ConnectionEvent::Cancel);
        }
        self.stop_heartbeat();
        self.connection = None;
        self.shared.release_listeners();

        let mut snapshot = (*self.shared.snapshot()).clone();
        snapshot.terminated = true;
        snapshot.timestamp = Timestamp::now();
        self.shared.publish(snapshot);
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if !self.finished {
            warn!("network driver dropped before shutdown");
            self.terminate();
        }
    }
}
