//! Network Handler
//!
//! The public face of one connection engine. A [`NetworkHandler`] is a cheap
//! clonable handle; the state machine itself runs in a single background
//! driver task that owns the transport connection and serializes every state
//! write. Handles read the current [`StateSnapshot`] lock-free and wait for
//! state changes on a watch channel.

mod driver;

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use imwire_core::{
    ConnectionEvent, ConnectionState, EngineConfig, Endpoint, Frame, ImwireError, ImwireResult,
    MessageDecoder, MessageElement, MessageEncoder, PacketDecoder, PacketEncoder, SendFailure,
    ServerList, SsoPacket, Timestamp,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::builder::NetworkHandlerBuilder;
use crate::events::{EngineEvent, EventBus};
use crate::heartbeat::HeartbeatTarget;
use crate::transport::Transport;
use driver::Driver;

// ----------------------------------------------------------------------------
// Public Types
// ----------------------------------------------------------------------------

/// What `send` does when the connection is not `OK`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPolicy {
    /// Fail immediately with `NotConnected`
    FailFast,
    /// Wait up to the given time for `OK`
    WaitFor(Duration),
}

/// Immutable view of the engine state, replaced atomically on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: ConnectionState,
    /// Event that produced this state; `None` before the first transition
    pub reason: Option<ConnectionEvent>,
    /// Endpoint in use or last used
    pub endpoint: Option<Endpoint>,
    /// Incremented on every entry into `CONNECTING`
    pub session: u64,
    /// Consecutive failures since the last `OK`
    pub attempts: u32,
    /// Reconnect attempts are exhausted; only `start()` clears this
    pub exhausted: bool,
    /// The driver has stopped; the handler is unusable
    pub terminated: bool,
    /// Caller-supplied close reason while the close it caused is current
    pub detail: Option<String>,
    pub timestamp: Timestamp,
}

impl StateSnapshot {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Initialized,
            reason: None,
            endpoint: None,
            session: 0,
            attempts: 0,
            exhausted: false,
            terminated: false,
            detail: None,
            timestamp: Timestamp::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ok && !self.terminated
    }

    /// Outcome for a caller waiting on `OK`, or `None` to keep waiting
    fn readiness(&self) -> Option<ImwireResult<()>> {
        if self.terminated {
            Some(Err(ImwireError::Cancelled))
        } else if self.state == ConnectionState::Ok {
            Some(Ok(()))
        } else if self.exhausted {
            Some(Err(ImwireError::ReconnectExhausted {
                attempts: self.attempts,
            }))
        } else {
            None
        }
    }
}

// ----------------------------------------------------------------------------
// Driver Commands
// ----------------------------------------------------------------------------

pub(crate) enum Command {
    Start,
    Resume,
    Close {
        reason: String,
    },
    Send {
        frame: Frame,
        reply: oneshot::Sender<ImwireResult<()>>,
    },
    HeartbeatTimeout {
        session: u64,
        missed: u32,
    },
    Shutdown,
}

// ----------------------------------------------------------------------------
// Shared State
// ----------------------------------------------------------------------------

/// State shared between handles and the driver
pub(crate) struct Shared {
    pub(crate) config: EngineConfig,
    snapshot: ArcSwap<StateSnapshot>,
    updates: watch::Sender<Arc<StateSnapshot>>,
    pub(crate) events: EventBus,
    pub(crate) servers: RwLock<ServerList>,
    pub(crate) listeners: DashMap<i32, oneshot::Sender<SsoPacket>>,
    pub(crate) sequence: AtomicI32,
    pub(crate) message_encoder: MessageEncoder,
    pub(crate) message_decoder: MessageDecoder,
    pub(crate) packet_encoder: PacketEncoder,
    pub(crate) packet_decoder: PacketDecoder,
}

impl Shared {
    fn new(config: EngineConfig, event_capacity: usize) -> Self {
        let initial = Arc::new(StateSnapshot::initial());
        let (updates, _) = watch::channel(Arc::clone(&initial));
        let servers = ServerList::new(config.servers.clone(), config.reconnect.failure_cooldown);

        Self {
            snapshot: ArcSwap::new(initial),
            updates,
            events: EventBus::new(event_capacity),
            servers: RwLock::new(servers),
            listeners: DashMap::new(),
            sequence: AtomicI32::new(1),
            message_encoder: MessageEncoder::new(&config.codec),
            message_decoder: MessageDecoder::new(),
            packet_encoder: PacketEncoder::new(&config.codec),
            packet_decoder: PacketDecoder::new(&config.codec),
            config,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<StateSnapshot> {
        self.snapshot.load_full()
    }

    /// Replace the snapshot, then wake waiters
    pub(crate) fn publish(&self, snapshot: StateSnapshot) {
        let snapshot = Arc::new(snapshot);
        self.snapshot.store(Arc::clone(&snapshot));
        self.updates.send_replace(snapshot);
    }

    pub(crate) fn next_sequence(&self) -> i32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop every pending response listener; their waiters observe a closed channel
    pub(crate) fn release_listeners(&self) -> usize {
        let released = self.listeners.len();
        self.listeners.clear();
        released
    }
}

/// Removes a response listener however the waiting call ends
struct ListenerGuard<'a> {
    shared: &'a Shared,
    sequence_id: i32,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        self.shared.listeners.remove(&self.sequence_id);
    }
}

// ----------------------------------------------------------------------------
// Network Handler
// ----------------------------------------------------------------------------

pub(crate) struct HandlerInner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running connection engine
///
/// Dropping every handle cancels the engine.
#[derive(Clone)]
pub struct NetworkHandler {
    inner: Arc<HandlerInner>,
}

impl NetworkHandler {
    pub fn builder<T: Transport>(transport: T) -> NetworkHandlerBuilder {
        NetworkHandlerBuilder::new(transport)
    }

    /// Validate the configuration and spawn the driver; must run inside a tokio runtime
    pub fn spawn(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        authenticator: Arc<dyn Authenticator>,
        event_capacity: usize,
    ) -> ImwireResult<Self> {
        config.validate()?;
        // the switch is process-wide; a handler only ever turns it on
        if config.trace {
            imwire_core::trace::set_enabled(true);
        }

        let shared = Arc::new(Shared::new(config, event_capacity));
        let (commands, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(HandlerInner {
            shared: Arc::clone(&shared),
            commands,
            driver: Mutex::new(None),
        });

        let driver = Driver::new(
            shared,
            receiver,
            Arc::downgrade(&inner),
            transport,
            authenticator,
        );
        let handle = tokio::spawn(driver.run());
        *inner.driver.lock() = Some(handle);

        Ok(Self { inner })
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    fn command(&self, command: Command) -> ImwireResult<()> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| ImwireError::Cancelled)
    }

    /// Begin connecting; also clears reconnect exhaustion
    pub fn start(&self) -> ImwireResult<()> {
        self.command(Command::Start)
    }

    /// Reconnect from `CLOSED`; ignored once reconnect attempts are exhausted
    pub fn resume(&self) -> ImwireResult<()> {
        self.command(Command::Resume)
    }

    /// Close the connection without scheduling a reconnect
    pub fn close<R: Into<String>>(&self, reason: R) -> ImwireResult<()> {
        self.command(Command::Close {
            reason: reason.into(),
        })
    }

    /// Cancel the engine and wait for the driver to exit
    pub async fn shutdown(&self) {
        info!("network handler shutdown requested");
        let _ = self.inner.commands.send(Command::Shutdown);

        let handle = self.inner.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                if error.is_panic() {
                    error!("network driver panicked");
                }
            }
        }
    }

    /// Abort the driver task without waiting
    pub fn abort(&self) {
        if let Some(handle) = self.inner.driver.lock().as_ref() {
            handle.abort();
        }
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn snapshot(&self) -> Arc<StateSnapshot> {
        self.inner.shared.snapshot()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot().state
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot().is_ready()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Receiver woken on every published snapshot
    pub fn watch_state(&self) -> watch::Receiver<Arc<StateSnapshot>> {
        self.inner.shared.updates.subscribe()
    }

    pub fn server_list(&self) -> ServerList {
        self.inner.shared.servers.read().clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.shared.config
    }

    /// Allocate a sequence id for a caller-built packet
    pub fn next_sequence(&self) -> i32 {
        self.inner.shared.next_sequence()
    }

    /// Wait until the connection is `OK`
    ///
    /// Fails with `ReconnectExhausted` once automatic reconnection has given
    /// up, and with `Cancelled` once the driver has stopped.
    pub async fn await_ready(&self, waited: Duration) -> ImwireResult<()> {
        let mut updates = self.watch_state();
        let wait = async {
            loop {
                let snapshot = Arc::clone(&updates.borrow_and_update());
                if let Some(result) = snapshot.readiness() {
                    return result;
                }
                if updates.changed().await.is_err() {
                    return Err(ImwireError::Cancelled);
                }
            }
        };

        match timeout(waited, wait).await {
            Ok(result) => result,
            Err(_) => Err(ImwireError::ConnectionTimeout {
                waited,
                state: self.state(),
            }),
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn closed_error(&self) -> ImwireError {
        let snapshot = self.snapshot();
        if snapshot.terminated {
            ImwireError::Cancelled
        } else {
            ImwireError::NotConnected {
                state: snapshot.state,
                exhausted: snapshot.exhausted,
            }
        }
    }

    async fn admit(&self, policy: SendPolicy) -> ImwireResult<()> {
        let snapshot = self.snapshot();
        if snapshot.terminated {
            return Err(ImwireError::Cancelled);
        }
        if snapshot.exhausted {
            return Err(ImwireError::NotConnected {
                state: snapshot.state,
                exhausted: true,
            });
        }
        if snapshot.state == ConnectionState::Ok {
            return Ok(());
        }

        match policy {
            SendPolicy::FailFast => Err(ImwireError::not_connected(snapshot.state)),
            SendPolicy::WaitFor(waited) => match self.await_ready(waited).await {
                Err(ImwireError::ReconnectExhausted { .. }) => Err(ImwireError::NotConnected {
                    state: self.state(),
                    exhausted: true,
                }),
                other => other,
            },
        }
    }

    async fn submit(&self, frame: Frame) -> ImwireResult<()> {
        let (reply, written) = oneshot::channel();
        self.command(Command::Send { frame, reply })?;
        match written.await {
            Ok(result) => result,
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Write one packet as is
    pub async fn send(&self, packet: &SsoPacket, policy: SendPolicy) -> ImwireResult<()> {
        let frame = self.inner.shared.packet_encoder.encode(packet)?;
        self.admit(policy).await?;
        self.submit(frame).await
    }

    /// Write a packet under a fresh sequence id and wait for its response
    pub async fn send_and_expect(
        &self,
        packet: SsoPacket,
        policy: SendPolicy,
        waited: Duration,
    ) -> ImwireResult<SsoPacket> {
        let shared = &*self.inner.shared;
        let sequence_id = shared.next_sequence();
        let packet = packet.with_sequence(sequence_id);
        let frame = shared.packet_encoder.encode(&packet)?;

        self.admit(policy).await?;

        let (listener, response) = oneshot::channel();
        shared.listeners.insert(sequence_id, listener);
        let _guard = ListenerGuard {
            shared,
            sequence_id,
        };
        self.submit(frame).await?;

        match timeout(waited, response).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => Err(ImwireError::ResponseTimeout {
                command: packet.command,
                sequence_id,
                waited,
            }),
        }
    }

    /// Request/response exchange bounded by the configured request timeout
    pub async fn request<C: Into<String>>(
        &self,
        command: C,
        body: Vec<u8>,
        policy: SendPolicy,
    ) -> ImwireResult<SsoPacket> {
        let waited = self.inner.shared.config.request_timeout;
        self.send_and_expect(SsoPacket::new(0, command, body), policy, waited)
            .await
    }

    /// Send a chat message and map the server's verdict
    pub async fn send_message(
        &self,
        target: u64,
        chain: &[MessageElement],
        policy: SendPolicy,
    ) -> ImwireResult<()> {
        let shared = &*self.inner.shared;
        let mut body = target.to_be_bytes().to_vec();
        body.extend(shared.message_encoder.encode(chain)?);
        let size = body.len();

        let command = shared.config.protocol.message_send_command.clone();
        let response = self.request(command, body, policy).await?;
        let code = response.body.first().copied().unwrap_or(u8::MAX);

        match SendFailure::from_result_code(code) {
            None => Ok(()),
            Some(SendFailure::MessageTooLarge { .. }) => Err(SendFailure::MessageTooLarge {
                size,
                limit: shared.config.codec.max_message_size,
            }
            .into()),
            Some(failure) => {
                warn!(target, %failure, "message rejected");
                Err(failure.into())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Heartbeat Link
// ----------------------------------------------------------------------------

/// Heartbeat target bound to one connection session
///
/// Holds the handler weakly so a running heartbeat never keeps the engine alive.
pub(crate) struct HeartbeatLink {
    handler: Weak<HandlerInner>,
    session: u64,
}

impl HeartbeatLink {
    pub(crate) fn new(handler: Weak<HandlerInner>, session: u64) -> Self {
        Self { handler, session }
    }
}

#[async_trait]
impl HeartbeatTarget for HeartbeatLink {
    async fn probe(&self, deadline: Duration) -> ImwireResult<()> {
        let inner = self.handler.upgrade().ok_or(ImwireError::Cancelled)?;
        let handler = NetworkHandler { inner };
        let command = handler.config().protocol.heartbeat_command.clone();
        handler
            .send_and_expect(
                SsoPacket::new(0, command, Vec::new()),
                SendPolicy::FailFast,
                deadline,
            )
            .await
            .map(drop)
    }

    fn report_failure(&self, missed: u32) {
        if let Some(inner) = self.handler.upgrade() {
            let _ = inner.commands.send(Command::HeartbeatTimeout {
                session: self.session,
                missed,
            });
        }
    }
}
