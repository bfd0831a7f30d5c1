//! Engine event bus
//!
//! Fan-out of state changes, reachability notices and inbound traffic to any
//! number of subscribers. Slow subscribers lag and lose the oldest events;
//! publishing never blocks the driver.

use imwire_core::{Endpoint, MessageElement, SsoPacket, StateChange};
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of buffered events per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Decoded incoming chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Command the message arrived on
    pub command: String,
    pub sender: u64,
    pub elements: Vec<MessageElement>,
    /// General flags carried by the message body, if any
    pub flags: Option<u32>,
}

/// Notifications published by the engine
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// One applied transition of the connection state machine
    StateChanged(StateChange),
    /// Reconnect attempts are exhausted; only `start()` resumes
    NetworkUnreachable {
        attempts: u32,
        last_endpoint: Option<Endpoint>,
    },
    /// Server pushed a replacement server list
    ServersUpdated { endpoints: Vec<Endpoint> },
    /// Unsolicited packet with no dedicated handling
    Packet(SsoPacket),
    Message(IncomingMessage),
}

impl EngineEvent {
    fn kind(&self) -> &'static str {
        match self {
            EngineEvent::StateChanged(_) => "state-changed",
            EngineEvent::NetworkUnreachable { .. } => "network-unreachable",
            EngineEvent::ServersUpdated { .. } => "servers-updated",
            EngineEvent::Packet(_) => "packet",
            EngineEvent::Message(_) => "message",
        }
    }
}

/// Broadcast channel wrapper
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            trace!(kind, "no event subscribers");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
