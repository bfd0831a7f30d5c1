//! Connection State Transition Table
//!
//! The lifecycle of one logical connection as an explicit, total transition
//! table. Every `(state, event)` pair is either a move to a new state or an
//! explicit `Ignored`; nothing falls through to a default.
//!
//! The table is pure. The runtime driver owns the current state, feeds events
//! through [`ConnectionState::on`] and publishes the resulting snapshot.

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::types::{Endpoint, Timestamp};

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle state of a logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Created, never started
    Initialized,
    /// Picking an endpoint and opening the transport
    Connecting,
    /// Transport open, post-connect handshake in progress
    Loading,
    /// Logged in; sends are permitted
    Ok,
    /// User-requested close in progress
    Closing,
    /// No connection; may be resumed into a new session
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Initialized => "INITIALIZED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Loading => "LOADING",
            ConnectionState::Ok => "OK",
            ConnectionState::Closing => "CLOSING",
            ConnectionState::Closed => "CLOSED",
        }
    }

    /// Whether a live transport connection may exist in this state
    pub fn holds_transport(&self) -> bool {
        matches!(
            self,
            ConnectionState::Loading | ConnectionState::Ok | ConnectionState::Closing
        )
    }

    /// Apply an event to this state
    pub fn on(self, event: ConnectionEvent) -> Transition {
        use ConnectionEvent as E;
        use ConnectionState as S;

        let to = match (self, event) {
            (S::Initialized, E::Start) => S::Connecting,
            (S::Initialized, E::Close) => S::Closed,
            (S::Initialized, E::Cancel) => S::Closed,
            (
                S::Initialized,
                E::Resume
                | E::TransportEstablished
                | E::TransportFailed
                | E::HandshakeSucceeded
                | E::HandshakeFailed
                | E::HeartbeatTimeout
                | E::TransportError
                | E::CloseCompleted,
            ) => return Transition::Ignored,

            (S::Connecting, E::TransportEstablished) => S::Loading,
            (S::Connecting, E::TransportFailed) => S::Closed,
            (S::Connecting, E::Close) => S::Closed,
            (S::Connecting, E::Cancel) => S::Closed,
            (
                S::Connecting,
                E::Start
                | E::Resume
                | E::HandshakeSucceeded
                | E::HandshakeFailed
                | E::HeartbeatTimeout
                | E::TransportError
                | E::CloseCompleted,
            ) => return Transition::Ignored,

            (S::Loading, E::HandshakeSucceeded) => S::Ok,
            (S::Loading, E::HandshakeFailed) => S::Closed,
            (S::Loading, E::TransportError) => S::Closed,
            (S::Loading, E::Close) => S::Closed,
            (S::Loading, E::Cancel) => S::Closed,
            (
                S::Loading,
                E::Start
                | E::Resume
                | E::TransportEstablished
                | E::TransportFailed
                | E::HeartbeatTimeout
                | E::CloseCompleted,
            ) => return Transition::Ignored,

            (S::Ok, E::HeartbeatTimeout) => S::Closed,
            (S::Ok, E::TransportError) => S::Closed,
            (S::Ok, E::Close) => S::Closing,
            (S::Ok, E::Cancel) => S::Closed,
            (
                S::Ok,
                E::Start
                | E::Resume
                | E::TransportEstablished
                | E::TransportFailed
                | E::HandshakeSucceeded
                | E::HandshakeFailed
                | E::CloseCompleted,
            ) => return Transition::Ignored,

            (S::Closing, E::CloseCompleted) => S::Closed,
            (S::Closing, E::TransportError) => S::Closed,
            (S::Closing, E::Cancel) => S::Closed,
            (
                S::Closing,
                E::Start
                | E::Resume
                | E::TransportEstablished
                | E::TransportFailed
                | E::HandshakeSucceeded
                | E::HandshakeFailed
                | E::HeartbeatTimeout
                | E::Close,
            ) => return Transition::Ignored,

            (S::Closed, E::Start) => S::Connecting,
            (S::Closed, E::Resume) => S::Connecting,
            (S::Closed, E::Cancel) => S::Closed,
            (
                S::Closed,
                E::TransportEstablished
                | E::TransportFailed
                | E::HandshakeSucceeded
                | E::HandshakeFailed
                | E::HeartbeatTimeout
                | E::TransportError
                | E::Close
                | E::CloseCompleted,
            ) => return Transition::Ignored,
        };

        Transition::Moved { from: self, to }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Connection Events
// ----------------------------------------------------------------------------

/// Inputs to the transition table; also recorded as the reason of a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Owner called `start()`
    Start,
    /// Owner or backoff timer called `resume()`
    Resume,
    TransportEstablished,
    /// Transport could not be opened (reason `ConnectFailed`)
    TransportFailed,
    HandshakeSucceeded,
    /// Login rejected or timed out (reason `AuthFailed`)
    HandshakeFailed,
    HeartbeatTimeout,
    /// Read or write on an open transport failed
    TransportError,
    /// Owner called `close()`
    Close,
    /// The graceful close finished releasing the transport
    CloseCompleted,
    /// The owning task was cancelled
    Cancel,
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::Start => "Start",
            ConnectionEvent::Resume => "Resume",
            ConnectionEvent::TransportEstablished => "TransportEstablished",
            ConnectionEvent::TransportFailed => "ConnectFailed",
            ConnectionEvent::HandshakeSucceeded => "HandshakeSucceeded",
            ConnectionEvent::HandshakeFailed => "AuthFailed",
            ConnectionEvent::HeartbeatTimeout => "HeartbeatTimeout",
            ConnectionEvent::TransportError => "TransportError",
            ConnectionEvent::Close => "UserClose",
            ConnectionEvent::CloseCompleted => "UserClose",
            ConnectionEvent::Cancel => "Cancelled",
        }
    }

    /// Failures that schedule an automatic `resume()` when they close a session
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::TransportFailed
                | ConnectionEvent::HandshakeFailed
                | ConnectionEvent::HeartbeatTimeout
                | ConnectionEvent::TransportError
        )
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ----------------------------------------------------------------------------
// Transition Result
// ----------------------------------------------------------------------------

/// Outcome of feeding an event to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved {
        from: ConnectionState,
        to: ConnectionState,
    },
    Ignored,
}

impl Transition {
    pub fn target(&self) -> Option<ConnectionState> {
        match self {
            Transition::Moved { to, .. } => Some(*to),
            Transition::Ignored => None,
        }
    }
}

// ----------------------------------------------------------------------------
// State Change Notification
// ----------------------------------------------------------------------------

/// Published on the event bus for every applied transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: ConnectionEvent,
    /// Endpoint in use when the transition happened, if any
    pub endpoint: Option<Endpoint>,
    /// Free-form cause, e.g. the reason passed to a user close
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub timestamp: Timestamp,
}

impl StateChange {
    pub fn new(
        previous: ConnectionState,
        current: ConnectionState,
        reason: ConnectionEvent,
        endpoint: Option<Endpoint>,
    ) -> Self {
        Self {
            previous,
            current,
            reason,
            endpoint,
            detail: None,
            timestamp: Timestamp::now(),
        }
    }

    pub fn with_detail(mut self, detail: Option<String>) -> Self {
        self.detail = detail;
        self
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
