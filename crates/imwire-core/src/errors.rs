//! Error types for the imwire engine
//!
//! Every error carries the context needed to diagnose it without correlating
//! logs: the pipeline stage and processor for codec failures, the endpoint and
//! connection state for transport failures.

use core::time::Duration;
use std::io;

use crate::state::ConnectionState;
use crate::types::Endpoint;

// ----------------------------------------------------------------------------
// Processor Failures
// ----------------------------------------------------------------------------

/// Failure raised by a single pipeline processor
#[derive(Debug, thiserror::Error)]
pub enum ProcessorFailure {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 { field: &'static str },

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("{what} too large: {size} bytes exceeds limit of {limit}")]
    TooLarge {
        what: &'static str,
        size: usize,
        limit: usize,
    },

    #[error("compression failed: {0}")]
    Compression(#[from] io::Error),
}

impl ProcessorFailure {
    pub fn truncated(needed: usize, available: usize) -> Self {
        ProcessorFailure::Truncated { needed, available }
    }

    pub fn malformed<T: Into<String>>(what: &'static str, detail: T) -> Self {
        ProcessorFailure::Malformed {
            what,
            detail: detail.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// Codec Errors
// ----------------------------------------------------------------------------

/// A processor failure wrapped with the pipeline stage that raised it
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed in processor `{processor}` on {element_type}: {source}")]
pub struct CodecError {
    /// Name of the pipeline (e.g. `message-encoder`)
    pub stage: &'static str,
    /// Name of the failing processor
    pub processor: &'static str,
    /// Kind of the input being processed
    pub element_type: &'static str,
    #[source]
    pub source: ProcessorFailure,
}

// ----------------------------------------------------------------------------
// Transport Errors
// ----------------------------------------------------------------------------

/// Transport-level failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },

    #[error("connection to {endpoint} timed out after {waited:?}")]
    ConnectTimeout { endpoint: Endpoint, waited: Duration },

    #[error("I/O on {endpoint} failed in state {state}: {source}")]
    Io {
        endpoint: Endpoint,
        state: ConnectionState,
        #[source]
        source: io::Error,
    },
}

// ----------------------------------------------------------------------------
// Send Failures
// ----------------------------------------------------------------------------

/// Message-level send failures mapped from the server's result code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendFailure {
    #[error("message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("sender is muted")]
    Muted,

    #[error("rate limited by server")]
    RateLimited,

    #[error("message rejected by server with code {code}")]
    Rejected { code: u8 },
}

impl SendFailure {
    /// Map a send-response result code; `0` means delivered
    pub fn from_result_code(code: u8) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(SendFailure::MessageTooLarge { size: 0, limit: 0 }),
            2 => Some(SendFailure::Muted),
            3 => Some(SendFailure::RateLimited),
            code => Some(SendFailure::Rejected { code }),
        }
    }
}

// ----------------------------------------------------------------------------
// Top-level Error
// ----------------------------------------------------------------------------

/// Core error type for the imwire engine
#[derive(Debug, thiserror::Error)]
pub enum ImwireError {
    #[error("connect to {endpoint} failed: {reason}")]
    ConnectFailed { endpoint: Endpoint, reason: String },

    #[error("login on {endpoint} failed: {reason}")]
    AuthFailed { endpoint: Endpoint, reason: String },

    #[error("heartbeat timed out after {missed} missed replies")]
    HeartbeatTimeout { missed: u32 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("not connected (state {state}, reconnect exhausted: {exhausted})")]
    NotConnected {
        state: ConnectionState,
        exhausted: bool,
    },

    #[error("timed out waiting for connection after {waited:?} (state {state})")]
    ConnectionTimeout {
        waited: Duration,
        state: ConnectionState,
    },

    #[error("no response to `{command}` (sequence {sequence_id}) within {waited:?}")]
    ResponseTimeout {
        command: String,
        sequence_id: i32,
        waited: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("network unreachable after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("send failed: {0}")]
    Send(#[from] SendFailure),

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl ImwireError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        ImwireError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a not-connected error for the given state
    pub fn not_connected(state: ConnectionState) -> Self {
        ImwireError::NotConnected {
            state,
            exhausted: false,
        }
    }

    /// Create a connect failure for an endpoint
    pub fn connect_failed<R: Into<String>>(endpoint: Endpoint, reason: R) -> Self {
        ImwireError::ConnectFailed {
            endpoint,
            reason: reason.into(),
        }
    }

    /// Create a login failure for an endpoint
    pub fn auth_failed<R: Into<String>>(endpoint: Endpoint, reason: R) -> Self {
        ImwireError::AuthFailed {
            endpoint,
            reason: reason.into(),
        }
    }

    /// Whether the backoff-reconnect path recovers from this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ImwireError::ConnectFailed { .. }
                | ImwireError::AuthFailed { .. }
                | ImwireError::HeartbeatTimeout { .. }
                | ImwireError::Transport(_)
        )
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, ImwireError>;
pub type ImwireResult<T> = Result<T>;
