//! imwire Core
//!
//! This crate provides the runtime-free building blocks of the imwire client
//! connection engine: the endpoint and server list model, the connection state
//! transition table, the generic processor pipeline with its attribute context,
//! and the message/packet codec pipelines built on top of it.
//!
//! Everything here is synchronous. The tokio-based engine that drives a live
//! connection lives in `imwire-runtime`.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod attributes;
pub mod codec;
pub mod config;
pub mod errors;
pub mod pipeline;
pub mod server_list;
pub mod state;
pub mod trace;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use attributes::{AttributeContext, AttributeKey};
pub use codec::{
    element::{ElementKind, MessageElement},
    frame::{Frame, FrameBuffer},
    message::{DecodedMessage, MessageDecoder, MessageEncoder},
    packet::{PacketDecoder, PacketEncoder, PacketFlags, SsoPacket},
    wire::WireElement,
};
pub use config::{CodecConfig, EngineConfig, HeartbeatConfig, ProtocolConfig, ReconnectConfig};
pub use errors::{
    CodecError, ImwireError, ImwireResult, ProcessorFailure, SendFailure, TransportError,
};
pub use pipeline::{
    PipelineConfiguration, PipelineInput, ProcessOutcome, Processor, ProcessorContext,
    ProcessorPipeline,
};
pub use server_list::{EndpointStatus, ServerList};
pub use state::{ConnectionEvent, ConnectionState, StateChange, Transition};
pub use types::{Endpoint, Timestamp};
