//! Codec pipelines
//!
//! Two layers, each an encoder/decoder pair built on
//! [`ProcessorPipeline`](crate::pipeline::ProcessorPipeline):
//!
//! - `message`: [`MessageElement`](element::MessageElement) ⇄ TLV
//!   [`WireElement`](wire::WireElement)s forming a message body
//! - `packet`: [`SsoPacket`](packet::SsoPacket) ⇄ [`Frame`](frame::Frame)
//!
//! `frame` holds the length-prefixed stream framing shared by transports.

pub mod element;
pub mod frame;
pub mod message;
pub mod packet;
pub mod wire;
