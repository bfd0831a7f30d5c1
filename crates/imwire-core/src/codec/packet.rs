//! SSO packet codec
//!
//! Packet payload layout (inside one [`Frame`]):
//!
//! ```text
//! +-------------+---------------------+-------+------------------+
//! | seq i32 BE  | command (u16 + str) | flags | body (u32 + data)|
//! +-------------+---------------------+-------+------------------+
//! ```
//!
//! The encoder is a sequence of writer processors that each append one
//! section. The decoder filters keep-alive frames before parsing.

use core::fmt;
use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::frame::{Frame, LENGTH_PREFIX_SIZE};
use super::wire::ByteReader;
use crate::attributes::{AttributeContext, AttributeKey};
use crate::config::CodecConfig;
use crate::errors::{CodecError, ImwireResult, ProcessorFailure};
use crate::pipeline::{
    PipelineConfiguration, PipelineInput, Processor, ProcessorContext, ProcessorPipeline,
};

// ----------------------------------------------------------------------------
// SSO Packet
// ----------------------------------------------------------------------------

/// Session-layer packet wrapping a command payload
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsoPacket {
    pub sequence_id: i32,
    pub command: String,
    pub body: Vec<u8>,
}

impl SsoPacket {
    pub fn new<C: Into<String>>(sequence_id: i32, command: C, body: Vec<u8>) -> Self {
        Self {
            sequence_id,
            command: command.into(),
            body,
        }
    }

    /// Same packet under a different sequence id
    pub fn with_sequence(mut self, sequence_id: i32) -> Self {
        self.sequence_id = sequence_id;
        self
    }
}

impl PipelineInput for SsoPacket {
    fn kind_name(&self) -> &'static str {
        "sso-packet"
    }
}

impl fmt::Debug for SsoPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsoPacket")
            .field("sequence_id", &self.sequence_id)
            .field("command", &self.command)
            .field("body", &crate::trace::preview(&self.body))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Packet Flags
// ----------------------------------------------------------------------------

/// Reserved flags byte of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: Self = Self(0x00);

    /// Body is zlib-compressed
    pub const IS_COMPRESSED: Self = Self(0x01);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub const fn is_compressed(self) -> bool {
        (self.0 & Self::IS_COMPRESSED.0) != 0
    }

    pub fn with_compression(mut self) -> Self {
        self.0 |= Self::IS_COMPRESSED.0;
        self
    }
}

/// Flags of the packet being encoded; defaults to [`PacketFlags::NONE`] on first read
pub const PACKET_FLAGS: AttributeKey<PacketFlags> = AttributeKey::new("packet.flags");

/// Compressed body produced by [`PayloadCompressor`]
pub const COMPRESSED_BODY: AttributeKey<Vec<u8>> = AttributeKey::new("packet.compressed-body");

fn packet_flags(context: &mut AttributeContext) -> &mut PacketFlags {
    context.get_or_insert_with(&PACKET_FLAGS, PacketFlags::default)
}

pub type PacketEncoderProcessor = dyn Processor<AttributeContext, SsoPacket, Vec<u8>>;
pub type PacketDecoderProcessor = dyn Processor<AttributeContext, Frame, SsoPacket>;

pub type PacketEncoderPipeline =
    ProcessorPipeline<PacketEncoderProcessor, AttributeContext, SsoPacket, Vec<u8>>;
pub type PacketDecoderPipeline =
    ProcessorPipeline<PacketDecoderProcessor, AttributeContext, Frame, SsoPacket>;

// ----------------------------------------------------------------------------
// Encoder Processors
// ----------------------------------------------------------------------------

/// Compresses bodies at or above the threshold; writes nothing itself
pub struct PayloadCompressor {
    pub threshold: usize,
}

impl Processor<AttributeContext, SsoPacket, Vec<u8>> for PayloadCompressor {
    fn name(&self) -> &'static str {
        "payload-compressor"
    }

    fn accepts(&self, input: &SsoPacket) -> bool {
        input.body.len() >= self.threshold
    }

    fn process(
        &self,
        input: &SsoPacket,
        cx: &mut ProcessorContext<'_, AttributeContext, Vec<u8>>,
    ) -> Result<(), ProcessorFailure> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&input.body)?;
        let compressed = encoder.finish()?;

        let context = cx.context_mut();
        context.insert(&COMPRESSED_BODY, compressed);
        let flags = packet_flags(context);
        *flags = flags.with_compression();
        Ok(())
    }
}

/// Writes sequence id and command
pub struct PacketHeaderWriter;

impl Processor<AttributeContext, SsoPacket, Vec<u8>> for PacketHeaderWriter {
    fn name(&self) -> &'static str {
        "header-writer"
    }

    fn process(
        &self,
        input: &SsoPacket,
        cx: &mut ProcessorContext<'_, AttributeContext, Vec<u8>>,
    ) -> Result<(), ProcessorFailure> {
        let command = input.command.as_bytes();
        if command.len() > u16::MAX as usize {
            return Err(ProcessorFailure::TooLarge {
                what: "command",
                size: command.len(),
                limit: u16::MAX as usize,
            });
        }

        let mut header = Vec::with_capacity(6 + command.len());
        header.extend_from_slice(&input.sequence_id.to_be_bytes());
        header.extend_from_slice(&(command.len() as u16).to_be_bytes());
        header.extend_from_slice(command);
        cx.collect(header);
        Ok(())
    }
}

pub struct ReservedFlagWriter;

impl Processor<AttributeContext, SsoPacket, Vec<u8>> for ReservedFlagWriter {
    fn name(&self) -> &'static str {
        "flag-writer"
    }

    fn process(
        &self,
        _input: &SsoPacket,
        cx: &mut ProcessorContext<'_, AttributeContext, Vec<u8>>,
    ) -> Result<(), ProcessorFailure> {
        let flags = *packet_flags(cx.context_mut());
        cx.collect(vec![flags.as_u8()]);
        Ok(())
    }
}

/// Writes the body, compressed if the compressor ran
pub struct PacketBodyWriter;

impl Processor<AttributeContext, SsoPacket, Vec<u8>> for PacketBodyWriter {
    fn name(&self) -> &'static str {
        "body-writer"
    }

    fn process(
        &self,
        input: &SsoPacket,
        cx: &mut ProcessorContext<'_, AttributeContext, Vec<u8>>,
    ) -> Result<(), ProcessorFailure> {
        let compressed = cx.context_mut().remove(&COMPRESSED_BODY);
        let body = compressed.as_deref().unwrap_or(&input.body);
        if body.len() > u32::MAX as usize {
            return Err(ProcessorFailure::TooLarge {
                what: "packet body",
                size: body.len(),
                limit: u32::MAX as usize,
            });
        }

        let mut section = Vec::with_capacity(4 + body.len());
        section.extend_from_slice(&(body.len() as u32).to_be_bytes());
        section.extend_from_slice(body);
        cx.collect(section);
        cx.mark_consumed();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Decoder Processors
// ----------------------------------------------------------------------------

/// Swallows zero-length keep-alive frames
pub struct KeepAliveFilter;

impl Processor<AttributeContext, Frame, SsoPacket> for KeepAliveFilter {
    fn name(&self) -> &'static str {
        "keep-alive-filter"
    }

    fn accepts(&self, input: &Frame) -> bool {
        input.is_empty()
    }

    fn process(
        &self,
        _input: &Frame,
        cx: &mut ProcessorContext<'_, AttributeContext, SsoPacket>,
    ) -> Result<(), ProcessorFailure> {
        cx.mark_consumed();
        Ok(())
    }
}

pub struct SsoPacketReader {
    /// Upper bound on a decompressed body
    pub max_body_size: usize,
}

impl SsoPacketReader {
    fn inflate(&self, data: &[u8]) -> Result<Vec<u8>, ProcessorFailure> {
        let limit = self.max_body_size as u64;
        let mut inflated = Vec::new();
        ZlibDecoder::new(data)
            .take(limit + 1)
            .read_to_end(&mut inflated)?;
        if inflated.len() as u64 > limit {
            return Err(ProcessorFailure::TooLarge {
                what: "decompressed body",
                size: inflated.len(),
                limit: self.max_body_size,
            });
        }
        Ok(inflated)
    }
}

impl Processor<AttributeContext, Frame, SsoPacket> for SsoPacketReader {
    fn name(&self) -> &'static str {
        "packet-reader"
    }

    fn accepts(&self, input: &Frame) -> bool {
        !input.is_empty()
    }

    fn process(
        &self,
        input: &Frame,
        cx: &mut ProcessorContext<'_, AttributeContext, SsoPacket>,
    ) -> Result<(), ProcessorFailure> {
        let mut reader = ByteReader::new(input.payload());
        let sequence_id = reader.read_i32()?;
        let command = reader.read_short_string("command")?;
        let flags = PacketFlags::new(reader.read_u8()?);
        let body_len = reader.read_u32()? as usize;
        let raw = reader.read_bytes(body_len)?;
        if reader.remaining() != 0 {
            return Err(ProcessorFailure::malformed(
                "packet",
                format!("{} trailing bytes", reader.remaining()),
            ));
        }

        let body = if flags.is_compressed() {
            self.inflate(raw)?
        } else {
            raw.to_vec()
        };

        cx.context_mut().insert(&PACKET_FLAGS, flags);
        cx.collect(SsoPacket {
            sequence_id,
            command,
            body,
        });
        cx.mark_consumed();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Packet Encoder
// ----------------------------------------------------------------------------

/// [`SsoPacket`] → [`Frame`]
#[derive(Debug)]
pub struct PacketEncoder {
    pipeline: PacketEncoderPipeline,
    max_frame_size: usize,
}

impl PacketEncoder {
    pub fn new(config: &CodecConfig) -> Self {
        let pipeline = PacketEncoderPipeline::new(
            "packet-encoder",
            PipelineConfiguration::default(),
            AttributeContext::new,
        )
        .with_processor(Box::new(PayloadCompressor {
            threshold: config.compression_threshold,
        }))
        .with_processor(Box::new(PacketHeaderWriter))
        .with_processor(Box::new(ReservedFlagWriter))
        .with_processor(Box::new(PacketBodyWriter));

        Self {
            pipeline,
            max_frame_size: config.max_frame_size,
        }
    }

    pub fn pipeline(&self) -> &PacketEncoderPipeline {
        &self.pipeline
    }

    pub fn encode(&self, packet: &SsoPacket) -> ImwireResult<Frame> {
        let mut context = self.pipeline.create_context();
        let outcome = self.pipeline.process(packet, &mut context)?;
        let frame = Frame::new(outcome.outputs.concat());

        // measured with the length prefix, like the transport and FrameBuffer limits
        let size = frame.len() + LENGTH_PREFIX_SIZE;
        if size > self.max_frame_size {
            return Err(CodecError {
                stage: self.pipeline.stage(),
                processor: "frame-limit",
                element_type: packet.kind_name(),
                source: ProcessorFailure::TooLarge {
                    what: "frame",
                    size,
                    limit: self.max_frame_size,
                },
            }
            .into());
        }
        Ok(frame)
    }
}

// ----------------------------------------------------------------------------
// Packet Decoder
// ----------------------------------------------------------------------------

/// [`Frame`] → [`SsoPacket`]s (zero for keep-alives)
#[derive(Debug)]
pub struct PacketDecoder {
    pipeline: PacketDecoderPipeline,
}

impl PacketDecoder {
    pub fn new(config: &CodecConfig) -> Self {
        let pipeline = PacketDecoderPipeline::new(
            "packet-decoder",
            PipelineConfiguration::stop_when_consumed(),
            AttributeContext::new,
        )
        .with_processor(Box::new(KeepAliveFilter))
        .with_processor(Box::new(SsoPacketReader {
            max_body_size: config.max_frame_size,
        }));

        Self { pipeline }
    }

    pub fn decode(&self, frame: &Frame) -> ImwireResult<Vec<SsoPacket>> {
        let mut context = self.pipeline.create_context();
        let outcome = self.pipeline.process(frame, &mut context)?;
        if frame.is_empty() {
            debug!("keep-alive frame");
        }
        Ok(outcome.outputs)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
