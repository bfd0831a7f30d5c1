//! Message element codec
//!
//! Encoding folds a message chain into TLV wire elements. Elements are routed
//! by kind to the processors registered for them. An element whose kind no
//! processor accepts becomes a single placeholder entry; an element that a
//! processor accepts but fails on is dropped without touching its neighbours.
//! An element too large for the wire fails the whole message instead, so a
//! chain is never sent with its content silently cut out. Every encoded body
//! ends with one general-flags entry.
//!
//! Decoding is the mirror image. Entries are decoded independently and in wire
//! order; unknown tags and entries that fail to decode are logged and skipped.

use tracing::{debug, trace, warn};

use super::element::{ElementKind, MessageElement};
use super::wire::{tags, ByteReader, WireElement};
use crate::attributes::{AttributeContext, AttributeKey};
use crate::config::CodecConfig;
use crate::errors::{ImwireResult, ProcessorFailure, SendFailure};
use crate::pipeline::{PipelineConfiguration, Processor, ProcessorContext, ProcessorPipeline};

// ----------------------------------------------------------------------------
// Message Flags
// ----------------------------------------------------------------------------

/// Bits of the general-flags entry
pub mod flags {
    /// Set on every message this client produces
    pub const BASELINE: u32 = 0x0000_0001;
    pub const HAS_MENTION: u32 = 0x0000_0002;
    pub const HAS_IMAGE: u32 = 0x0000_0004;
    pub const HAS_PLACEHOLDER: u32 = 0x0000_0008;
}

/// Accumulated general flags of the message being encoded or decoded
pub const GENERAL_FLAGS: AttributeKey<u32> = AttributeKey::new("message.general-flags");

/// Number of placeholder entries seen while decoding
pub const PLACEHOLDERS_SEEN: AttributeKey<usize> = AttributeKey::new("message.placeholders-seen");

fn general_flags(context: &mut AttributeContext) -> &mut u32 {
    context.get_or_insert_with(&GENERAL_FLAGS, || flags::BASELINE)
}

pub type ElementEncoderProcessor = dyn Processor<AttributeContext, MessageElement, WireElement>;
pub type ElementDecoderProcessor = dyn Processor<AttributeContext, WireElement, MessageElement>;

pub type MessageEncoderPipeline =
    ProcessorPipeline<ElementEncoderProcessor, AttributeContext, MessageElement, WireElement>;
pub type MessageDecoderPipeline =
    ProcessorPipeline<ElementDecoderProcessor, AttributeContext, WireElement, MessageElement>;

// ----------------------------------------------------------------------------
// Element Encoders
// ----------------------------------------------------------------------------

/// Encodes `Text`; empty runs contribute nothing
pub struct TextEncoder;

impl Processor<AttributeContext, MessageElement, WireElement> for TextEncoder {
    fn name(&self) -> &'static str {
        "text"
    }

    fn accepts(&self, input: &MessageElement) -> bool {
        input.kind() == ElementKind::Text
    }

    fn process(
        &self,
        input: &MessageElement,
        cx: &mut ProcessorContext<'_, AttributeContext, WireElement>,
    ) -> Result<(), ProcessorFailure> {
        if let MessageElement::Text { content } = input {
            if !content.is_empty() {
                cx.collect(WireElement::new(tags::TEXT, content.as_bytes().to_vec())?);
            }
            cx.mark_consumed();
        }
        Ok(())
    }
}

/// Encodes `At` as target id followed by display text
pub struct MentionEncoder;

impl Processor<AttributeContext, MessageElement, WireElement> for MentionEncoder {
    fn name(&self) -> &'static str {
        "at"
    }

    fn accepts(&self, input: &MessageElement) -> bool {
        input.kind() == ElementKind::At
    }

    fn process(
        &self,
        input: &MessageElement,
        cx: &mut ProcessorContext<'_, AttributeContext, WireElement>,
    ) -> Result<(), ProcessorFailure> {
        if let MessageElement::At { target, display } = input {
            let mut body = Vec::with_capacity(8 + display.len());
            body.extend_from_slice(&target.to_be_bytes());
            body.extend_from_slice(display.as_bytes());
            cx.collect(WireElement::new(tags::AT, body)?);
            *general_flags(cx.context_mut()) |= flags::HAS_MENTION;
            cx.mark_consumed();
        }
        Ok(())
    }
}

pub struct FaceEncoder;

impl Processor<AttributeContext, MessageElement, WireElement> for FaceEncoder {
    fn name(&self) -> &'static str {
        "face"
    }

    fn accepts(&self, input: &MessageElement) -> bool {
        input.kind() == ElementKind::Face
    }

    fn process(
        &self,
        input: &MessageElement,
        cx: &mut ProcessorContext<'_, AttributeContext, WireElement>,
    ) -> Result<(), ProcessorFailure> {
        if let MessageElement::Face { id } = input {
            cx.collect(WireElement::new(tags::FACE, id.to_be_bytes().to_vec())?);
            cx.mark_consumed();
        }
        Ok(())
    }
}

/// Encodes `Image` as width, height and the image id
pub struct ImageEncoder;

impl Processor<AttributeContext, MessageElement, WireElement> for ImageEncoder {
    fn name(&self) -> &'static str {
        "image"
    }

    fn accepts(&self, input: &MessageElement) -> bool {
        input.kind() == ElementKind::Image
    }

    fn process(
        &self,
        input: &MessageElement,
        cx: &mut ProcessorContext<'_, AttributeContext, WireElement>,
    ) -> Result<(), ProcessorFailure> {
        if let MessageElement::Image {
            image_id,
            width,
            height,
        } = input
        {
            if image_id.is_empty() {
                return Err(ProcessorFailure::malformed("image", "empty image id"));
            }
            let mut body = Vec::with_capacity(4 + image_id.len());
            body.extend_from_slice(&width.to_be_bytes());
            body.extend_from_slice(&height.to_be_bytes());
            body.extend_from_slice(image_id.as_bytes());
            cx.collect(WireElement::new(tags::IMAGE, body)?);
            *general_flags(cx.context_mut()) |= flags::HAS_IMAGE;
            cx.mark_consumed();
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Element Decoders
// ----------------------------------------------------------------------------

pub struct TextDecoder;

impl Processor<AttributeContext, WireElement, MessageElement> for TextDecoder {
    fn name(&self) -> &'static str {
        "text"
    }

    fn accepts(&self, input: &WireElement) -> bool {
        input.tag == tags::TEXT
    }

    fn process(
        &self,
        input: &WireElement,
        cx: &mut ProcessorContext<'_, AttributeContext, MessageElement>,
    ) -> Result<(), ProcessorFailure> {
        let content = ByteReader::new(&input.body).read_rest_utf8("text")?;
        cx.collect(MessageElement::Text { content });
        cx.mark_consumed();
        Ok(())
    }
}

pub struct MentionDecoder;

impl Processor<AttributeContext, WireElement, MessageElement> for MentionDecoder {
    fn name(&self) -> &'static str {
        "at"
    }

    fn accepts(&self, input: &WireElement) -> bool {
        input.tag == tags::AT
    }

    fn process(
        &self,
        input: &WireElement,
        cx: &mut ProcessorContext<'_, AttributeContext, MessageElement>,
    ) -> Result<(), ProcessorFailure> {
        let mut reader = ByteReader::new(&input.body);
        let target = reader.read_u64()?;
        let display = reader.read_rest_utf8("at.display")?;
        cx.collect(MessageElement::At { target, display });
        cx.mark_consumed();
        Ok(())
    }
}

pub struct FaceDecoder;

impl Processor<AttributeContext, WireElement, MessageElement> for FaceDecoder {
    fn name(&self) -> &'static str {
        "face"
    }

    fn accepts(&self, input: &WireElement) -> bool {
        input.tag == tags::FACE
    }

    fn process(
        &self,
        input: &WireElement,
        cx: &mut ProcessorContext<'_, AttributeContext, MessageElement>,
    ) -> Result<(), ProcessorFailure> {
        if input.body.len() != 4 {
            return Err(ProcessorFailure::malformed(
                "face",
                format!("expected 4 bytes, got {}", input.body.len()),
            ));
        }
        let id = ByteReader::new(&input.body).read_u32()?;
        cx.collect(MessageElement::Face { id });
        cx.mark_consumed();
        Ok(())
    }
}

pub struct ImageDecoder;

impl Processor<AttributeContext, WireElement, MessageElement> for ImageDecoder {
    fn name(&self) -> &'static str {
        "image"
    }

    fn accepts(&self, input: &WireElement) -> bool {
        input.tag == tags::IMAGE
    }

    fn process(
        &self,
        input: &WireElement,
        cx: &mut ProcessorContext<'_, AttributeContext, MessageElement>,
    ) -> Result<(), ProcessorFailure> {
        let mut reader = ByteReader::new(&input.body);
        let width = reader.read_u16()?;
        let height = reader.read_u16()?;
        let image_id = reader.read_rest_utf8("image.id")?;
        if image_id.is_empty() {
            return Err(ProcessorFailure::malformed("image", "empty image id"));
        }
        cx.collect(MessageElement::Image {
            image_id,
            width,
            height,
        });
        cx.mark_consumed();
        Ok(())
    }
}

/// Records the general flags; contributes no element
pub struct GeneralFlagsDecoder;

impl Processor<AttributeContext, WireElement, MessageElement> for GeneralFlagsDecoder {
    fn name(&self) -> &'static str {
        "general-flags"
    }

    fn accepts(&self, input: &WireElement) -> bool {
        input.tag == tags::GENERAL_FLAGS
    }

    fn process(
        &self,
        input: &WireElement,
        cx: &mut ProcessorContext<'_, AttributeContext, MessageElement>,
    ) -> Result<(), ProcessorFailure> {
        let value = ByteReader::new(&input.body).read_u32()?;
        cx.context_mut().insert(&GENERAL_FLAGS, value);
        cx.mark_consumed();
        Ok(())
    }
}

/// Counts placeholders; they carry no structured content
pub struct PlaceholderDecoder;

impl Processor<AttributeContext, WireElement, MessageElement> for PlaceholderDecoder {
    fn name(&self) -> &'static str {
        "placeholder"
    }

    fn accepts(&self, input: &WireElement) -> bool {
        input.tag == tags::PLACEHOLDER
    }

    fn process(
        &self,
        _input: &WireElement,
        cx: &mut ProcessorContext<'_, AttributeContext, MessageElement>,
    ) -> Result<(), ProcessorFailure> {
        *cx.context_mut().get_or_insert_with(&PLACEHOLDERS_SEEN, || 0) += 1;
        cx.mark_consumed();
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Message Encoder
// ----------------------------------------------------------------------------

/// Message chain → message body bytes
#[derive(Debug)]
pub struct MessageEncoder {
    pipeline: MessageEncoderPipeline,
    max_message_size: usize,
}

impl MessageEncoder {
    pub fn new(config: &CodecConfig) -> Self {
        let pipeline = MessageEncoderPipeline::new(
            "message-encoder",
            PipelineConfiguration::stop_when_consumed(),
            AttributeContext::new,
        )
        .with_processor(Box::new(TextEncoder))
        .with_processor(Box::new(MentionEncoder))
        .with_processor(Box::new(FaceEncoder))
        .with_processor(Box::new(ImageEncoder));

        Self::with_pipeline(pipeline, config.max_message_size)
    }

    /// Use a custom processor set
    pub fn with_pipeline(pipeline: MessageEncoderPipeline, max_message_size: usize) -> Self {
        Self {
            pipeline,
            max_message_size,
        }
    }

    /// Encode the chain into TLV entries, placeholders and the flags entry included
    pub fn encode_elements(&self, chain: &[MessageElement]) -> ImwireResult<Vec<WireElement>> {
        let mut context = self.pipeline.create_context();
        let mut elements = Vec::with_capacity(chain.len() + 1);

        for element in chain {
            if !self.pipeline.can_handle(element) {
                debug!(kind = ?element.kind(), "no encoder for element, writing placeholder");
                *general_flags(&mut context) |= flags::HAS_PLACEHOLDER;
                elements.push(WireElement::placeholder(&element.fallback_text()));
                continue;
            }

            match self.pipeline.process(element, &mut context) {
                Ok(outcome) if outcome.outputs.is_empty() => {
                    trace!(kind = ?element.kind(), "element encoded to nothing, dropped");
                }
                Ok(outcome) => elements.extend(outcome.outputs),
                Err(error) => {
                    if let ProcessorFailure::TooLarge { size, .. } = error.source {
                        return Err(SendFailure::MessageTooLarge {
                            size,
                            limit: self.max_message_size,
                        }
                        .into());
                    }
                    warn!(%error, "dropping element that failed to encode");
                }
            }
        }

        let value = *general_flags(&mut context);
        elements.push(WireElement {
            tag: tags::GENERAL_FLAGS,
            body: value.to_be_bytes().to_vec(),
        });
        Ok(elements)
    }

    /// Encode the chain into a message body
    pub fn encode(&self, chain: &[MessageElement]) -> ImwireResult<Vec<u8>> {
        let elements = self.encode_elements(chain)?;
        let size: usize = elements.iter().map(WireElement::encoded_len).sum();
        if size > self.max_message_size {
            return Err(SendFailure::MessageTooLarge {
                size,
                limit: self.max_message_size,
            }
            .into());
        }

        let mut body = Vec::with_capacity(size);
        for element in &elements {
            element.write_to(&mut body);
        }
        Ok(body)
    }
}

// ----------------------------------------------------------------------------
// Message Decoder
// ----------------------------------------------------------------------------

/// Decoded message body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedMessage {
    pub elements: Vec<MessageElement>,
    /// General flags, if the body carried them
    pub flags: Option<u32>,
    /// Entries that were skipped (unknown tag, decode failure, truncated tail)
    pub skipped: usize,
    pub placeholders: usize,
}

/// Message body bytes → message chain
#[derive(Debug)]
pub struct MessageDecoder {
    pipeline: MessageDecoderPipeline,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDecoder {
    pub fn new() -> Self {
        let pipeline = MessageDecoderPipeline::new(
            "message-decoder",
            PipelineConfiguration::stop_when_consumed(),
            AttributeContext::new,
        )
        .with_processor(Box::new(TextDecoder))
        .with_processor(Box::new(MentionDecoder))
        .with_processor(Box::new(FaceDecoder))
        .with_processor(Box::new(ImageDecoder))
        .with_processor(Box::new(GeneralFlagsDecoder))
        .with_processor(Box::new(PlaceholderDecoder));

        Self::with_pipeline(pipeline)
    }

    pub fn with_pipeline(pipeline: MessageDecoderPipeline) -> Self {
        Self { pipeline }
    }

    pub fn decode(&self, body: &[u8]) -> DecodedMessage {
        let (entries, tail) = WireElement::split(body);
        let mut skipped = 0;
        if let Some(error) = tail {
            warn!(%error, "message body has a truncated trailing element");
            skipped += 1;
        }

        let mut context = self.pipeline.create_context();
        let mut elements = Vec::with_capacity(entries.len());

        for entry in &entries {
            if !self.pipeline.can_handle(entry) {
                debug!(tag = entry.tag, len = entry.body.len(), "skipping unsupported element");
                skipped += 1;
                continue;
            }

            match self.pipeline.process(entry, &mut context) {
                Ok(outcome) => elements.extend(outcome.outputs),
                Err(error) => {
                    warn!(%error, "skipping element that failed to decode");
                    skipped += 1;
                }
            }
        }

        DecodedMessage {
            elements,
            flags: context.get(&GENERAL_FLAGS).copied(),
            skipped,
            placeholders: context.get(&PLACEHOLDERS_SEEN).copied().unwrap_or(0),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
