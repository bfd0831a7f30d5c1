//! Length-prefixed stream framing
//!
//! On the stream every frame is preceded by a big-endian `u32` holding the
//! total length of the frame *including* the four length bytes.

use core::fmt;

use crate::errors::ProcessorFailure;
use crate::pipeline::PipelineInput;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// One length-delimited binary unit exchanged with the transport
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Frame(Vec<u8>);

impl Frame {
    pub fn new(payload: Vec<u8>) -> Self {
        Self(payload)
    }

    pub fn payload(&self) -> &[u8] {
        &self.0
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stream representation: length prefix followed by the payload
    pub fn to_length_prefixed(&self) -> Vec<u8> {
        let total = (self.0.len() + LENGTH_PREFIX_SIZE) as u32;
        let mut out = Vec::with_capacity(total as usize);
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(&self.0);
        out
    }
}

impl PipelineInput for Frame {
    fn kind_name(&self) -> &'static str {
        if self.0.is_empty() {
            "keep-alive-frame"
        } else {
            "frame"
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame({} bytes: {})", self.0.len(), crate::trace::preview(&self.0))
    }
}

// ----------------------------------------------------------------------------
// Frame Buffer
// ----------------------------------------------------------------------------

/// Accumulates stream bytes and yields complete frames
#[derive(Debug)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet part of a complete frame
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next complete frame, if one has fully arrived
    pub fn try_next(&mut self) -> Result<Option<Frame>, ProcessorFailure> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let total = u32::from_be_bytes(prefix) as usize;

        if total < LENGTH_PREFIX_SIZE {
            return Err(ProcessorFailure::malformed(
                "frame length",
                format!("{} is shorter than the prefix itself", total),
            ));
        }
        if total > self.max_frame_size {
            return Err(ProcessorFailure::TooLarge {
                what: "frame",
                size: total,
                limit: self.max_frame_size,
            });
        }
        if self.buffer.len() < total {
            return Ok(None);
        }

        let payload = self.buffer[LENGTH_PREFIX_SIZE..total].to_vec();
        self.buffer.drain(..total);
        Ok(Some(Frame(payload)))
    }
}
