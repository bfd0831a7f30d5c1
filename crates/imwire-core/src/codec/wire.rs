//! TLV wire elements and byte-level helpers
//!
//! A message body is a sequence of TLV entries:
//!
//! ```text
//! +-----+------------+-----------------+
//! | tag | length u16 | body (length B) |
//! +-----+------------+-----------------+
//! ```

use core::fmt;

use crate::errors::ProcessorFailure;
use crate::pipeline::PipelineInput;

/// Wire tags of message elements
pub mod tags {
    pub const TEXT: u8 = 0x01;
    pub const AT: u8 = 0x02;
    pub const FACE: u8 = 0x03;
    pub const IMAGE: u8 = 0x04;
    /// Message-wide reserved flags, written once per message
    pub const GENERAL_FLAGS: u8 = 0x25;
    /// Stand-in for an element this client cannot encode
    pub const PLACEHOLDER: u8 = 0x7F;
}

/// Size of the tag + length prefix
pub const ELEMENT_HEADER_SIZE: usize = 3;

// ----------------------------------------------------------------------------
// Wire Element
// ----------------------------------------------------------------------------

/// A single TLV entry
#[derive(Clone, PartialEq, Eq)]
pub struct WireElement {
    pub tag: u8,
    pub body: Vec<u8>,
}

impl WireElement {
    /// Create an entry, rejecting bodies that do not fit the length field
    pub fn new(tag: u8, body: Vec<u8>) -> Result<Self, ProcessorFailure> {
        if body.len() > u16::MAX as usize {
            return Err(ProcessorFailure::TooLarge {
                what: "element body",
                size: body.len(),
                limit: u16::MAX as usize,
            });
        }
        Ok(Self { tag, body })
    }

    /// Placeholder carrying the fallback text of an unsupported element
    pub fn placeholder(fallback: &str) -> Self {
        let mut body = fallback.as_bytes().to_vec();
        body.truncate(u16::MAX as usize);
        Self {
            tag: tags::PLACEHOLDER,
            body,
        }
    }

    pub fn encoded_len(&self) -> usize {
        ELEMENT_HEADER_SIZE + self.body.len()
    }

    /// Append the encoded entry to `out`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.tag);
        out.extend_from_slice(&(self.body.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.body);
    }

    /// Decode one entry, returning it and the bytes consumed
    pub fn decode(data: &[u8]) -> Result<(Self, usize), ProcessorFailure> {
        if data.len() < ELEMENT_HEADER_SIZE {
            return Err(ProcessorFailure::truncated(ELEMENT_HEADER_SIZE, data.len()));
        }

        let tag = data[0];
        let length = u16::from_be_bytes([data[1], data[2]]) as usize;

        let total_length = ELEMENT_HEADER_SIZE + length;
        if data.len() < total_length {
            return Err(ProcessorFailure::truncated(total_length, data.len()));
        }

        let body = data[ELEMENT_HEADER_SIZE..total_length].to_vec();
        Ok((Self { tag, body }, total_length))
    }

    /// Split a message body into entries
    ///
    /// Entries before a truncated tail are returned together with the error
    /// describing the tail, so callers can keep what was intact.
    pub fn split(mut data: &[u8]) -> (Vec<Self>, Option<ProcessorFailure>) {
        let mut elements = Vec::new();
        while !data.is_empty() {
            match Self::decode(data) {
                Ok((element, consumed)) => {
                    elements.push(element);
                    data = &data[consumed..];
                }
                Err(error) => return (elements, Some(error)),
            }
        }
        (elements, None)
    }
}

impl PipelineInput for WireElement {
    fn kind_name(&self) -> &'static str {
        match self.tag {
            tags::TEXT => "text-element",
            tags::AT => "at-element",
            tags::FACE => "face-element",
            tags::IMAGE => "image-element",
            tags::GENERAL_FLAGS => "general-flags",
            tags::PLACEHOLDER => "placeholder",
            _ => "unknown-element",
        }
    }
}

impl fmt::Debug for WireElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireElement")
            .field("tag", &format_args!("{:#04x}", self.tag))
            .field("body", &crate::trace::preview(&self.body))
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Byte Reader
// ----------------------------------------------------------------------------

/// Big-endian cursor over a byte slice
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProcessorFailure> {
        if self.remaining() < len {
            return Err(ProcessorFailure::truncated(len, self.remaining()));
        }
        let bytes = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ProcessorFailure> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.read_bytes(N)?);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8, ProcessorFailure> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProcessorFailure> {
        self.read_array().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, ProcessorFailure> {
        self.read_array().map(u32::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, ProcessorFailure> {
        self.read_array().map(i32::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, ProcessorFailure> {
        self.read_array().map(u64::from_be_bytes)
    }

    /// Read everything left as UTF-8
    pub fn read_rest_utf8(&mut self, field: &'static str) -> Result<String, ProcessorFailure> {
        let rest = self.read_bytes(self.remaining())?;
        String::from_utf8(rest.to_vec()).map_err(|_| ProcessorFailure::InvalidUtf8 { field })
    }

    /// Read a `u16`-length-prefixed UTF-8 string
    pub fn read_short_string(&mut self, field: &'static str) -> Result<String, ProcessorFailure> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProcessorFailure::InvalidUtf8 { field })
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.offset..];
        self.offset = self.data.len();
        rest
    }
}
