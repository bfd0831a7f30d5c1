//! Structured message elements

use core::fmt;
use serde::{Deserialize, Serialize};

use crate::pipeline::PipelineInput;

/// One element of a message chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageElement {
    /// Plain text run
    Text { content: String },
    /// Mention of a user, rendered with `display`
    At { target: u64, display: String },
    /// Built-in emoticon
    Face { id: u32 },
    /// Previously uploaded image
    Image {
        image_id: String,
        width: u16,
        height: u16,
    },
    /// Nudge; has no wire encoding and travels as a placeholder
    Poke { id: u32 },
}

/// Closed set of element kinds used for processor routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Text,
    At,
    Face,
    Image,
    Poke,
}

impl MessageElement {
    pub fn text<T: Into<String>>(content: T) -> Self {
        MessageElement::Text {
            content: content.into(),
        }
    }

    pub fn at<T: Into<String>>(target: u64, display: T) -> Self {
        MessageElement::At {
            target,
            display: display.into(),
        }
    }

    pub fn face(id: u32) -> Self {
        MessageElement::Face { id }
    }

    pub fn image<T: Into<String>>(image_id: T, width: u16, height: u16) -> Self {
        MessageElement::Image {
            image_id: image_id.into(),
            width,
            height,
        }
    }

    pub fn kind(&self) -> ElementKind {
        match self {
            MessageElement::Text { .. } => ElementKind::Text,
            MessageElement::At { .. } => ElementKind::At,
            MessageElement::Face { .. } => ElementKind::Face,
            MessageElement::Image { .. } => ElementKind::Image,
            MessageElement::Poke { .. } => ElementKind::Poke,
        }
    }

    /// Text shown by clients that cannot render the element
    pub fn fallback_text(&self) -> String {
        match self {
            MessageElement::Text { content } => content.clone(),
            MessageElement::At { display, .. } => format!("@{}", display),
            MessageElement::Face { id } => format!("[face:{}]", id),
            MessageElement::Image { .. } => "[image]".to_string(),
            MessageElement::Poke { .. } => "[poke]".to_string(),
        }
    }
}

impl PipelineInput for MessageElement {
    fn kind_name(&self) -> &'static str {
        match self.kind() {
            ElementKind::Text => "text",
            ElementKind::At => "at",
            ElementKind::Face => "face",
            ElementKind::Image => "image",
            ElementKind::Poke => "poke",
        }
    }
}

impl fmt::Display for MessageElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fallback_text())
    }
}
