//! Process-wide pipeline trace switch
//!
//! Independent of the `tracing` level filter: processor-level tracing formats
//! payload previews, so it is only produced when this switch is on. The switch
//! is a single relaxed atomic load on the hot path.

use core::sync::atomic::{AtomicBool, Ordering};

static PIPELINE_TRACE: AtomicBool = AtomicBool::new(false);

/// Maximum number of payload bytes rendered in a trace line
pub const PREVIEW_BYTES: usize = 32;

/// Turn pipeline tracing on or off for the whole process
pub fn set_enabled(enabled: bool) {
    PIPELINE_TRACE.store(enabled, Ordering::Relaxed);
}

pub fn is_enabled() -> bool {
    PIPELINE_TRACE.load(Ordering::Relaxed)
}

/// Hex preview of a payload, truncated to [`PREVIEW_BYTES`]
pub fn preview(bytes: &[u8]) -> String {
    if bytes.len() <= PREVIEW_BYTES {
        hex::encode(bytes)
    } else {
        format!("{}..(+{})", hex::encode(&bytes[..PREVIEW_BYTES]), bytes.len() - PREVIEW_BYTES)
    }
}
