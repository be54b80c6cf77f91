//! Typed failures for the loader and configuration boundary
//!
//! Invariant violations inside the reconstruction are not represented here:
//! they indicate corrupted input or a bug and abort with a panic.

use thiserror::Error;

/// Raw trace input could not be interpreted
#[derive(Error, Debug)]
pub enum KdError {
    #[error("{width}-bit layout rejected: {reason}")]
    LayoutMismatch { width: u8, reason: String },

    #[error("trace matches neither pointer width (64-bit: {bits64}; 32-bit: {bits32})")]
    AmbiguousPointerWidth { bits64: String, bits32: String },

    #[error("bad RAW header magic 0x{found:08x} (expected 0x{expected:08x})")]
    BadMagic { expected: u32, found: u32 },

    #[error("trace truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reconstruction configuration is unusable
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("future_window_multiplier must be >= 1, got {0}")]
    FutureWindowMultiplier(u64),

    #[error("render_chunk_size must be > 0")]
    RenderChunkSize,
}

/// Illegal transition of a kernel message correlation record
///
/// Both variants are double observations of the same half of a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MsgTransitionError {
    #[error("kmsg 0x{kmsg:x} sent twice without a receive or free (event {event_index})")]
    DoubleSend { kmsg: u64, event_index: usize },

    #[error("kmsg 0x{kmsg:x} received twice without a send or free (event {event_index})")]
    DoubleRecv { kmsg: u64, event_index: usize },
}
