//! Error types for channel, layout, and region operations.
//!
//! Every variant is unrecoverable at the point of detection: a corrupted or
//! partial exchange must never be treated as valid simulation input, so
//! nothing here is retried automatically. The simulation driver decides
//! whether to abort the run.

use thiserror::Error;

use tether_core::{ForceMode, Precision};

use crate::layout::BufferKind;

/// Errors raised by channel construction, transfer, and reallocation.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Array shape does not match the region's configured capacity.
    #[error("size mismatch on {buffer} buffer: region holds {expected} records, got {got}")]
    SizeMismatch {
        /// Buffer the mismatched array was bound for.
        buffer: BufferKind,
        /// Record capacity configured by the active layout.
        expected: usize,
        /// Record count actually supplied.
        got: usize,
    },

    /// The peer tore down, never attached, or the channel was closed locally.
    #[error("channel closed")]
    ChannelClosed,

    /// Region creation or resize failed; prior buffers remain untouched.
    #[error("allocation failure: {message}")]
    AllocationFailure {
        /// What failed, including the underlying OS error where available.
        message: String,
    },

    /// Device IPC handle export or import failed (device channel only).
    /// Never retried: mid-simulation device-context recovery is unsupported.
    #[error("handle exchange failure: {message}")]
    HandleExchange {
        /// What failed, including the driver status.
        message: String,
    },

    /// The channel was created under a different element precision.
    #[error("precision mismatch: channel is {found}, caller expects {expected}")]
    PrecisionMismatch {
        /// Precision the caller's element type implies.
        expected: Precision,
        /// Precision recorded in the channel header.
        found: Precision,
    },

    /// The peer did not publish within the receive timeout.
    #[error("timed out after {waited_ms} ms waiting for {buffer} buffer")]
    Timeout {
        /// Buffer the receive was waiting on.
        buffer: BufferKind,
        /// Configured timeout in milliseconds.
        waited_ms: u64,
    },

    /// The mapped header is not a valid exchange header.
    #[error("invalid channel header: {message}")]
    InvalidHeader {
        /// Description of the defect.
        message: &'static str,
    },

    /// A token minted under a previous generation was resolved after a
    /// reallocation invalidated it.
    #[error("stale token: minted at generation {minted}, channel at {current}")]
    StaleToken {
        /// Generation the token was minted under.
        minted: u64,
        /// Channel's current generation.
        current: u64,
    },

    /// Echo read attempted on a channel whose mode reserves no echo
    /// sub-region.
    #[error("force mode {mode:?} reserves no position-echo sub-region")]
    EchoUnavailable {
        /// The channel's force mode.
        mode: ForceMode,
    },

    /// A device-side copy or driver call failed (device channel only).
    #[cfg(feature = "cuda")]
    #[error("device fault: {message}")]
    DeviceFault {
        /// What failed, including the driver status.
        message: String,
    },
}

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;
