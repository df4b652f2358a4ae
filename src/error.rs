//! # Error taxonomy
//!
//! A single error type shared by every layer of the driver stack. See the
//! per-variant docs for when each one is raised and what the caller is
//! expected to do about it.

use thiserror::Error;

use crate::xhci::trb::CompletionCode;

/// The error type returned by fallible operations in this crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// A poll loop (handshake, event wait, debounce, ...) exhausted its
    /// timeout budget before the awaited condition became true.
    #[error("operation timed out")]
    Timeout,

    /// The controller completed a command or transfer with a completion
    /// code other than `Success` or `ShortPacket`.
    #[error("completion error: {0:?}")]
    CompletionError(CompletionCode),

    /// The transport returned a value that could not have come from a
    /// correctly functioning controller (misaligned DMA pointer, register
    /// read outside the documented range, ...).
    #[error("transport error: {0}")]
    TransportError(String),

    /// A USB protocol invariant was violated: a descriptor had an
    /// inconsistent length, an impossible speed was reported, or an
    /// unrecognized TRB type was observed.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A resource needed to proceed was unavailable: no device slots left,
    /// a ring is full, no endpoint of the requested kind exists.
    #[error("resource error: {0}")]
    ResourceError(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DriverError>;
