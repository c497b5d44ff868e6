//! Shared error types for the Neural Protocol.

use std::time::Duration;
use thiserror::Error;

/// Protocol violations found while decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer is shorter than the fixed header, or otherwise unusable.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The version byte is not one this implementation speaks.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// The signal-type tag is not in the enumeration.
    #[error("Unknown signal type tag: {0}")]
    UnknownSignalType(u8),

    /// Declared payload length does not match the bytes available.
    #[error("Truncated payload: declared {declared} bytes, {available} available")]
    TruncatedPayload {
        /// Length from the header.
        declared: u32,
        /// Bytes actually present after the header.
        available: usize,
    },

    /// Payload bytes are not a valid JSON object.
    #[error("Payload decode error: {0}")]
    PayloadDecode(String),

    /// Payload exceeds the protocol maximum.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },
}

impl CodecError {
    /// Whether a stream can continue after this error.
    ///
    /// Recoverable errors affect exactly one frame whose extent is known.
    /// Header-level errors leave the stream position untrustworthy, so the
    /// connection must be reset.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::UnknownSignalType(_) | Self::PayloadDecode(_)
        )
    }
}

/// Delivery failures reported by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer or target cannot be reached right now. Retryable.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete within the attempt timeout. Retryable.
    #[error("Transport timed out after {0:?}")]
    Timeout(Duration),

    /// The transport was closed. Terminal for this instance.
    #[error("Transport closed")]
    Closed,

    /// Secure channel could not be established.
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TransportError {
    /// Whether the caller may retry the operation later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_) | Self::Io(_))
    }
}

/// Top-level error type.
#[derive(Error, Debug)]
pub enum NeuralError {
    /// Bad construction input. Caller bug, not retryable.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `start()` called on an agent that is already running.
    #[error("Agent is already running")]
    AlreadyRunning,

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Alias for Result with NeuralError.
pub type NeuralResult<T> = Result<T, NeuralError>;
