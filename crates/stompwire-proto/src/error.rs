//! Error types for frame decoding

use thiserror::Error;

/// Errors raised while turning raw bytes into STOMP frames.
///
/// Every variant means the byte stream can no longer be trusted, so callers
/// treat a decode error as fatal for the connection that produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Command line is empty or contains something other than ASCII letters
    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    /// Header line could not be parsed
    #[error("Invalid header: {0:?}")]
    InvalidHeader(String),

    /// Command or header bytes are not valid UTF-8
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    /// `content-length` header is not a non-negative integer
    #[error("Invalid content-length: {0:?}")]
    InvalidContentLength(String),

    /// Body declared by `content-length` is not followed by a NUL byte
    #[error("Frame body is not NUL terminated")]
    MissingTerminator,

    /// Frame too large
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Buffered frame size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },

    /// Underlying reader failed
    #[error("Read error: {0}")]
    Io(String),
}
