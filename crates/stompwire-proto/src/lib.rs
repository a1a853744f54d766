//! # Stompwire Protocol
//!
//! STOMP frame types, the incremental decoder and the frame encoder used by
//! the stompwire connection layer.

#![warn(missing_docs)]

/// Frame structure and serialization
pub mod frame;

/// Incremental frame decoder
pub mod codec;

/// Error types for frame decoding
pub mod error;

pub use codec::{Frames, StompDecoder, MAX_FRAME_SIZE};
pub use error::DecodeError;
pub use frame::{Command, Escaping, Frame, Headers};
