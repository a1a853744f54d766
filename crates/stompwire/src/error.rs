//! Error types for the stompwire connection layer

use std::io;
use stompwire_proto::{Command, DecodeError, Frame, Headers};
use thiserror::Error;

/// Boxed cause carried by a [`ProtocolError`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Recoverable protocol error
///
/// The error is rendered into an `ERROR` frame and sent back to the client.
/// The connection stays open.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProtocolError {
    message: String,
    headers: Headers,
    body: Option<String>,
    #[source]
    cause: Option<BoxError>,
}

impl ProtocolError {
    /// Create an error with the given `message` header
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            headers: Headers::new(),
            body: None,
            cause: None,
        }
    }

    /// Add an extra header to the rendered frame
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Set the text body of the rendered frame
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach the underlying cause
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Error message, sent as the `message` header
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Extra headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Text body
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Render as an `ERROR` frame
    pub fn to_frame(&self) -> Frame {
        let mut frame = Frame::command_frame(Command::Error).with_header("message", self.message.as_str());
        for (key, value) in self.headers.iter() {
            frame = frame.with_header(key, value);
        }
        if let Some(body) = &self.body {
            frame = frame
                .with_default_header("content-type", "text/plain")
                .with_body(body.clone());
        }
        frame
    }
}

/// Unrecoverable connection failure
///
/// Any of these tears the connection down through `StompConnection::fail`.
#[derive(Debug, Error)]
pub enum ConnectionFailure {
    /// Inbound bytes could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Transport read or write failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No data arrived within the keep-alive period
    #[error("No data received within the keep-alive period")]
    KeepAliveExpired,

    /// Connection is already destroyed
    #[error("Connection is closed")]
    Closed,
}

/// Errors returned by the broker collaborators
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Protocol error raised by the broker, passed to the client unchanged
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Referenced entity does not exist
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of entity (subscription, transaction, ...)
        kind: String,
        /// Identifier that was looked up
        id: String,
    },

    /// Operation is not supported by this broker
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Any other broker failure
    #[error("Broker error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Convert into a protocol error
    ///
    /// Protocol errors pass through unchanged. Anything else is wrapped in a
    /// new error with the given message, keeping `self` as the cause.
    pub fn into_protocol_error<F>(self, message: F) -> ProtocolError
    where
        F: FnOnce() -> String,
    {
        match self {
            Self::Protocol(e) => e,
            other => ProtocolError::new(message()).with_cause(other),
        }
    }
}

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport was closed
    #[error("Transport is closed")]
    Closed,
}

/// Main error type for stompwire operations
#[derive(Debug, Error)]
pub enum StompError {
    /// Protocol-level error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection failure
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionFailure),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<serde_json::Error> for StompError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("JSON error: {}", err))
    }
}
