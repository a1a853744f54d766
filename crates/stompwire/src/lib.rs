//! # Stompwire
//!
//! Broker-side STOMP 1.0/1.1 connection handling.
//!
//! A [`StompConnection`] terminates one client connection. It negotiates the
//! protocol version, binds the matching [`FrameHandler`] and turns client
//! frames into calls on a [`StompManager`], which stands for the broker core.
//! Bytes come in through [`StompConnection::buffer_received`], normally from
//! [`transport::drive`], and replies go out through a [`Transport`].

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use stompwire_proto as proto;

/// Error types for the connection layer
pub mod error;

/// Connection configuration and heart-beat settings
pub mod config;

/// Protocol versions and negotiation
pub mod version;

/// Broker messages and subscription descriptors
pub mod message;

/// Broker collaborator traits
pub mod manager;

/// Connection listeners and frame observer
pub mod listener;

/// Per-connection protocol state machine
pub mod connection;

/// Version-specific frame handlers
pub mod handler;

/// Transport trait and tokio stream adapter
pub mod transport;

/// Inbound liveness monitor
pub mod keepalive;

/// In-memory collaborators for tests
pub mod test_utils;

pub use config::{HeartBeat, StompConfig};
pub use connection::{StompConnection, CONNECTION_ID_PROPERTY};
pub use error::{BrokerError, ConnectionFailure, ProtocolError, StompError, TransportError};
pub use handler::{handler_for, FrameHandler, V10Handler, V11Handler};
pub use keepalive::KeepAlive;
pub use listener::{CloseListener, FailureListener, FrameObserver};
pub use manager::{StompManager, StompSession};
pub use message::{AckMode, MessageBody, ServerMessage, StompSubscription, SubscribeHeaders, SubscriptionRequest};
pub use transport::{drive, ConnectionId, StreamTransport, Transport};
pub use version::StompVersion;

/// Result type alias for stompwire operations
pub type Result<T> = std::result::Result<T, StompError>;
