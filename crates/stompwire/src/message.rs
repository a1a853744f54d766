//! Broker messages and subscription descriptors

use crate::ProtocolError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Message body as stored by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Text payload
    Text(String),
    /// Opaque binary payload
    Bytes(Bytes),
}

impl Default for MessageBody {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageBody {
    /// Raw body bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }

    /// Body length in bytes
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the body is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned copy of the body bytes
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Self::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }
}

/// Message exchanged with the broker core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// Broker assigned identifier
    pub message_id: u64,
    /// Target address
    pub destination: String,
    /// Payload
    pub body: MessageBody,
    /// Priority, 0 to 9
    pub priority: u8,
    /// Creation time in milliseconds since the epoch
    pub timestamp: u64,
    /// Expiry time in milliseconds since the epoch, 0 for never
    pub expiration: u64,
    /// Whether the message survives a broker restart
    pub durable: bool,
    /// Correlation identifier
    pub correlation_id: Option<String>,
    /// Reply address
    pub reply_to: Option<String>,
    /// Application message type
    pub message_type: Option<String>,
    /// String properties, ordered by key
    pub properties: BTreeMap<String, String>,
}

impl ServerMessage {
    /// Create an empty message with the given id
    pub fn new(message_id: u64) -> Self {
        Self {
            message_id,
            priority: 4,
            ..Default::default()
        }
    }

    /// Set the destination
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = destination.into();
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: MessageBody) -> Self {
        self.body = body;
        self
    }

    /// Set a string property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a string property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Acknowledgement mode of a subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckMode {
    /// Messages are acknowledged on delivery
    #[default]
    Auto,
    /// ACK acknowledges the message and everything delivered before it
    Client,
    /// ACK acknowledges only the named message
    ClientIndividual,
}

impl AckMode {
    /// Wire name of the mode
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Client => "client",
            Self::ClientIndividual => "client-individual",
        }
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "client" => Ok(Self::Client),
            "client-individual" => Ok(Self::ClientIndividual),
            other => Err(ProtocolError::new(format!("Invalid ack mode: {}", other))
                .with_body("ack must be one of auto, client, client-individual")),
        }
    }
}

/// SUBSCRIBE headers as sent by the client
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeHeaders {
    /// `destination` header
    pub destination: Option<String>,
    /// `selector` header
    pub selector: Option<String>,
    /// `ack` header
    pub ack: Option<String>,
    /// `id` header
    pub id: Option<String>,
    /// `durable-subscriber-name` header
    pub durable_subscription_name: Option<String>,
    /// `no-local` header set to true
    pub no_local: bool,
}

/// Subscription as handed to the broker for creation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Subscription identifier, unique per connection
    pub subscription_id: String,
    /// Destination to consume from
    pub destination: Option<String>,
    /// Message selector, including the no-local clause if requested
    pub selector: Option<String>,
    /// Acknowledgement mode
    pub ack_mode: AckMode,
    /// Durable subscription name
    pub durable_subscription_name: Option<String>,
    /// Whether messages sent by this connection are filtered out
    pub no_local: bool,
}

/// Subscription details needed to render a MESSAGE frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StompSubscription {
    /// Subscription identifier
    pub id: String,
    /// Acknowledgement mode
    pub ack_mode: AckMode,
}

impl StompSubscription {
    /// Create a subscription view
    pub fn new(id: impl Into<String>, ack_mode: AckMode) -> Self {
        Self {
            id: id.into(),
            ack_mode,
        }
    }
}
