//! Broker-side collaborators of a STOMP connection

use crate::{BrokerError, ServerMessage, StompConnection, StompVersion, SubscriptionRequest};
use async_trait::async_trait;
use std::sync::Arc;
use stompwire_proto::Frame;

/// Broker session that publishes messages on behalf of a connection
#[async_trait]
pub trait StompSession: Send + Sync {
    /// Whether messages sent through this session must not come back to the
    /// same connection
    fn is_no_local(&self) -> bool;

    /// Publish a message
    async fn send(&self, message: ServerMessage) -> Result<(), BrokerError>;
}

/// Broker core as seen from a STOMP connection
///
/// The manager owns sessions, subscriptions and transactions. Connections
/// reference them by id only.
#[async_trait]
pub trait StompManager: Send + Sync {
    /// Process bytes received on a connection
    ///
    /// The default implementation decodes and dispatches the frames and fails
    /// the connection when decoding breaks.
    async fn handle_buffer(&self, connection: &StompConnection, buffer: &[u8]) {
        if let Err(failure) = connection.decode_buffer(buffer).await {
            connection.fail(failure).await;
        }
    }

    /// Release everything the broker holds for a torn down connection
    async fn cleanup(&self, connection: &StompConnection);

    /// Check client credentials
    async fn validate_user(&self, login: Option<&str>, passcode: Option<&str>) -> bool;

    /// Host name clients must send in the 1.1 `host` header
    fn virtual_host_name(&self) -> String;

    /// Protocol versions listed in version negotiation errors
    fn supported_versions_as_string(&self) -> String {
        StompVersion::supported_as_string()
    }

    /// Allocate a fresh message with a broker id
    fn create_server_message(&self) -> ServerMessage;

    /// Non-transacted session of the connection
    async fn session(&self, connection: &StompConnection) -> Result<Arc<dyn StompSession>, BrokerError>;

    /// Session bound to the transaction `tx_id`
    async fn transacted_session(
        &self,
        connection: &StompConnection,
        tx_id: &str,
    ) -> Result<Arc<dyn StompSession>, BrokerError>;

    /// Create a subscription
    async fn create_subscription(
        &self,
        connection: &StompConnection,
        request: SubscriptionRequest,
    ) -> Result<(), BrokerError>;

    /// Remove a subscription
    async fn unsubscribe(&self, connection: &StompConnection, subscription_id: &str) -> Result<(), BrokerError>;

    /// Acknowledge a delivered message
    async fn acknowledge(
        &self,
        connection: &StompConnection,
        message_id: &str,
        subscription_id: Option<&str>,
    ) -> Result<(), BrokerError>;

    /// Reject a delivered message
    async fn negative_acknowledge(
        &self,
        _connection: &StompConnection,
        _message_id: &str,
        _subscription_id: &str,
    ) -> Result<(), BrokerError> {
        Err(BrokerError::Unsupported("NACK".to_string()))
    }

    /// Begin a transaction
    async fn begin_transaction(&self, connection: &StompConnection, tx_id: &str) -> Result<(), BrokerError>;

    /// Commit a transaction
    async fn commit_transaction(&self, connection: &StompConnection, tx_id: &str) -> Result<(), BrokerError>;

    /// Roll back a transaction
    async fn abort_transaction(&self, connection: &StompConnection, tx_id: &str) -> Result<(), BrokerError>;

    /// Deliver a frame to the client
    ///
    /// The default implementation writes straight to the transport and fails
    /// the connection if that is not possible.
    async fn send_reply(&self, connection: &StompConnection, frame: &Frame) {
        if let Err(failure) = connection.physical_send(frame).await {
            connection.fail(failure).await;
        }
    }
}
