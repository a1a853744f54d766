use super::{
    authenticate, connected_frame, message_frame, on_disconnect, on_send, on_subscribe, on_transaction,
    receipt_for, required, unsupported, FrameHandler,
};
use crate::{ProtocolError, ServerMessage, StompConnection, StompSubscription, StompVersion};
use async_trait::async_trait;
use stompwire_proto::{Command, Frame};

/// STOMP 1.0 frame handler
///
/// No host check, no heart-beating, no header escaping. Subscription ids may
/// be derived from the destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct V10Handler;

impl V10Handler {
    async fn on_connect(&self, connection: &StompConnection, frame: &Frame) -> Result<Option<Frame>, ProtocolError> {
        authenticate(connection, frame).await?;
        Ok(Some(connected_frame(connection, frame)))
    }

    async fn on_unsubscribe(&self, connection: &StompConnection, frame: &Frame) -> Result<(), ProtocolError> {
        connection.validate()?;
        let subscription_id = match (frame.header("id"), frame.header("destination")) {
            (Some(id), _) => id.to_string(),
            (None, Some(destination)) => format!("subscription/{}", destination),
            (None, None) => {
                return Err(ProtocolError::new(
                    "Must specify the subscription's id or the destination you are unsubscribing from",
                ))
            }
        };
        connection.unsubscribe(&subscription_id).await
    }

    async fn on_ack(&self, connection: &StompConnection, frame: &Frame) -> Result<(), ProtocolError> {
        connection.validate()?;
        let message_id = required(frame, "message-id", "Message id is required.")?;
        connection.acknowledge(message_id, frame.header("subscription")).await
    }
}

#[async_trait]
impl FrameHandler for V10Handler {
    fn version(&self) -> StompVersion {
        StompVersion::V1_0
    }

    async fn handle_frame(
        &self,
        connection: &StompConnection,
        frame: &Frame,
    ) -> Result<Option<Frame>, ProtocolError> {
        let command = frame.known_command().ok_or_else(|| unsupported(frame))?;

        match command {
            Command::Connect | Command::Stomp => return self.on_connect(connection, frame).await,
            Command::Disconnect => {
                on_disconnect(connection, frame).await;
                return Ok(None);
            }
            Command::Send => on_send(connection, frame).await?,
            Command::Subscribe => on_subscribe(connection, frame).await?,
            Command::Unsubscribe => self.on_unsubscribe(connection, frame).await?,
            Command::Ack => self.on_ack(connection, frame).await?,
            Command::Begin | Command::Commit | Command::Abort => on_transaction(connection, frame, command).await?,
            _ => return Err(unsupported(frame)),
        }

        Ok(receipt_for(frame))
    }

    fn create_message_frame(
        &self,
        message: &ServerMessage,
        subscription: &StompSubscription,
        delivery_count: u32,
    ) -> Result<Frame, ProtocolError> {
        message_frame(message, subscription, delivery_count, self.escaping(), false)
    }
}
