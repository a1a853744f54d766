use super::{
    authenticate, connected_frame, message_frame, on_disconnect, on_send, on_subscribe, on_transaction,
    receipt_for, required, unsupported, FrameHandler,
};
use crate::{HeartBeat, ProtocolError, ServerMessage, StompConnection, StompSubscription, StompVersion};
use async_trait::async_trait;
use stompwire_proto::{Command, Frame};
use tracing::debug;

const SUBSCRIPTION_REQUIRED: &str = "Subscription id is required.";

/// STOMP 1.1 frame handler
#[derive(Debug, Default, Clone, Copy)]
pub struct V11Handler;

impl V11Handler {
    async fn on_connect(&self, connection: &StompConnection, frame: &Frame) -> Result<Option<Frame>, ProtocolError> {
        connection.set_host(frame.header("host"))?;
        let requested = match frame.header("heart-beat") {
            Some(value) => HeartBeat::parse(value)?,
            None => HeartBeat::default(),
        };

        authenticate(connection, frame).await?;
        let heart_beat = HeartBeat::negotiate(connection.config().heart_beat, requested);
        connection.set_heart_beat(heart_beat);
        debug!("Connection {} heart-beat {}", connection.id(), heart_beat);

        Ok(Some(
            connected_frame(connection, frame)
                .with_header("version", StompVersion::V1_1.as_str())
                .with_header("server", connection.server_name())
                .with_header("heart-beat", heart_beat.to_string()),
        ))
    }

    async fn on_subscribe(&self, connection: &StompConnection, frame: &Frame) -> Result<(), ProtocolError> {
        connection.validate()?;
        required(frame, "id", SUBSCRIPTION_REQUIRED)?;
        on_subscribe(connection, frame).await
    }

    async fn on_unsubscribe(&self, connection: &StompConnection, frame: &Frame) -> Result<(), ProtocolError> {
        connection.validate()?;
        let subscription_id = required(frame, "id", SUBSCRIPTION_REQUIRED)?;
        connection.unsubscribe(subscription_id).await
    }

    async fn on_ack(&self, connection: &StompConnection, frame: &Frame, command: Command) -> Result<(), ProtocolError> {
        connection.validate()?;
        let message_id = required(frame, "message-id", "Message id is required.")?;
        let subscription_id = required(frame, "subscription", SUBSCRIPTION_REQUIRED)?;

        if command == Command::Nack {
            connection.negative_acknowledge(message_id, subscription_id).await
        } else {
            connection.acknowledge(message_id, Some(subscription_id)).await
        }
    }
}

#[async_trait]
impl FrameHandler for V11Handler {
    fn version(&self) -> StompVersion {
        StompVersion::V1_1
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
            Command::Subscribe => self.on_subscribe(connection, frame).await?,
            Command::Unsubscribe => self.on_unsubscribe(connection, frame).await?,
            Command::Ack | Command::Nack => self.on_ack(connection, frame, command).await?,
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
        message_frame(message, subscription, delivery_count, self.escaping(), true)
    }
}
