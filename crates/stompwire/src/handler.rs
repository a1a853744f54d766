//! Version-specific frame handling
//!
//! A connection binds exactly one [`FrameHandler`] when the protocol version
//! is negotiated. The command logic shared by both versions lives here, the
//! differences live in [`v10`] and [`v11`].

use crate::connection::CONNECTION_ID_PROPERTY;
use crate::{
    MessageBody, ProtocolError, ServerMessage, StompConnection, StompSubscription, StompVersion, SubscribeHeaders,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use stompwire_proto::{Command, Escaping, Frame};
use tracing::debug;

/// STOMP 1.0 handler
pub mod v10;

/// STOMP 1.1 handler
pub mod v11;

pub use v10::V10Handler;
pub use v11::V11Handler;

/// Protocol behaviour of one STOMP version
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Version implemented by this handler
    fn version(&self) -> StompVersion;

    /// Header escaping used on the wire
    fn escaping(&self) -> Escaping {
        self.version().escaping()
    }

    /// Execute a client frame, returning the reply to send, if any
    async fn handle_frame(
        &self,
        connection: &StompConnection,
        frame: &Frame,
    ) -> Result<Option<Frame>, ProtocolError>;

    /// Render a broker message as a MESSAGE frame
    fn create_message_frame(
        &self,
        message: &ServerMessage,
        subscription: &StompSubscription,
        delivery_count: u32,
    ) -> Result<Frame, ProtocolError>;
}

/// Handler for a negotiated version
pub fn handler_for(version: StompVersion) -> Arc<dyn FrameHandler> {
    match version {
        StompVersion::V1_0 => Arc::new(V10Handler),
        StompVersion::V1_1 => Arc::new(V11Handler),
    }
}

fn unsupported(frame: &Frame) -> ProtocolError {
    ProtocolError::new(format!("Unsupported command {}", frame.command()))
}

fn required<'a>(frame: &'a Frame, name: &str, message: &str) -> Result<&'a str, ProtocolError> {
    frame.header(name).ok_or_else(|| ProtocolError::new(message))
}

/// RECEIPT for a frame that asked for one
fn receipt_for(frame: &Frame) -> Option<Frame> {
    frame
        .header("receipt")
        .map(|receipt| Frame::command_frame(Command::Receipt).with_header("receipt-id", receipt))
}

/// Check credentials and record the client id
async fn authenticate(connection: &StompConnection, frame: &Frame) -> Result<(), ProtocolError> {
    let login = frame.header("login");
    let passcode = frame.header("passcode");

    if !connection.validate_user(login, passcode).await {
        let text = format!(
            "Security Error occurred: User name [{}] or password is invalid",
            login.unwrap_or("null")
        );
        return Err(ProtocolError::new(text.clone()).with_body(text));
    }

    if let Some(client_id) = frame.header("client-id") {
        connection.set_client_id(client_id);
    }
    Ok(())
}

/// CONNECTED headers common to both versions
fn connected_frame(connection: &StompConnection, frame: &Frame) -> Frame {
    let mut connected = Frame::command_frame(Command::Connected).with_header("session", connection.id().as_str());
    if let Some(request_id) = frame.header("request-id") {
        connected = connected.with_header("response-id", request_id);
    }
    connected
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ProtocolError> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::new(format!("Invalid {} header: {}", name, value)))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u64)
}

async fn on_send(connection: &StompConnection, frame: &Frame) -> Result<(), ProtocolError> {
    connection.validate()?;
    let destination = required(frame, "destination", "Destination header is required.")?;

    let mut message = connection.manager().create_server_message();
    message.destination = destination.to_string();
    message.body = if frame.headers().contains("content-length") {
        MessageBody::Bytes(frame.body().clone())
    } else {
        MessageBody::Text(frame.body_text().into_owned())
    };
    if message.timestamp == 0 {
        message.timestamp = now_millis();
    }

    for (key, value) in frame.headers().iter() {
        match key {
            "destination" | "transaction" | "receipt" | "content-length" => {}
            CONNECTION_ID_PROPERTY => {}
            "priority" => message.priority = parse_number::<u32>(key, value)?.min(9) as u8,
            "expires" => message.expiration = parse_number(key, value)?,
            "persistent" => message.durable = value.eq_ignore_ascii_case("true"),
            "correlation-id" => message.correlation_id = Some(value.to_string()),
            "reply-to" => message.reply_to = Some(value.to_string()),
            "type" => message.message_type = Some(value.to_string()),
            _ => {
                message.properties.insert(key.to_string(), value.to_string());
            }
        }
    }

    connection.send_server_message(message, frame.header("transaction")).await
}

/// SUBSCRIBE headers read from `frame`
fn subscribe_headers(frame: &Frame) -> SubscribeHeaders {
    SubscribeHeaders {
        destination: frame.header("destination").map(str::to_string),
        selector: frame.header("selector").map(str::to_string),
        ack: frame.header("ack").map(str::to_string),
        id: frame.header("id").map(str::to_string),
        durable_subscription_name: frame.header("durable-subscriber-name").map(str::to_string),
        no_local: frame
            .header("no-local")
            .is_some_and(|value| value.eq_ignore_ascii_case("true")),
    }
}

async fn on_subscribe(connection: &StompConnection, frame: &Frame) -> Result<(), ProtocolError> {
    connection.validate()?;
    let subscription_id = connection.subscribe(subscribe_headers(frame)).await?;
    debug!("Connection {} subscribed {}", connection.id(), subscription_id);
    Ok(())
}

async fn on_transaction(connection: &StompConnection, frame: &Frame, command: Command) -> Result<(), ProtocolError> {
    connection.validate()?;
    let tx_id = required(frame, "transaction", "Transaction header is required.")?;

    match command {
        Command::Begin => connection.begin_transaction(tx_id).await,
        Command::Commit => connection.commit_transaction(tx_id).await,
        _ => connection.abort_transaction(tx_id).await,
    }
}

async fn on_disconnect(connection: &StompConnection, frame: &Frame) {
    if let Some(receipt) = receipt_for(frame) {
        connection.send_frame(&receipt).await;
    }
    connection.destroy().await;
}

/// MESSAGE frame shared by both versions
///
/// `content-length` is set for binary bodies, and for text bodies too when
/// `always_content_length` is true. Properties that `escaping` cannot carry
/// are left out; a standard header that it cannot carry fails the frame.
fn message_frame(
    message: &ServerMessage,
    subscription: &StompSubscription,
    delivery_count: u32,
    escaping: Escaping,
    always_content_length: bool,
) -> Result<Frame, ProtocolError> {
    let encodable = |name: &str, value: &str| {
        if escaping.can_encode(name, value) {
            Ok(())
        } else {
            Err(ProtocolError::new(format!("Header {} cannot be sent to this client", name)))
        }
    };

    encodable("subscription", subscription.id.as_str())?;
    encodable("destination", message.destination.as_str())?;
    let mut frame = Frame::command_frame(Command::Message)
        .with_header("subscription", subscription.id.as_str())
        .with_header("message-id", message.message_id.to_string())
        .with_header("destination", message.destination.as_str());

    if delivery_count > 1 {
        frame = frame.with_header("redelivered", "true");
    }

    frame = frame
        .with_header("priority", message.priority.to_string())
        .with_header("timestamp", message.timestamp.to_string())
        .with_header("expires", message.expiration.to_string());

    let optional = [
        ("correlation-id", &message.correlation_id),
        ("reply-to", &message.reply_to),
        ("type", &message.message_type),
    ];
    for (name, value) in optional {
        if let Some(value) = value {
            encodable(name, value.as_str())?;
            frame = frame.with_header(name, value.as_str());
        }
    }

    for (key, value) in &message.properties {
        if key == CONNECTION_ID_PROPERTY || key == "content-length" {
            continue;
        }
        if !escaping.can_encode(key, value) {
            debug!("Dropping property {:?} of message {}, not encodable", key, message.message_id);
            continue;
        }
        frame = frame.with_default_header(key.as_str(), value.as_str());
    }

    let body = message.body.to_bytes();
    if always_content_length || matches!(message.body, MessageBody::Bytes(_)) {
        frame = frame.with_header("content-length", body.len().to_string());
    }
    Ok(frame.with_body(body))
}
