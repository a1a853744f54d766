//! Byte-stream transport abstraction and the tokio stream adapter

use crate::{ConnectionFailure, StompConnection, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of a connection, assigned by its transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Wrap an identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identifier
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Byte-stream transport a connection writes to
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connection identity
    fn id(&self) -> ConnectionId;

    /// Peer address, for diagnostics
    fn remote_address(&self) -> String;

    /// Write a fully encoded frame
    async fn write(&self, data: Bytes) -> Result<(), TransportError>;

    /// Close the transport, further writes fail
    async fn close(&self);
}

/// Transport over any tokio writer
pub struct StreamTransport<W> {
    id: ConnectionId,
    remote_address: String,
    writer: Mutex<Option<W>>,
}

impl<W> StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a writer, the id is a random UUID
    pub fn new(writer: W, remote_address: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::random(),
            remote_address: remote_address.into(),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Use a specific connection id
    pub fn with_id(mut self, id: ConnectionId) -> Self {
        self.id = id;
        self
    }
}

#[async_trait]
impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Unpin + Send,
{
    fn id(&self) -> ConnectionId {
        self.id.clone()
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(TransportError::Closed)?;
        writer.write_all(&data).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("Shutdown of transport {} failed: {}", self.id, e);
            }
        }
    }
}

/// Read loop feeding a connection from `reader`
///
/// Returns when the peer closes the stream, the read fails or the
/// connection is torn down from elsewhere.
pub async fn drive<R>(connection: StompConnection, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; connection.config().read_buffer_size.max(1)];
    debug!("Starting read loop for connection {}", connection.id());

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) => {
                        info!("Connection {} closed by peer", connection.id());
                        connection.destroy().await;
                        break;
                    }
                    Ok(n) => connection.buffer_received(&buf[..n]).await,
                    Err(e) => {
                        warn!("Read failed on connection {}: {}", connection.id(), e);
                        connection.fail(ConnectionFailure::Transport(e.into())).await;
                        break;
                    }
                }
            }

            _ = connection.closed() => {
                debug!("Connection {} torn down, stopping read loop", connection.id());
                break;
            }
        }

        if connection.is_destroyed() {
            break;
        }
    }
}
