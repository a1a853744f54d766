//! Minimal STOMP client over a tokio duplex stream

use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use stompwire::proto::{Command, Escaping, Frame, StompDecoder};
use stompwire::test_utils::{init_tracing, RecordingManager};
use stompwire::{drive, ConnectionId, StompConfig, StompConnection, StreamTransport};
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// How long a test waits for a frame before giving up
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client end of a connection under test
pub struct TestClient {
    /// Server side connection
    pub connection: StompConnection,
    /// Broker stand-in
    pub manager: Arc<RecordingManager>,
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    decoder: StompDecoder,
    escaping: Escaping,
    driver: Option<JoinHandle<()>>,
}

impl TestClient {
    /// Open a connection with default configuration
    pub fn start(manager: RecordingManager) -> Self {
        Self::start_with(manager, StompConfig::default())
    }

    /// Open a connection
    pub fn start_with(manager: RecordingManager, config: StompConfig) -> Self {
        init_tracing();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let transport = StreamTransport::new(server_write, "duplex:0").with_id(ConnectionId::new("it-1"));

        let manager = Arc::new(manager);
        let connection = StompConnection::new(manager.clone(), Arc::new(transport), Arc::new(config));
        let driver = tokio::spawn(drive(connection.clone(), server_read));

        let (reader, writer) = tokio::io::split(client);
        Self {
            connection,
            manager,
            reader,
            writer,
            decoder: StompDecoder::new(),
            escaping: Escaping::None,
            driver: Some(driver),
        }
    }

    /// CONNECT and wait for the reply
    pub async fn connect(&mut self, accept_version: &str) -> Result<Frame> {
        let connect = Frame::command_frame(Command::Connect)
            .with_header("accept-version", accept_version)
            .with_header("host", "localhost")
            .with_header("login", "guest")
            .with_header("passcode", "guest");
        self.send(&connect).await?;

        let reply = self.receive().await?;
        if reply.header("version") == Some("1.1") {
            self.escaping = Escaping::Stomp11;
            self.decoder.set_escaping(Escaping::Stomp11);
        }
        Ok(reply)
    }

    /// Write one frame
    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        let data = frame.encode(self.escaping);
        self.send_raw(&data).await
    }

    /// Write raw bytes
    pub async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Wait for the next frame from the server
    pub async fn receive(&mut self) -> Result<Frame> {
        let frame = timeout(RECEIVE_TIMEOUT, self.decoder.read_frame(&mut self.reader)).await??;
        frame.ok_or_else(|| anyhow!("server closed the stream"))
    }

    /// Whether the server closed its side of the stream
    pub async fn at_eof(&mut self) -> Result<bool> {
        let next = timeout(RECEIVE_TIMEOUT, self.decoder.read_frame(&mut self.reader)).await??;
        Ok(next.is_none())
    }

    /// Close the client side and wait for the read loop to end
    pub async fn hang_up(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        self.join().await
    }

    /// Wait for the server read loop to end
    pub async fn join(&mut self) -> Result<()> {
        if let Some(driver) = self.driver.take() {
            timeout(RECEIVE_TIMEOUT, driver).await??;
        }
        Ok(())
    }
}

/// Frame with the given headers
pub fn frame(command: Command, headers: &[(&str, &str)]) -> Frame {
    headers
        .iter()
        .fold(Frame::command_frame(command), |frame, (k, v)| frame.with_header(*k, *v))
}
