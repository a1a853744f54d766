//! In-memory collaborators for testing connections

use crate::{
    BrokerError, ConnectionId, ServerMessage, StompConfig, StompConnection, StompManager, StompSession,
    SubscriptionRequest, Transport, TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use stompwire_proto::{Escaping, Frame, StompDecoder};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install a test-friendly tracing subscriber, honouring `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Broker call recorded by [`RecordingManager`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCall {
    /// `session` or `transacted_session`
    Session(Option<String>),
    /// `create_subscription`
    Subscribe(SubscriptionRequest),
    /// `unsubscribe`
    Unsubscribe(String),
    /// `acknowledge`
    Ack {
        /// Acknowledged message
        message_id: String,
        /// Subscription, if given
        subscription_id: Option<String>,
    },
    /// `negative_acknowledge`
    Nack {
        /// Rejected message
        message_id: String,
        /// Subscription
        subscription_id: String,
    },
    /// `begin_transaction`
    Begin(String),
    /// `commit_transaction`
    Commit(String),
    /// `abort_transaction`
    Abort(String),
    /// `cleanup`
    Cleanup,
}

/// Message published through a [`RecordingSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Transaction of the session, if any
    pub tx_id: Option<String>,
    /// Published message
    pub message: ServerMessage,
}

/// Session storing every published message
pub struct RecordingSession {
    tx_id: Option<String>,
    no_local: bool,
    sent: Arc<Mutex<Vec<SentMessage>>>,
}

impl RecordingSession {
    /// Create a session appending to `sent`
    pub fn new(tx_id: Option<String>, no_local: bool, sent: Arc<Mutex<Vec<SentMessage>>>) -> Self {
        Self { tx_id, no_local, sent }
    }
}

#[async_trait]
impl StompSession for RecordingSession {
    fn is_no_local(&self) -> bool {
        self.no_local
    }

    async fn send(&self, message: ServerMessage) -> Result<(), BrokerError> {
        lock(&self.sent).push(SentMessage {
            tx_id: self.tx_id.clone(),
            message,
        });
        Ok(())
    }
}

/// Manager recording every broker call
///
/// Authentication accepts any credentials until a user is registered with
/// [`RecordingManager::with_user`].
pub struct RecordingManager {
    virtual_host: String,
    users: HashMap<String, String>,
    no_local_sessions: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<ManagerCall>>,
    sent: Arc<Mutex<Vec<SentMessage>>>,
    fail_next: Mutex<Option<BrokerError>>,
    next_message_id: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for RecordingManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingManager {
    /// Manager for virtual host `localhost`
    pub fn new() -> Self {
        Self {
            virtual_host: "localhost".to_string(),
            users: HashMap::new(),
            no_local_sessions: false,
            delay: None,
            calls: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_next: Mutex::new(None),
            next_message_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Set the virtual host name
    pub fn with_virtual_host(mut self, host: impl Into<String>) -> Self {
        self.virtual_host = host.into();
        self
    }

    /// Register a valid login
    pub fn with_user(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.users.insert(login.into(), passcode.into());
        self
    }

    /// Hand out no-local sessions
    pub fn with_no_local_sessions(mut self, no_local: bool) -> Self {
        self.no_local_sessions = no_local;
        self
    }

    /// Delay every broker call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Make the next broker call fail with `error`
    pub fn fail_next(&self, error: BrokerError) {
        *lock(&self.fail_next) = Some(error);
    }

    /// Recorded calls, in order
    pub fn calls(&self) -> Vec<ManagerCall> {
        lock(&self.calls).clone()
    }

    /// Number of `cleanup` calls
    pub fn cleanup_count(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|call| **call == ManagerCall::Cleanup)
            .count()
    }

    /// Messages published through sessions of this manager
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    /// Largest number of broker calls seen running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn record(&self, call: ManagerCall) -> Result<(), BrokerError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.calls).push(call);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match lock(&self.fail_next).take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn session_for(&self, tx_id: Option<&str>) -> Arc<dyn StompSession> {
        Arc::new(RecordingSession::new(
            tx_id.map(str::to_string),
            self.no_local_sessions,
            self.sent.clone(),
        ))
    }
}

#[async_trait]
impl StompManager for RecordingManager {
    async fn cleanup(&self, _connection: &StompConnection) {
        lock(&self.calls).push(ManagerCall::Cleanup);
    }

    async fn validate_user(&self, login: Option<&str>, passcode: Option<&str>) -> bool {
        if self.users.is_empty() {
            return true;
        }
        match (login, passcode) {
            (Some(login), Some(passcode)) => self.users.get(login).is_some_and(|p| p == passcode),
            _ => false,
        }
    }

    fn virtual_host_name(&self) -> String {
        self.virtual_host.clone()
    }

    fn create_server_message(&self) -> ServerMessage {
        ServerMessage::new(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn session(&self, _connection: &StompConnection) -> Result<Arc<dyn StompSession>, BrokerError> {
        self.record(ManagerCall::Session(None)).await?;
        Ok(self.session_for(None))
    }

    async fn transacted_session(
        &self,
        _connection: &StompConnection,
        tx_id: &str,
    ) -> Result<Arc<dyn StompSession>, BrokerError> {
        self.record(ManagerCall::Session(Some(tx_id.to_string()))).await?;
        Ok(self.session_for(Some(tx_id)))
    }

    async fn create_subscription(
        &self,
        _connection: &StompConnection,
        request: SubscriptionRequest,
    ) -> Result<(), BrokerError> {
        self.record(ManagerCall::Subscribe(request)).await
    }

    async fn unsubscribe(&self, _connection: &StompConnection, subscription_id: &str) -> Result<(), BrokerError> {
        self.record(ManagerCall::Unsubscribe(subscription_id.to_string())).await
    }

    async fn acknowledge(
        &self,
        _connection: &StompConnection,
        message_id: &str,
        subscription_id: Option<&str>,
    ) -> Result<(), BrokerError> {
        self.record(ManagerCall::Ack {
            message_id: message_id.to_string(),
            subscription_id: subscription_id.map(str::to_string),
        })
        .await
    }

    async fn negative_acknowledge(
        &self,
        _connection: &StompConnection,
        message_id: &str,
        subscription_id: &str,
    ) -> Result<(), BrokerError> {
        self.record(ManagerCall::Nack {
            message_id: message_id.to_string(),
            subscription_id: subscription_id.to_string(),
        })
        .await
    }

    async fn begin_transaction(&self, _connection: &StompConnection, tx_id: &str) -> Result<(), BrokerError> {
        self.record(ManagerCall::Begin(tx_id.to_string())).await
    }

    async fn commit_transaction(&self, _connection: &StompConnection, tx_id: &str) -> Result<(), BrokerError> {
        self.record(ManagerCall::Commit(tx_id.to_string())).await
    }

    async fn abort_transaction(&self, _connection: &StompConnection, tx_id: &str) -> Result<(), BrokerError> {
        self.record(ManagerCall::Abort(tx_id.to_string())).await
    }
}

/// Transport keeping every written frame in memory
pub struct RecordingTransport {
    id: ConnectionId,
    written: Mutex<Vec<Bytes>>,
    closed: AtomicBool,
    close_count: AtomicUsize,
    fail_writes: AtomicBool,
}

impl RecordingTransport {
    /// Create a transport with the given id
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(id),
            written: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            close_count: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every following write fail with an I/O error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Raw writes, one entry per frame
    pub fn written(&self) -> Vec<Bytes> {
        lock(&self.written).clone()
    }

    /// Written frames decoded without header escaping
    pub fn frames(&self) -> Vec<Frame> {
        self.frames_with(Escaping::None)
    }

    /// Written frames decoded with `escaping`
    ///
    /// Writes that do not decode are skipped.
    pub fn frames_with(&self, escaping: Escaping) -> Vec<Frame> {
        let mut decoder = StompDecoder::new();
        decoder.set_escaping(escaping);
        for chunk in self.written() {
            decoder.extend(&chunk);
        }
        decoder.frames().filter_map(Result::ok).collect()
    }

    /// Number of `close` calls
    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Whether the transport was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn id(&self) -> ConnectionId {
        self.id.clone()
    }

    fn remote_address(&self) -> String {
        "memory".to_string()
    }

    async fn write(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write refused",
            )));
        }
        lock(&self.written).push(data);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connection wired to fresh recording collaborators
pub fn recording_connection(
    manager: RecordingManager,
    config: StompConfig,
) -> (StompConnection, Arc<RecordingManager>, Arc<RecordingTransport>) {
    let manager = Arc::new(manager);
    let transport = Arc::new(RecordingTransport::new("conn-1"));
    let connection = StompConnection::new(manager.clone(), transport.clone(), Arc::new(config));
    (connection, manager, transport)
}
