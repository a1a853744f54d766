//! Per-connection STOMP state machine

use crate::handler::{handler_for, FrameHandler};
use crate::listener::{isolate, CloseListener, FailureListener, FrameObserver, ListenerSet};
use crate::{
    AckMode, ConnectionFailure, ConnectionId, HeartBeat, ProtocolError, ServerMessage, StompConfig, StompManager,
    StompSession, StompSubscription, StompVersion, SubscribeHeaders, SubscriptionRequest, Transport,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::time::SystemTime;
use stompwire_proto::{Command, Escaping, Frame, StompDecoder};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Message property carrying the id of the publishing connection.
///
/// Sessions flagged no-local tag outgoing messages with it, and no-local
/// subscriptions filter on it.
pub const CONNECTION_ID_PROPERTY: &str = "__stompwire_cid";

#[derive(Debug, Default)]
struct Credentials {
    login: Option<String>,
    passcode: Option<String>,
    client_id: Option<String>,
}

struct Inner {
    id: ConnectionId,
    manager: Arc<dyn StompManager>,
    transport: Arc<dyn Transport>,
    config: Arc<StompConfig>,
    creation_time: SystemTime,
    credentials: Mutex<Credentials>,
    heart_beat: Mutex<HeartBeat>,
    valid: AtomicBool,
    destroyed: AtomicBool,
    data_received: AtomicBool,
    /// Set exactly once, by version negotiation
    handler: OnceLock<Arc<dyn FrameHandler>>,
    /// Held for a whole decode and dispatch pass
    decoder: tokio::sync::Mutex<StompDecoder>,
    write_lock: tokio::sync::Mutex<()>,
    failure_listeners: ListenerSet<dyn FailureListener>,
    close_listeners: ListenerSet<dyn CloseListener>,
    observer: RwLock<Option<Arc<dyn FrameObserver>>>,
    closed: watch::Sender<bool>,
}

/// Server side of one STOMP client connection
///
/// Cloning is cheap and every clone refers to the same connection.
#[derive(Clone)]
pub struct StompConnection {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StompConnection {
    /// Create a connection over `transport`, owned by `manager`
    pub fn new(manager: Arc<dyn StompManager>, transport: Arc<dyn Transport>, config: Arc<StompConfig>) -> Self {
        let id = transport.id();
        let decoder = StompDecoder::with_max_frame_size(config.max_frame_size);
        let (closed, _) = watch::channel(false);

        info!("STOMP connection {} opened from {}", id, transport.remote_address());

        Self {
            inner: Arc::new(Inner {
                id,
                manager,
                transport,
                config,
                creation_time: SystemTime::now(),
                credentials: Mutex::new(Credentials::default()),
                heart_beat: Mutex::new(HeartBeat::default()),
                valid: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                data_received: AtomicBool::new(false),
                handler: OnceLock::new(),
                decoder: tokio::sync::Mutex::new(decoder),
                write_lock: tokio::sync::Mutex::new(()),
                failure_listeners: ListenerSet::default(),
                close_listeners: ListenerSet::default(),
                observer: RwLock::new(None),
                closed,
            }),
        }
    }

    /// Entry point for bytes read from the transport
    pub async fn buffer_received(&self, buffer: &[u8]) {
        self.set_data_received();
        self.inner.manager.handle_buffer(self, buffer).await;
    }

    /// Decode `buffer` and dispatch every complete frame in order
    pub async fn decode_buffer(&self, buffer: &[u8]) -> Result<(), ConnectionFailure> {
        let mut decoder = self.inner.decoder.lock().await;
        if self.is_destroyed() {
            debug!("Dropping {} bytes received on destroyed connection {}", buffer.len(), self.inner.id);
            return Ok(());
        }

        decoder.extend(buffer);
        while let Some(frame) = decoder.next_frame()? {
            self.handle_frame(&frame).await;

            if let Some(handler) = self.inner.handler.get() {
                decoder.set_escaping(handler.escaping());
            }
            if self.is_destroyed() {
                decoder.clear_buffer();
                break;
            }
        }
        Ok(())
    }

    /// Dispatch one inbound frame and send its reply, if any
    pub async fn handle_frame(&self, frame: &Frame) {
        self.notify_observer(|observer| observer.request_accepted(frame));
        debug!("Connection {} received {}", self.inner.id, frame.command());

        let reply = match self.process_frame(frame).await {
            Ok(reply) => reply,
            Err(error) => {
                debug!("Connection {} rejected {}: {}", self.inner.id, frame.command(), error);
                let error = match frame.header("receipt") {
                    Some(receipt) => error.with_header("receipt-id", receipt),
                    None => error,
                };
                Some(error.to_frame())
            }
        };

        if let Some(reply) = reply {
            self.send_frame(&reply).await;
        }
    }

    async fn process_frame(&self, frame: &Frame) -> Result<Option<Frame>, ProtocolError> {
        let handler = match self.inner.handler.get() {
            Some(handler) => handler.clone(),
            None => {
                if !(frame.is(Command::Connect) || frame.is(Command::Stomp)) {
                    return Err(ProtocolError::new("Connection hasn't been established."));
                }
                self.negotiate_version(frame)?;
                self.frame_handler()?
            }
        };
        handler.handle_frame(self, frame).await
    }

    /// Pick the protocol version from a CONNECT frame and bind its handler
    ///
    /// The first successful negotiation wins, later calls return the version
    /// already bound.
    pub fn negotiate_version(&self, frame: &Frame) -> Result<StompVersion, ProtocolError> {
        let accept_version = frame.header("accept-version");
        let version = StompVersion::negotiate(accept_version).ok_or_else(|| {
            let requested = accept_version.unwrap_or_default();
            ProtocolError::new(format!("Stomp versions not supported: {}", requested))
                .with_header("version", requested)
                .with_header("content-type", "text/plain")
                .with_body(format!(
                    "Supported protocol versions are {}",
                    self.inner.manager.supported_versions_as_string()
                ))
        })?;

        let handler = self.inner.handler.get_or_init(|| handler_for(version));
        debug!("Connection {} negotiated STOMP {}", self.inner.id, handler.version());
        Ok(handler.version())
    }

    fn frame_handler(&self) -> Result<Arc<dyn FrameHandler>, ProtocolError> {
        self.inner
            .handler
            .get()
            .cloned()
            .ok_or_else(|| ProtocolError::new("Connection hasn't been established."))
    }

    /// Send a frame to the client through the manager
    pub async fn send_frame(&self, frame: &Frame) {
        debug!("Connection {} sending {}", self.inner.id, frame.command());
        self.inner.manager.send_reply(self, frame).await;
    }

    /// Send a heart-beat or other unsolicited frame
    ///
    /// The connection never schedules outbound heart-beats itself. When the
    /// negotiated [`HeartBeat::send_ms`] is non-zero the broker is expected
    /// to call this at that interval.
    pub async fn ping(&self, frame: &Frame) {
        self.inner.manager.send_reply(self, frame).await;
    }

    /// Encode `frame` and write it to the transport
    pub async fn physical_send(&self, frame: &Frame) -> Result<(), ConnectionFailure> {
        if self.is_destroyed() {
            return Err(ConnectionFailure::Closed);
        }

        let data = frame.encode(self.escaping());
        {
            let _guard = self.inner.write_lock.lock().await;
            if let Err(e) = self.inner.transport.write(data).await {
                warn!("Write of {} failed on connection {}: {}", frame.command(), self.inner.id, e);
                return Err(e.into());
            }
        }

        self.notify_observer(|observer| observer.reply_sent(frame));
        Ok(())
    }

    /// Render a broker message as a MESSAGE frame for `subscription`
    pub fn create_stomp_message(
        &self,
        message: &ServerMessage,
        subscription: &StompSubscription,
        delivery_count: u32,
    ) -> Result<Frame, ProtocolError> {
        self.frame_handler()?
            .create_message_frame(message, subscription, delivery_count)
    }

    /// Reject the CONNECT unless `host` names the broker's virtual host
    pub fn set_host(&self, host: Option<&str>) -> Result<(), ProtocolError> {
        let host = host.ok_or_else(|| {
            ProtocolError::new("Header host is null").with_body("Cannot accept null as host")
        })?;

        if host != self.inner.manager.virtual_host_name() {
            return Err(ProtocolError::new("Header host doesn't match server host")
                .with_body(format!("host {} doesn't match server host name", host)));
        }
        Ok(())
    }

    /// Authenticate through the manager, remembering the credentials on success
    pub async fn validate_user(&self, login: Option<&str>, passcode: Option<&str>) -> bool {
        let valid = self.inner.manager.validate_user(login, passcode).await;
        if valid {
            let mut credentials = lock(&self.inner.credentials);
            credentials.login = login.map(str::to_string);
            credentials.passcode = passcode.map(str::to_string);
        }
        self.inner.valid.store(valid, Ordering::Release);
        valid
    }

    /// Fail unless the client authenticated
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(ProtocolError::new("Connection is not valid."))
        }
    }

    /// Default session, or the session of transaction `tx_id`
    pub async fn session(&self, tx_id: Option<&str>) -> Result<Arc<dyn StompSession>, ProtocolError> {
        let session = match tx_id {
            None => self.inner.manager.session(self).await,
            Some(tx_id) => self.inner.manager.transacted_session(self, tx_id).await,
        };
        session.map_err(|e| e.into_protocol_error(|| "Exception getting session".to_string()))
    }

    /// Publish a message received from the client
    pub async fn send_server_message(
        &self,
        mut message: ServerMessage,
        tx_id: Option<&str>,
    ) -> Result<(), ProtocolError> {
        let session = self.session(tx_id).await?;
        if session.is_no_local() {
            message
                .properties
                .insert(CONNECTION_ID_PROPERTY.to_string(), self.inner.id.to_string());
        }

        let message_id = message.message_id;
        session
            .send(message)
            .await
            .map_err(|e| e.into_protocol_error(|| format!("Error sending message {}", message_id)))
    }

    /// Create a subscription, returning its id
    pub async fn subscribe(&self, headers: SubscribeHeaders) -> Result<String, ProtocolError> {
        let mut selector = headers.selector;
        if headers.no_local {
            let clause = format!("{} <> '{}'", CONNECTION_ID_PROPERTY, self.inner.id);
            selector = Some(match selector {
                Some(selector) => format!("{} AND {}", selector, clause),
                None => clause,
            });
        }

        let ack_mode: AckMode = match headers.ack.as_deref() {
            Some(ack) => ack.parse()?,
            None => AckMode::default(),
        };

        let subscription_id = match headers.id {
            Some(id) => id,
            None => {
                let destination = headers.destination.as_deref().ok_or_else(|| {
                    ProtocolError::new("Client must set destination or id header to a SUBSCRIBE command")
                })?;
                format!("subscription/{}", destination)
            }
        };

        let request = SubscriptionRequest {
            subscription_id: subscription_id.clone(),
            destination: headers.destination,
            selector,
            ack_mode,
            durable_subscription_name: headers.durable_subscription_name,
            no_local: headers.no_local,
        };
        self.inner
            .manager
            .create_subscription(self, request)
            .await
            .map_err(|e| e.into_protocol_error(|| format!("Error creating subscription {}", subscription_id)))?;

        Ok(subscription_id)
    }

    /// Remove a subscription
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ProtocolError> {
        self.inner
            .manager
            .unsubscribe(self, subscription_id)
            .await
            .map_err(|e| e.into_protocol_error(|| format!("Error unsubscribing {}", subscription_id)))
    }

    /// Acknowledge a message
    pub async fn acknowledge(&self, message_id: &str, subscription_id: Option<&str>) -> Result<(), ProtocolError> {
        self.inner
            .manager
            .acknowledge(self, message_id, subscription_id)
            .await
            .map_err(|e| e.into_protocol_error(|| format!("Error acknowledging message {}", message_id)))
    }

    /// Reject a message
    pub async fn negative_acknowledge(&self, message_id: &str, subscription_id: &str) -> Result<(), ProtocolError> {
        self.inner
            .manager
            .negative_acknowledge(self, message_id, subscription_id)
            .await
            .map_err(|e| e.into_protocol_error(|| format!("Error rejecting message {}", message_id)))
    }

    /// Begin a transaction
    pub async fn begin_transaction(&self, tx_id: &str) -> Result<(), ProtocolError> {
        self.inner
            .manager
            .begin_transaction(self, tx_id)
            .await
            .map_err(|e| e.into_protocol_error(|| format!("Error beginning a transaction: {}", tx_id)))
    }

    /// Commit a transaction
    pub async fn commit_transaction(&self, tx_id: &str) -> Result<(), ProtocolError> {
        self.inner
            .manager
            .commit_transaction(self, tx_id)
            .await
            .map_err(|e| e.into_protocol_error(|| format!("Error committing {}", tx_id)))
    }

    /// Roll back a transaction
    pub async fn abort_transaction(&self, tx_id: &str) -> Result<(), ProtocolError> {
        self.inner
            .manager
            .abort_transaction(self, tx_id)
            .await
            .map_err(|e| e.into_protocol_error(|| format!("Error aborting {}", tx_id)))
    }

    fn mark_destroyed(&self) -> bool {
        let first = self
            .inner
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.closed.send_replace(true);
        }
        first
    }

    async fn release_resources(&self) {
        self.inner.transport.close().await;
        self.inner.manager.cleanup(self).await;
        info!("STOMP connection {} destroyed", self.inner.id);
    }

    fn notify_close_listeners(&self) {
        let listeners = self.inner.close_listeners.snapshot();
        debug!("Notifying {} close listeners of connection {}", listeners.len(), self.inner.id);
        for listener in listeners {
            isolate("Close listener", &self.inner.id, || listener.connection_closed(self));
        }
    }

    /// Tear the connection down after an unrecoverable error
    ///
    /// Only the first call of `fail`, `destroy` or `disconnect` has any effect.
    pub async fn fail(&self, failure: ConnectionFailure) {
        if !self.mark_destroyed() {
            return;
        }
        warn!("Connection {} failed: {}", self.inner.id, failure);

        let listeners = self.inner.failure_listeners.snapshot();
        debug!("Notifying {} failure listeners of connection {}", listeners.len(), self.inner.id);
        for listener in listeners {
            isolate("Failure listener", &self.inner.id, || listener.connection_failed(self, &failure));
        }
        self.notify_close_listeners();

        self.release_resources().await;
    }

    /// Tear the connection down normally
    pub async fn destroy(&self) {
        if !self.mark_destroyed() {
            return;
        }
        self.release_resources().await;
        self.notify_close_listeners();
    }

    /// Same as [`StompConnection::destroy`]
    pub async fn disconnect(&self) {
        self.destroy().await;
    }

    /// Resolves once the connection is destroyed
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        // The sender lives as long as `self`, so this only ends on `true`
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Register a failure listener
    pub fn add_failure_listener(&self, listener: Arc<dyn FailureListener>) {
        self.inner.failure_listeners.add(listener);
    }

    /// Unregister a failure listener
    pub fn remove_failure_listener(&self, listener: &Arc<dyn FailureListener>) -> bool {
        self.inner.failure_listeners.remove(listener)
    }

    /// Remove and return every failure listener
    pub fn take_failure_listeners(&self) -> Vec<Arc<dyn FailureListener>> {
        self.inner.failure_listeners.take()
    }

    /// Replace every failure listener
    pub fn set_failure_listeners(&self, listeners: Vec<Arc<dyn FailureListener>>) {
        self.inner.failure_listeners.set(listeners);
    }

    /// Register a close listener
    pub fn add_close_listener(&self, listener: Arc<dyn CloseListener>) {
        self.inner.close_listeners.add(listener);
    }

    /// Unregister a close listener
    pub fn remove_close_listener(&self, listener: &Arc<dyn CloseListener>) -> bool {
        self.inner.close_listeners.remove(listener)
    }

    /// Remove and return every close listener
    pub fn take_close_listeners(&self) -> Vec<Arc<dyn CloseListener>> {
        self.inner.close_listeners.take()
    }

    /// Replace every close listener
    pub fn set_close_listeners(&self, listeners: Vec<Arc<dyn CloseListener>>) {
        self.inner.close_listeners.set(listeners);
    }

    /// Install or remove the frame observer
    pub fn set_frame_observer(&self, observer: Option<Arc<dyn FrameObserver>>) {
        *self.inner.observer.write().unwrap_or_else(PoisonError::into_inner) = observer;
    }

    fn notify_observer<F>(&self, notify: F)
    where
        F: FnOnce(&dyn FrameObserver),
    {
        let observer = self
            .inner
            .observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            isolate("Frame observer", &self.inner.id, || notify(observer.as_ref()));
        }
    }

    /// Record that data arrived
    pub fn set_data_received(&self) {
        self.inner.data_received.store(true, Ordering::Release);
    }

    /// Whether data arrived since the previous check, resetting the flag
    pub fn check_data_received(&self) -> bool {
        self.inner.data_received.swap(false, Ordering::AcqRel)
    }

    /// Connection id, assigned by the transport
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Peer address
    pub fn remote_address(&self) -> String {
        self.inner.transport.remote_address()
    }

    /// When the connection was created
    pub fn creation_time(&self) -> SystemTime {
        self.inner.creation_time
    }

    /// Negotiated version, `None` before CONNECT
    pub fn version(&self) -> Option<StompVersion> {
        self.inner.handler.get().map(|handler| handler.version())
    }

    /// Header escaping of the negotiated version
    pub fn escaping(&self) -> Escaping {
        self.inner
            .handler
            .get()
            .map_or(Escaping::None, |handler| handler.escaping())
    }

    /// Whether a version was negotiated
    pub fn is_initialized(&self) -> bool {
        self.inner.handler.get().is_some()
    }

    /// Whether the client authenticated
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire)
    }

    /// Whether the connection was torn down
    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    /// Login used to authenticate
    pub fn login(&self) -> Option<String> {
        lock(&self.inner.credentials).login.clone()
    }

    /// Passcode used to authenticate
    pub fn passcode(&self) -> Option<String> {
        lock(&self.inner.credentials).passcode.clone()
    }

    /// Client id sent with CONNECT
    pub fn client_id(&self) -> Option<String> {
        lock(&self.inner.credentials).client_id.clone()
    }

    /// Set the client id
    pub fn set_client_id(&self, client_id: impl Into<String>) {
        lock(&self.inner.credentials).client_id = Some(client_id.into());
    }

    /// Server name advertised to 1.1 clients
    pub fn server_name(&self) -> &str {
        &self.inner.config.server_name
    }

    /// Negotiated heart-beat, from the server's point of view
    pub fn heart_beat(&self) -> HeartBeat {
        *lock(&self.inner.heart_beat)
    }

    pub(crate) fn set_heart_beat(&self, heart_beat: HeartBeat) {
        *lock(&self.inner.heart_beat) = heart_beat;
    }

    /// Connection configuration
    pub fn config(&self) -> &StompConfig {
        &self.inner.config
    }

    /// Owning manager
    pub fn manager(&self) -> &Arc<dyn StompManager> {
        &self.inner.manager
    }
}

impl fmt::Debug for StompConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StompConnection")
            .field("id", &self.inner.id)
            .field("version", &self.version())
            .field("valid", &self.is_valid())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}
