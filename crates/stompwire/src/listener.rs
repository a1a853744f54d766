//! Failure and close listeners, frame observer

use crate::{ConnectionFailure, ConnectionId, StompConnection};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use stompwire_proto::Frame;
use tracing::error;

/// Notified when a connection fails
pub trait FailureListener: Send + Sync {
    /// Called once, before the close listeners
    fn connection_failed(&self, connection: &StompConnection, failure: &ConnectionFailure);
}

impl<F> FailureListener for F
where
    F: Fn(&StompConnection, &ConnectionFailure) + Send + Sync,
{
    fn connection_failed(&self, connection: &StompConnection, failure: &ConnectionFailure) {
        self(connection, failure)
    }
}

/// Notified when a connection is torn down, whatever the reason
pub trait CloseListener: Send + Sync {
    /// Called once per connection
    fn connection_closed(&self, connection: &StompConnection);
}

impl<F> CloseListener for F
where
    F: Fn(&StompConnection) + Send + Sync,
{
    fn connection_closed(&self, connection: &StompConnection) {
        self(connection)
    }
}

/// Observes every inbound frame and every frame written to the transport
pub trait FrameObserver: Send + Sync {
    /// Inbound frame, before dispatch
    fn request_accepted(&self, frame: &Frame);

    /// Outbound frame, after it was written
    fn reply_sent(&self, frame: &Frame);
}

/// Ordered listener list, notified from a snapshot
pub(crate) struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<Arc<L>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<L>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn add(&self, listener: Arc<L>) {
        self.lock().push(listener);
    }

    /// Remove the first entry that is the same allocation as `listener`
    pub(crate) fn remove(&self, listener: &Arc<L>) -> bool {
        let mut listeners = self.lock();
        match listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn take(&self) -> Vec<Arc<L>> {
        std::mem::take(&mut *self.lock())
    }

    pub(crate) fn set(&self, listeners: Vec<Arc<L>>) {
        *self.lock() = listeners;
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<L>> {
        self.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Run a callback, logging instead of propagating a panic
pub(crate) fn isolate<F: FnOnce()>(what: &str, connection_id: &ConnectionId, callback: F) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("{} panicked on connection {}", what, connection_id);
    }
}
