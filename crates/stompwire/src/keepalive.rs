//! Inbound liveness monitor

use crate::{ConnectionFailure, StompConnection};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Background task failing a connection that stops sending data
///
/// Every `period` the task reads and resets the connection's data-received
/// flag. The task is aborted when the handle is dropped.
///
/// Only inbound traffic is watched. Outbound heart-beats are left to the
/// broker, see [`StompConnection::ping`].
pub struct KeepAlive {
    handle: Option<JoinHandle<()>>,
}

impl KeepAlive {
    /// Start monitoring `connection`
    ///
    /// A zero `period` means no heart-beating was agreed, and nothing is
    /// monitored.
    pub fn spawn(connection: StompConnection, period: Duration) -> Self {
        if period.is_zero() {
            debug!("Keep-alive disabled for connection {}", connection.id());
            return Self { handle: None };
        }
        let handle = tokio::spawn(Self::monitor_loop(connection, period));
        Self { handle: Some(handle) }
    }

    /// Stop monitoring
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether the monitor task has ended
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    async fn monitor_loop(connection: StompConnection, period: Duration) {
        let mut interval = tokio::time::interval(period);
        // First tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if connection.check_data_received() {
                        continue;
                    }
                    error!(
                        "No data received on connection {} within {:?}, failing it",
                        connection.id(),
                        period
                    );
                    connection.fail(ConnectionFailure::KeepAliveExpired).await;
                    break;
                }

                _ = connection.closed() => {
                    debug!("Keep-alive for connection {} stopped", connection.id());
                    break;
                }
            }
        }
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{recording_connection, RecordingManager};
    use crate::StompConfig;

    #[tokio::test]
    async fn test_zero_period_disables_monitoring() {
        let (connection, _manager, _transport) = recording_connection(RecordingManager::new(), StompConfig::default());

        let keep_alive = KeepAlive::spawn(connection.clone(), Duration::ZERO);
        assert!(keep_alive.is_finished());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!connection.is_destroyed());
    }
}
