//! Graceful shutdown handling for the RFQ broadcast service.
//!
//! 1. Signals background tasks (heartbeat) to stop
//! 2. Stops every channel timer and quote session
//! 3. Closes every connection with the going-away code
//! 4. Waits (bounded) for the sockets to drain

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::channel::ChannelRegistry;
use crate::connection_manager::ConnectionManager;
use crate::websocket::CLOSE_GOING_AWAY;

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for close frames to be queued (default: 5 seconds)
    pub client_notification_timeout: Duration,
    /// Time to wait for connections to go away (default: 10 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            client_notification_timeout: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

pub struct GracefulShutdown {
    connection_manager: Arc<ConnectionManager>,
    channels: Arc<ChannelRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(
        connection_manager: Arc<ConnectionManager>,
        channels: Arc<ChannelRegistry>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self::with_config(connection_manager, channels, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        connection_manager: Arc<ConnectionManager>,
        channels: Arc<ChannelRegistry>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            connection_manager,
            channels,
            shutdown_tx,
            config,
        }
    }

    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.connection_manager.connection_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping background tasks");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 2: Stopping channels and quote sessions");
        self.channels.shutdown().await;

        tracing::info!("Phase 3: Closing connections");
        result.clients_notified = self.close_connections().await;

        tracing::info!("Phase 4: Waiting for connections to close");
        result.connections_closed = self.wait_for_connections_to_close().await;

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    /// Queue a going-away close frame on every connection
    async fn close_connections(&self) -> usize {
        let connections = self.connection_manager.get_all_connections();
        let total = connections.len();
        if total == 0 {
            return 0;
        }

        let mut futures = FuturesUnordered::new();
        for conn in connections {
            futures.push(async move {
                match timeout(Duration::from_secs(2), conn.close(CLOSE_GOING_AWAY, "Server shutting down")).await {
                    Ok(Ok(())) => true,
                    _ => {
                        tracing::debug!(connection_id = %conn.identity, "Failed to queue close frame");
                        conn.terminate();
                        false
                    }
                }
            });
        }

        let mut notified = 0;
        let notify_future = async {
            while let Some(success) = futures.next().await {
                if success {
                    notified += 1;
                }
            }
        };
        let _ = timeout(self.config.client_notification_timeout, notify_future).await;

        tracing::info!(notified = notified, total = total, "Close frames queued");
        notified
    }

    async fn wait_for_connections_to_close(&self) -> usize {
        let initial = self.connection_manager.connection_count();
        if initial == 0 {
            return 0;
        }

        let wait_future = async {
            while self.connection_manager.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        let _ = timeout(self.config.drain_timeout, wait_future).await;

        let final_count = self.connection_manager.connection_count();
        if final_count > 0 {
            tracing::warn!(
                remaining_connections = final_count,
                "Some connections did not close gracefully"
            );
        }

        initial.saturating_sub(final_count)
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    pub success: bool,
    /// Connections that accepted a close frame
    pub clients_notified: usize,
    /// Connections that went away before the drain timeout
    pub connections_closed: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionOrigin;
    use crate::websocket::OutboundMessage;
    use tokio::sync::mpsc;

    fn components() -> (Arc<ConnectionManager>, Arc<ChannelRegistry>, broadcast::Sender<()>) {
        let cm = Arc::new(ConnectionManager::new());
        let channels = Arc::new(ChannelRegistry::new(Vec::new()));
        let (tx, _) = broadcast::channel(1);
        (cm, channels, tx)
    }

    #[tokio::test]
    async fn test_shutdown_no_connections() {
        let (cm, channels, tx) = components();
        let shutdown = GracefulShutdown::new(cm, channels, tx);

        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 0);
        assert_eq!(result.connections_closed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_sends_going_away() {
        let (cm, channels, tx) = components();
        let mut background = tx.subscribe();
        let (conn_tx, mut conn_rx) = mpsc::channel(4);
        let handle = cm.register(None, ConnectionOrigin::default(), conn_tx).unwrap();

        // Stand-in for the socket task: unregister once the close frame arrives
        let cm_clone = cm.clone();
        tokio::spawn(async move {
            if let Some(OutboundMessage::Close { code, .. }) = conn_rx.recv().await {
                assert_eq!(code, CLOSE_GOING_AWAY);
                cm_clone.unregister(&handle);
            }
        });

        let config = ShutdownConfig {
            client_notification_timeout: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
        };
        let result = GracefulShutdown::with_config(cm.clone(), channels, tx, config)
            .execute("test")
            .await;

        assert!(background.try_recv().is_ok());
        assert_eq!(result.clients_notified, 1);
        assert_eq!(result.connections_closed, 1);
        assert_eq!(cm.connection_count(), 0);
    }
}
