use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::WebSocketConfig;
use crate::connection_manager::ConnectionManager;
use crate::metrics::HeartbeatMetrics;

/// Timeout for individual probe send operations
const PROBE_SEND_TIMEOUT_MS: u64 = 5000;

/// Maximum concurrent probe sends to avoid overwhelming the system
const MAX_CONCURRENT_PROBES: usize = 1000;

/// Background liveness sweep.
///
/// Every tick, connections that stayed silent since the previous tick are
/// terminated and all others are marked not-alive and sent a ping. Any
/// inbound frame, pongs included, marks a connection alive again.
pub struct HeartbeatTask {
    config: WebSocketConfig,
    connection_manager: Arc<ConnectionManager>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        connection_manager: Arc<ConnectionManager>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            connection_manager,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// One sweep: terminate the silent, probe the rest
    async fn sweep(&self) {
        let outcome = self.connection_manager.sweep();

        if !outcome.stale.is_empty() {
            for handle in &outcome.stale {
                tracing::info!(
                    connection_id = %handle.identity,
                    user_id = handle.user_id,
                    "Terminating connection that missed a heartbeat"
                );
                handle.terminate();
            }
            HeartbeatMetrics::record_terminated(outcome.stale.len() as u64);
        }

        if outcome.probed.is_empty() {
            return;
        }

        let start = Instant::now();
        let sent = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        for batch in outcome.probed.chunks(MAX_CONCURRENT_PROBES) {
            let futures: Vec<_> = batch
                .iter()
                .map(|handle| {
                    let sent = sent.clone();
                    let failed = failed.clone();
                    let handle = handle.clone();

                    async move {
                        let send_timeout = Duration::from_millis(PROBE_SEND_TIMEOUT_MS);
                        match timeout(send_timeout, handle.probe()).await {
                            Ok(Ok(_)) => {
                                sent.fetch_add(1, Ordering::Relaxed);
                            }
                            Ok(Err(_)) | Err(_) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                tracing::debug!(
                                    connection_id = %handle.identity,
                                    "Failed to queue liveness probe"
                                );
                            }
                        }
                    }
                })
                .collect();

            join_all(futures).await;
        }

        tracing::debug!(
            terminated = outcome.stale.len(),
            probed = sent.load(Ordering::Relaxed),
            failed = failed.load(Ordering::Relaxed),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Heartbeat sweep completed"
        );
    }
}
