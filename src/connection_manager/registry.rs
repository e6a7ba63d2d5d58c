use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::websocket::OutboundMessage;

use super::types::{ConnectionError, ConnectionHandle, ConnectionLimits, ConnectionOrigin};

/// Connections split by one liveness sweep
#[derive(Debug, Default)]
pub struct SweepOutcome {
    /// Silent since the previous sweep; to be terminated
    pub stale: Vec<Arc<ConnectionHandle>>,
    /// Marked not-alive and awaiting a probe
    pub probed: Vec<Arc<ConnectionHandle>>,
}

/// Owns every live WebSocket connection
pub struct ConnectionManager {
    /// identity -> ConnectionHandle
    connections: DashMap<String, Arc<ConnectionHandle>>,
    next_user_id: AtomicU64,
    limits: ConnectionLimits,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::default())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        Self {
            connections: DashMap::new(),
            next_user_id: AtomicU64::new(1),
            limits,
        }
    }

    /// Register a new connection.
    ///
    /// The identity is the client-supplied key when one is given, otherwise a
    /// fresh UUID. An identity already held by a live connection is refused.
    pub fn register(
        &self,
        identity_hint: Option<String>,
        origin: ConnectionOrigin,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<ConnectionHandle>, ConnectionError> {
        let current = self.connections.len();
        if current >= self.limits.max_connections {
            return Err(ConnectionError::LimitExceeded {
                current,
                max: self.limits.max_connections,
            });
        }

        let identity = identity_hint
            .filter(|key| !key.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        match self.connections.entry(identity.clone()) {
            Entry::Occupied(_) => Err(ConnectionError::InvalidUser { identity }),
            Entry::Vacant(slot) => {
                let user_id = self.next_user_id.fetch_add(1, Ordering::Relaxed);
                let handle = Arc::new(ConnectionHandle::new(identity, user_id, origin, sender));
                slot.insert(handle.clone());

                tracing::info!(
                    connection_id = %handle.identity,
                    user_id = handle.user_id,
                    ip = ?handle.origin.ip,
                    "Connection registered"
                );

                Ok(handle)
            }
        }
    }

    /// Unregister a connection.
    ///
    /// Only removes the entry if it still belongs to this handle.
    pub fn unregister(&self, handle: &ConnectionHandle) {
        let removed = self
            .connections
            .remove_if(&handle.identity, |_, current| current.user_id == handle.user_id);

        if removed.is_some() {
            tracing::info!(
                connection_id = %handle.identity,
                user_id = handle.user_id,
                users = self.connections.len(),
                "Connection unregistered"
            );
        }
    }

    /// Get connection by identity
    pub fn get_connection(&self, identity: &str) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(identity).map(|h| h.clone())
    }

    /// Get all connections
    pub fn get_all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// One liveness pass over every connection.
    ///
    /// A connection that has not been re-marked alive since the previous pass
    /// is reported stale; every other connection is marked not-alive and
    /// reported for probing. A half-open socket is therefore reaped within two
    /// passes.
    pub fn sweep(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for handle in self.get_all_connections() {
            if handle.take_alive() {
                outcome.probed.push(handle);
            } else {
                outcome.stale.push(handle);
            }
        }

        outcome
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
