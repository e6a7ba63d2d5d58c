//! Connection handle and related types

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use crate::websocket::{OutboundMessage, ServerMessage, CLOSE_INVALID_USER, CLOSE_NO_RETRY};

/// Where a connection came from, captured once at accept time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionOrigin {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl ConnectionOrigin {
    /// Prefer the first `X-Forwarded-For` hop, fall back to the peer address
    pub fn from_request(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        Self {
            ip: forwarded.or_else(|| peer.map(|addr| addr.ip().to_string())),
            user_agent,
        }
    }
}

/// Handle for a single WebSocket connection
pub struct ConnectionHandle {
    /// Opaque identity handed to the client in the handshake
    pub identity: String,
    pub user_id: u64,
    pub origin: ConnectionOrigin,
    pub connected_at: DateTime<Utc>,
    sender: mpsc::Sender<OutboundMessage>,
    alive: AtomicBool,
    terminate: Notify,
}

impl ConnectionHandle {
    pub fn new(
        identity: String,
        user_id: u64,
        origin: ConnectionOrigin,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        Self {
            identity,
            user_id,
            origin,
            connected_at: Utc::now(),
            sender,
            alive: AtomicBool::new(true),
            terminate: Notify::new(),
        }
    }

    /// A connection without an identity or user id may not subscribe
    pub fn has_identity(&self) -> bool {
        !self.identity.is_empty() && self.user_id != 0
    }

    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Release);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Clear the liveness flag, returning whether it was set since the last call
    pub fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Send a ServerMessage (will be serialized when sent to WebSocket)
    pub async fn send(
        &self,
        message: ServerMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(OutboundMessage::Raw(message)).await
    }

    /// Send a frame that was serialized once for many recipients
    pub async fn send_preserialized(
        &self,
        frame: Arc<str>,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(OutboundMessage::Preserialized(frame)).await
    }

    /// Queue a liveness probe (WebSocket ping)
    pub async fn probe(&self) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(OutboundMessage::Ping).await
    }

    /// Queue a close frame; the socket task ends once it is written
    pub async fn close(
        &self,
        code: u16,
        reason: &'static str,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(OutboundMessage::Close { code, reason }).await
    }

    /// Drop the socket without a close handshake
    pub fn terminate(&self) {
        self.terminate.notify_one();
    }

    /// Resolves once `terminate` has been called
    pub async fn terminated(&self) {
        self.terminate.notified().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("identity", &self.identity)
            .field("user_id", &self.user_id)
            .field("origin", &self.origin)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

/// Reasons a connection is refused at accept time
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection limit exceeded ({current}/{max})")]
    LimitExceeded { current: usize, max: usize },

    #[error("Invalid user: identity {identity} is already connected")]
    InvalidUser { identity: String },
}

impl ConnectionError {
    /// WebSocket close code sent to the rejected client
    pub fn close_code(&self) -> u16 {
        match self {
            Self::LimitExceeded { .. } => CLOSE_NO_RETRY,
            Self::InvalidUser { .. } => CLOSE_INVALID_USER,
        }
    }
}

/// Limits for connection management
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_connections: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections: 10000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        headers.insert("user-agent", "Mozilla/5.0".parse().unwrap());
        let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();

        let origin = ConnectionOrigin::from_request(&headers, Some(peer));
        assert_eq!(origin.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(origin.user_agent.as_deref(), Some("Mozilla/5.0"));
    }

    #[test]
    fn test_origin_falls_back_to_peer() {
        let peer: SocketAddr = "192.168.1.20:40000".parse().unwrap();
        let origin = ConnectionOrigin::from_request(&HeaderMap::new(), Some(peer));
        assert_eq!(origin.ip.as_deref(), Some("192.168.1.20"));
        assert!(origin.user_agent.is_none());
    }

    #[test]
    fn test_take_alive_clears_flag() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("abc".into(), 1, ConnectionOrigin::default(), tx);
        assert!(handle.take_alive());
        assert!(!handle.take_alive());
        handle.mark_alive();
        assert!(handle.is_alive());
    }

    #[test]
    fn test_close_codes() {
        let limit = ConnectionError::LimitExceeded { current: 1, max: 1 };
        let invalid = ConnectionError::InvalidUser { identity: "x".into() };
        assert_eq!(limit.close_code(), 4422);
        assert_eq!(invalid.close_code(), 1008);
    }
}
