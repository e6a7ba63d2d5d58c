//! Named channels and the generic periodic-broadcast engine.
//!
//! - `Channel`: what the registry can ask of any channel
//! - `BroadcastChannel`: subscriber tracking, change detection and
//!   deliver-once-per-value fan-out, driven by a `ChannelSource`
//! - `ChannelRegistry`: static name -> channel table and command routing

mod engine;
mod equality;
mod registry;
mod source;

pub use engine::BroadcastChannel;
pub use equality::values_equal;
pub use registry::ChannelRegistry;
pub use source::ChannelSource;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::connection_manager::ConnectionHandle;

/// Command carried by an inbound envelope
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    Subscribe,
    Unsubscribe,
    Current,
    Action(ActionCommand),
}

/// `{ "uuid": ..., "action": ..., ...params }`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ActionCommand {
    pub uuid: String,
    pub action: String,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid parameters for {action}: {reason}")]
    InvalidParams { action: String, reason: String },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Snapshot of one channel for the stats endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    pub name: String,
    pub subscriber_count: usize,
    pub running: bool,
}

/// Operations the registry routes to a channel
#[async_trait]
pub trait Channel: Send + Sync {
    /// Unique name used as the envelope key
    fn name(&self) -> &str;

    async fn subscribe(&self, conn: &Arc<ConnectionHandle>) -> Result<(), ChannelError>;

    async fn unsubscribe(&self, conn: &Arc<ConnectionHandle>) -> Result<(), ChannelError>;

    async fn current(&self, conn: &Arc<ConnectionHandle>) -> Result<(), ChannelError>;

    /// Custom actions; unknown actions are ignored
    async fn action(
        &self,
        conn: &Arc<ConnectionHandle>,
        command: ActionCommand,
    ) -> Result<(), ChannelError> {
        tracing::debug!(
            channel = %self.name(),
            connection_id = %conn.identity,
            action = %command.action,
            "Ignoring unknown action"
        );
        Ok(())
    }

    async fn info(&self) -> ChannelInfo;

    /// Stop timers and release per-connection state
    async fn shutdown(&self);
}
