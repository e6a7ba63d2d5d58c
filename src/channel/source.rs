use async_trait::async_trait;
use serde_json::Value;

use crate::connection_manager::ConnectionHandle;

use super::ChannelError;

/// Data and lifecycle hooks a concrete channel plugs into `BroadcastChannel`
#[async_trait]
pub trait ChannelSource: Send + Sync + 'static {
    /// Produce the latest value. `None` means there is nothing to send.
    async fn get_data(&self) -> Result<Option<Value>, ChannelError>;

    /// Snapshot for a subscriber joining a running channel.
    ///
    /// Receives the last broadcast value; `None` sends nothing.
    async fn get_cached_data(&self, last: Option<&Value>) -> Option<Value> {
        last.cloned()
    }

    /// Returning false keeps the channel stopped
    async fn start_hook(&self) -> bool {
        true
    }

    async fn stop_hook(&self) {}

    fn pre_subscribe_hook(&self, conn: &ConnectionHandle) -> bool {
        conn.has_identity()
    }

    fn pre_unsubscribe_hook(&self, _conn: &ConnectionHandle) {}

    fn pre_current_hook(&self, conn: &ConnectionHandle) -> bool {
        conn.has_identity()
    }
}
