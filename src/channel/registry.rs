use std::collections::HashMap;
use std::sync::Arc;

use crate::connection_manager::ConnectionHandle;

use super::{Channel, ChannelCommand, ChannelError, ChannelInfo};

/// Name -> channel table, fixed at construction
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new(channels: impl IntoIterator<Item = Arc<dyn Channel>>) -> Self {
        let channels = channels
            .into_iter()
            .map(|channel| (channel.name().to_string(), channel))
            .collect::<HashMap<_, _>>();

        tracing::info!(
            channels = ?channels.keys().collect::<Vec<_>>(),
            "Channels registered"
        );

        Self { channels }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.keys().cloned().collect()
    }

    /// Route one command to its channel. Unknown channels are ignored.
    pub async fn dispatch(
        &self,
        channel_name: &str,
        command: ChannelCommand,
        conn: &Arc<ConnectionHandle>,
    ) -> Result<(), ChannelError> {
        let Some(channel) = self.channels.get(channel_name) else {
            tracing::debug!(
                channel = %channel_name,
                connection_id = %conn.identity,
                "Ignoring command for unknown channel"
            );
            return Ok(());
        };

        match command {
            ChannelCommand::Subscribe => channel.subscribe(conn).await,
            ChannelCommand::Unsubscribe => channel.unsubscribe(conn).await,
            ChannelCommand::Current => channel.current(conn).await,
            ChannelCommand::Action(action) => channel.action(conn, action).await,
        }
    }

    /// Unsubscribe a connection everywhere.
    ///
    /// A failing channel is logged and skipped so the others still clean up.
    pub async fn unsubscribe_all(&self, conn: &Arc<ConnectionHandle>) {
        for channel in self.channels.values() {
            if let Err(e) = channel.unsubscribe(conn).await {
                tracing::warn!(
                    channel = %channel.name(),
                    connection_id = %conn.identity,
                    error = %e,
                    "Unsubscribe failed during cleanup"
                );
            }
        }
    }

    pub async fn stats(&self) -> Vec<ChannelInfo> {
        let mut infos = Vec::with_capacity(self.channels.len());
        for channel in self.channels.values() {
            infos.push(channel.info().await);
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub async fn shutdown(&self) {
        for channel in self.channels.values() {
            channel.shutdown().await;
        }
    }
}
