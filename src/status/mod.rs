//! Built-in `status` channel publishing live service counters

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::channel::{BroadcastChannel, ChannelError, ChannelSource};
use crate::config::StatusChannelConfig;
use crate::connection_manager::ConnectionManager;
use crate::rfq::RfqChannel;

pub const STATUS_CHANNEL: &str = "status";

pub struct StatusSource {
    connections: Arc<ConnectionManager>,
    rfq: Arc<RfqChannel>,
}

impl StatusSource {
    pub fn new(connections: Arc<ConnectionManager>, rfq: Arc<RfqChannel>) -> Self {
        Self { connections, rfq }
    }
}

#[async_trait]
impl ChannelSource for StatusSource {
    async fn get_data(&self) -> Result<Option<Value>, ChannelError> {
        Ok(Some(json!({
            "connections": self.connections.connection_count(),
            "sessions": self.rfq.session_count(),
        })))
    }
}

pub type StatusChannel = BroadcastChannel<StatusSource>;

pub fn status_channel(
    config: &StatusChannelConfig,
    connections: Arc<ConnectionManager>,
    rfq: Arc<RfqChannel>,
) -> StatusChannel {
    let source = StatusSource::new(connections.clone(), rfq);
    BroadcastChannel::new(STATUS_CHANNEL, config.interval_ms, source, connections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::connection_manager::ConnectionOrigin;
    use crate::rfq::{PriceError, PriceProvider, SessionConfig};
    use rust_decimal::Decimal;
    use tokio::sync::mpsc;

    struct NoPrice;

    #[async_trait]
    impl PriceProvider for NoPrice {
        async fn get_price(&self, _from: &str, _to: &str) -> Result<Decimal, PriceError> {
            Err(PriceError::Upstream("offline".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_counts() {
        let manager = Arc::new(ConnectionManager::new());
        let rfq = Arc::new(RfqChannel::new(manager.clone(), Arc::new(NoPrice), SessionConfig::default()));
        let channel = status_channel(&StatusChannelConfig::default(), manager.clone(), rfq);

        let (tx, mut rx) = mpsc::channel(8);
        let conn = manager.register(None, ConnectionOrigin::default(), tx).unwrap();
        channel.subscribe(&conn).await.unwrap();

        let msg = rx.try_recv().unwrap().to_json().unwrap().unwrap();
        let value: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value, json!({"channel": "status", "connections": 1, "sessions": 0}));

        // Unchanged counters are not resent
        channel.broadcast().await;
        assert!(rx.try_recv().is_err());
    }
}
