use std::sync::Arc;
use std::time::Instant;

use crate::channel::{Channel, ChannelRegistry};
use crate::config::Settings;
use crate::connection_manager::{ConnectionLimits, ConnectionManager};
use crate::error::Result;
use crate::rfq::{CryptoCompareClient, PriceProvider, RfqChannel, SessionConfig};
use crate::status::status_channel;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub connection_manager: Arc<ConnectionManager>,
    pub channels: Arc<ChannelRegistry>,
    pub rfq: Arc<RfqChannel>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the state with the CryptoCompare price client
    pub fn new(settings: Settings) -> Result<Self> {
        let client = CryptoCompareClient::new(&settings.price_provider)?;
        Ok(Self::with_price_provider(settings, Arc::new(client)))
    }

    pub fn with_price_provider(settings: Settings, provider: Arc<dyn PriceProvider>) -> Self {
        let connection_manager = Arc::new(ConnectionManager::with_limits(ConnectionLimits {
            max_connections: settings.websocket.max_connections,
        }));

        let rfq = Arc::new(RfqChannel::new(
            connection_manager.clone(),
            provider,
            SessionConfig::from(&settings.rfq),
        ));
        let status = Arc::new(status_channel(
            &settings.status_channel,
            connection_manager.clone(),
            rfq.clone(),
        ));

        let channels = Arc::new(ChannelRegistry::new([
            rfq.clone() as Arc<dyn Channel>,
            status as Arc<dyn Channel>,
        ]));

        Self {
            settings: Arc::new(settings),
            connection_manager,
            channels,
            rfq,
            start_time: Instant::now(),
        }
    }
}
