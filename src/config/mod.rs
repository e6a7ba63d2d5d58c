mod settings;

pub use settings::{
    PriceProviderConfig, RfqConfig, ServerConfig, Settings, StatusChannelConfig, WebSocketConfig,
};
