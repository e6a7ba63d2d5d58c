use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub rfq: RfqConfig,
    #[serde(default)]
    pub price_provider: PriceProviderConfig,
    #[serde(default)]
    pub status_channel: StatusChannelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Liveness sweep interval in seconds (server sends ping)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Connections beyond this count are closed with the no-retry code
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Outbound queue length per connection
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RfqConfig {
    /// Delay between two quote fetches of a session
    #[serde(default = "default_quote_interval_ms")]
    pub quote_interval_ms: u64,
    /// Consecutive fetch failures tolerated before the session fails
    #[serde(default = "default_error_tolerance")]
    pub error_tolerance: u32,
    /// Number of quotes after which a session times out
    #[serde(default = "default_quote_timeout")]
    pub quote_timeout: u32,
    /// Commission taken from the source amount, in percent
    #[serde(default = "default_fee_percent")]
    pub fee_percent: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceProviderConfig {
    #[serde(default = "default_price_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusChannelConfig {
    /// Broadcast interval; values below 1 disable subscriptions
    #[serde(default = "default_status_interval_ms")]
    pub interval_ms: i64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3030
}

fn default_heartbeat_interval() -> u64 {
    10 // 10 seconds
}

fn default_max_connections() -> usize {
    10000
}

fn default_send_buffer() -> usize {
    64
}

fn default_quote_interval_ms() -> u64 {
    4000
}

fn default_error_tolerance() -> u32 {
    2
}

fn default_quote_timeout() -> u32 {
    120
}

fn default_fee_percent() -> f64 {
    1.0
}

fn default_price_base_url() -> String {
    "https://min-api.cryptocompare.com".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_status_interval_ms() -> i64 {
    10000
}

impl Settings {
    pub fn new() -> Result<Self> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();
        Self::load(Self::environment())
    }

    /// SERVER__PORT, RFQ__FEE_PERCENT, PRICE_PROVIDER__API_KEY, etc.
    ///
    /// Only `SERVER__CORS_ORIGINS` is split on commas; every other value is
    /// taken whole.
    fn environment() -> Environment {
        Environment::default()
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("server.cors_origins")
    }

    fn load(environment: Environment) -> Result<Self> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3030)?
            .set_default("websocket.heartbeat_interval", 10)?
            .set_default("rfq.quote_interval_ms", 4000)?
            .set_default("rfq.error_tolerance", 2)?
            .set_default("rfq.quote_timeout", 120)?
            .set_default("rfq.fee_percent", 1.0)?
            .set_default("status_channel.interval_ms", 10000)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(environment);

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            websocket: WebSocketConfig::default(),
            rfq: RfqConfig::default(),
            price_provider: PriceProviderConfig::default(),
            status_channel: StatusChannelConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            max_connections: default_max_connections(),
            send_buffer: default_send_buffer(),
        }
    }
}

impl Default for RfqConfig {
    fn default() -> Self {
        Self {
            quote_interval_ms: default_quote_interval_ms(),
            error_tolerance: default_error_tolerance(),
            quote_timeout: default_quote_timeout(),
            fee_percent: default_fee_percent(),
        }
    }
}

impl Default for PriceProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_price_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            api_key: None,
        }
    }
}

impl Default for StatusChannelConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_status_interval_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 3030);
        assert_eq!(settings.websocket.heartbeat_interval, 10);
        assert_eq!(settings.rfq.quote_interval_ms, 4000);
        assert_eq!(settings.rfq.error_tolerance, 2);
        assert_eq!(settings.rfq.quote_timeout, 120);
        assert_eq!(settings.server_addr(), "0.0.0.0:3030");
    }

    fn env_overrides(vars: &[(&str, &str)]) -> Environment {
        let vars: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::environment().source(Some(vars))
    }

    #[test]
    fn test_string_and_list_overrides() {
        let settings = Settings::load(env_overrides(&[
            ("PRICE_PROVIDER__BASE_URL", "http://localhost:9000"),
            ("PRICE_PROVIDER__API_KEY", "secret"),
            ("SERVER__HOST", "127.0.0.1"),
            ("SERVER__PORT", "8080"),
            ("SERVER__CORS_ORIGINS", "http://a.example,http://b.example"),
        ]))
        .unwrap();

        assert_eq!(settings.price_provider.base_url, "http://localhost:9000");
        assert_eq!(settings.price_provider.api_key.as_deref(), Some("secret"));
        assert_eq!(settings.server_addr(), "127.0.0.1:8080");
        assert_eq!(
            settings.server.cors_origins,
            vec!["http://a.example".to_string(), "http://b.example".to_string()]
        );
    }

    #[test]
    fn test_numeric_overrides() {
        let settings = Settings::load(env_overrides(&[
            ("RFQ__QUOTE_TIMEOUT", "5"),
            ("RFQ__FEE_PERCENT", "0.5"),
        ]))
        .unwrap();

        assert_eq!(settings.rfq.quote_timeout, 5);
        assert_eq!(settings.rfq.fee_percent, 0.5);
        assert_eq!(settings.rfq.error_tolerance, 2);
    }
}
