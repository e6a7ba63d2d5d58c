//! Price provider abstraction and the CryptoCompare REST client

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use thiserror::Error;

use crate::config::PriceProviderConfig;
use crate::metrics::QuoteMetrics;

#[derive(Debug, Error)]
pub enum PriceError {
    #[error("Request failed, url: {url}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Request failed with status {status}, url: {url}")]
    Status { status: u16, url: String },

    #[error("Invalid quote: no price for {currency}")]
    MissingPrice { currency: String },

    #[error("Invalid amount")]
    InvalidAmount,

    #[error("Amount out of range")]
    OutOfRange,

    #[error("{0}")]
    Upstream(String),
}

/// Supplies the current price of one currency in terms of another
#[async_trait]
pub trait PriceProvider: Send + Sync {
    async fn get_price(&self, from: &str, to: &str) -> Result<Decimal, PriceError>;
}

/// `GET {base}/data/price?fsym=<from>&tsyms=<to>`
pub struct CryptoCompareClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl CryptoCompareClient {
    pub fn new(config: &PriceProviderConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|key| !key.is_empty()),
        })
    }

    fn price_url(&self) -> String {
        format!("{}/data/price", self.base_url)
    }
}

#[async_trait]
impl PriceProvider for CryptoCompareClient {
    async fn get_price(&self, from: &str, to: &str) -> Result<Decimal, PriceError> {
        let url = self.price_url();
        let mut request = self
            .client
            .get(&url)
            .query(&[("fsym", from), ("tsyms", to)]);
        if let Some(key) = &self.api_key {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Apikey {}", key));
        }

        let started = Instant::now();
        let response = request.send().await;
        QuoteMetrics::observe_fetch(started.elapsed());

        let response = response.map_err(|source| PriceError::Http {
            url: url.clone(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PriceError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let body = response
            .json::<HashMap<String, Value>>()
            .await
            .map_err(|source| PriceError::Http { url, source })?;

        price_from_body(&body, to)
    }
}

/// Pull `<to>` out of a price response body.
///
/// Error responses look like `{"Response":"Error","Message":"..."}`.
pub fn price_from_body(body: &HashMap<String, Value>, to: &str) -> Result<Decimal, PriceError> {
    if body.get("Response").and_then(Value::as_str) == Some("Error") {
        let message = body
            .get("Message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error");
        return Err(PriceError::Upstream(message.to_string()));
    }

    body.get(to)
        .and_then(Value::as_f64)
        .and_then(Decimal::from_f64)
        .ok_or_else(|| PriceError::MissingPrice {
            currency: to.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    fn body(value: Value) -> HashMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_price_from_body() {
        let price = price_from_body(&body(json!({"ETH": 0.06})), "ETH").unwrap();
        assert_eq!(price, Decimal::from_str("0.06").unwrap());

        let price = price_from_body(&body(json!({"USD": 64250})), "USD").unwrap();
        assert_eq!(price, Decimal::from(64250));
    }

    #[test]
    fn test_missing_or_non_numeric_price() {
        assert!(matches!(
            price_from_body(&body(json!({})), "ETH"),
            Err(PriceError::MissingPrice { .. })
        ));
        assert!(matches!(
            price_from_body(&body(json!({"ETH": "n/a"})), "ETH"),
            Err(PriceError::MissingPrice { .. })
        ));
    }

    #[test]
    fn test_upstream_error_body() {
        let err = price_from_body(
            &body(json!({"Response": "Error", "Message": "fsym is a required param."})),
            "ETH",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "fsym is a required param.");
    }

    #[test]
    fn test_client_trims_base_url() {
        let config = PriceProviderConfig {
            base_url: "http://localhost:9000/".into(),
            ..Default::default()
        };
        let client = CryptoCompareClient::new(&config).unwrap();
        assert_eq!(client.price_url(), "http://localhost:9000/data/price");
    }
}
