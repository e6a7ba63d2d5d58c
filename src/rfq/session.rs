//! Per-connection quote negotiation.
//!
//! A session polls the price provider on a fixed interval and sends each
//! computed offer to its owning connection. It ends when the client stops it,
//! when the owning connection goes away, when the quote ceiling is reached
//! (`timeout`), or when consecutive fetch failures reach the tolerance
//! (`offer-failed`). Sessions that end on their own remove themselves from
//! the session table.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{Number, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RfqConfig;
use crate::connection_manager::ConnectionHandle;
use crate::metrics::QuoteMetrics;
use crate::websocket::ServerMessage;

use super::price::{PriceError, PriceProvider};
use super::quote::{fee_from_percent, format_fixed, parse_amount, percent_number, Quote, QuoteRequest};
use super::RFQ_CHANNEL;

/// Sessions are scoped to the connection that created them
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    /// Identity of the owning connection
    pub owner: String,
    /// Client-chosen key
    pub key: String,
}

impl SessionKey {
    pub fn new(owner: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            key: key.into(),
        }
    }
}

pub type SessionTable = DashMap<SessionKey, Arc<QuoteSession>>;

/// Timing and pricing knobs shared by every session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub quote_interval: Duration,
    pub error_tolerance: u32,
    /// Quote ceiling; exceeding it times the session out
    pub quote_timeout: u32,
    pub fee_percent: Decimal,
}

impl From<&RfqConfig> for SessionConfig {
    fn from(config: &RfqConfig) -> Self {
        Self {
            quote_interval: Duration::from_millis(config.quote_interval_ms.max(1)),
            error_tolerance: config.error_tolerance.max(1),
            quote_timeout: config.quote_timeout,
            fee_percent: fee_from_percent(config.fee_percent),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&RfqConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Created, no quote loop yet
    Connected,
    /// Quote loop active
    Quoting,
    /// Old loop torn down, pending parameters being adopted
    Updating,
    /// Quote ceiling reached
    Timeout,
    /// Error tolerance exhausted
    Failed,
    /// Stopped by the client or by disconnect
    Stopped,
}

impl SessionPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Timeout | Self::Failed | Self::Stopped)
    }
}

/// Messages a session sends, tagged by `action`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action")]
pub enum SessionEvent {
    #[serde(rename = "connected")]
    Connected,

    #[serde(rename = "offer", rename_all = "camelCase")]
    Offer {
        amount_to: String,
        amount_from: String,
        exchange_rate: String,
        comission_fee: Number,
    },

    #[serde(rename = "offer-failed")]
    OfferFailed { message: String },

    #[serde(rename = "timeout")]
    Timeout,
}

struct SessionState {
    request: QuoteRequest,
    /// Parameters waiting for the running loop to be torn down
    pending: Option<QuoteRequest>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the loop is cleared; fetches from an older loop are discarded
    generation: u64,
    error_count: u32,
    quote_count: u32,
    phase: SessionPhase,
    /// A fetch of the current loop is awaiting the provider
    in_flight: bool,
}

impl SessionState {
    fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
    }
}

pub struct QuoteSession {
    key: SessionKey,
    connection: Weak<ConnectionHandle>,
    provider: Arc<dyn PriceProvider>,
    config: SessionConfig,
    table: Weak<SessionTable>,
    this: Weak<QuoteSession>,
    state: Mutex<SessionState>,
}

impl QuoteSession {
    pub fn new(
        key: SessionKey,
        connection: &Arc<ConnectionHandle>,
        request: QuoteRequest,
        provider: Arc<dyn PriceProvider>,
        config: SessionConfig,
        table: Weak<SessionTable>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            key,
            connection: Arc::downgrade(connection),
            provider,
            config,
            table,
            this: this.clone(),
            state: Mutex::new(SessionState {
                request,
                pending: None,
                timer: None,
                generation: 0,
                error_count: 0,
                quote_count: 0,
                phase: SessionPhase::Connected,
                in_flight: false,
            }),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    pub async fn request(&self) -> QuoteRequest {
        self.state.lock().await.request.clone()
    }

    pub async fn quote_count(&self) -> u32 {
        self.state.lock().await.quote_count
    }

    pub async fn error_count(&self) -> u32 {
        self.state.lock().await.error_count
    }

    pub async fn is_quoting(&self) -> bool {
        self.state.lock().await.timer.is_some()
    }

    /// Acknowledge the session and start quoting
    pub async fn start(&self) {
        let mut state = self.state.lock().await;
        self.send(SessionEvent::Connected).await;
        self.start_quotes(&mut state);
    }

    /// Change the quoted pair or amount.
    ///
    /// Identical parameters are ignored. A running loop is torn down and the
    /// new parameters are adopted on restart; an idle session starts quoting
    /// right away.
    pub async fn update(&self, request: QuoteRequest) {
        let mut state = self.state.lock().await;
        if state.request.same_as(&request) {
            return;
        }

        tracing::debug!(
            session_key = %self.key.key,
            connection_id = %self.key.owner,
            curr_from = %request.curr_from,
            curr_to = %request.curr_to,
            amount_from = %request.amount_from,
            "Updating quote session"
        );

        if state.timer.is_some() {
            state.pending = Some(request);
            state.phase = SessionPhase::Updating;
            self.stop_quotes(&mut state, true);
        } else {
            state.request = request;
            self.start_quotes(&mut state);
        }
    }

    /// Stop quoting for good; a staged update is discarded
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.stop_quotes(&mut state, false);
        state.phase = SessionPhase::Stopped;
    }

    /// Order execution has no counterparty yet; the intent is only logged
    pub async fn place_order(&self) {
        let state = self.state.lock().await;
        tracing::info!(
            session_key = %self.key.key,
            connection_id = %self.key.owner,
            curr_from = %state.request.curr_from,
            curr_to = %state.request.curr_to,
            amount_from = %state.request.amount_from,
            quote_count = state.quote_count,
            "Order requested"
        );
    }

    fn start_quotes(&self, state: &mut SessionState) {
        state.clear_timer();
        state.error_count = 0;
        state.quote_count = 0;
        state.in_flight = false;
        state.phase = SessionPhase::Quoting;

        let generation = state.generation;
        let period = self.config.quote_interval;
        let session = self.this.clone();

        // First tick of `interval` completes immediately
        state.timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(session) = session.upgrade() else {
                    break;
                };
                tokio::spawn(session.fetch_tick(generation));
            }
        }));
    }

    /// Clear the loop. With `restart`, adopt a staged update and start again.
    fn stop_quotes(&self, state: &mut SessionState, restart: bool) {
        state.clear_timer();
        if !restart {
            state.pending = None;
            return;
        }
        if let Some(pending) = state.pending.take() {
            state.request = pending;
            self.start_quotes(state);
        }
    }

    async fn fetch_tick(self: Arc<Self>, generation: u64) {
        let request = {
            let mut state = self.state.lock().await;
            if state.generation != generation || state.timer.is_none() || state.in_flight {
                return;
            }
            state.in_flight = true;
            state.request.clone()
        };

        if self.connection.upgrade().is_none() {
            tracing::debug!(session_key = %self.key.key, "Owning connection gone, stopping session");
            self.stop().await;
            self.remove_from_table();
            return;
        }

        let result = self.fetch_quote(&request).await;

        let mut state = self.state.lock().await;
        // Stopped or restarted while the provider was answering
        if state.generation != generation {
            return;
        }
        state.in_flight = false;

        let finished = match result {
            Ok(quote) => {
                state.error_count = 0;
                self.send(offer_event(&request, &quote, self.config.fee_percent)).await;
                QuoteMetrics::record_offer();
                state.quote_count += 1;

                tracing::debug!(
                    session_key = %self.key.key,
                    connection_id = %self.key.owner,
                    amount_to = %quote.converted_amount,
                    quote_count = state.quote_count,
                    "Offer sent"
                );

                if state.quote_count > self.config.quote_timeout {
                    self.stop_quotes(&mut state, false);
                    state.phase = SessionPhase::Timeout;
                    self.send(SessionEvent::Timeout).await;
                    QuoteMetrics::record_timeout();
                    tracing::info!(
                        session_key = %self.key.key,
                        connection_id = %self.key.owner,
                        quote_count = state.quote_count,
                        "Quote session timed out"
                    );
                    true
                } else {
                    false
                }
            }
            Err(e) => {
                QuoteMetrics::record_failure();
                if matches!(e, PriceError::InvalidAmount) {
                    state.error_count = self.config.error_tolerance;
                } else {
                    state.error_count += 1;
                }

                tracing::warn!(
                    session_key = %self.key.key,
                    connection_id = %self.key.owner,
                    error_count = state.error_count,
                    quote_count = state.quote_count,
                    error = %e,
                    "Quote fetch failed"
                );

                if state.error_count >= self.config.error_tolerance {
                    self.stop_quotes(&mut state, false);
                    state.phase = SessionPhase::Failed;
                    self.send(SessionEvent::OfferFailed {
                        message: format!("Offer failed: {}", e),
                    })
                    .await;
                    true
                } else {
                    false
                }
            }
        };
        drop(state);

        if finished {
            self.remove_from_table();
        }
    }

    async fn fetch_quote(&self, request: &QuoteRequest) -> Result<Quote, PriceError> {
        let amount = parse_amount(&request.amount_from).ok_or(PriceError::InvalidAmount)?;
        let price = self
            .provider
            .get_price(&request.curr_from, &request.curr_to)
            .await?;
        Quote::compute(amount, price, self.config.fee_percent).ok_or(PriceError::OutOfRange)
    }

    /// Drop this session's table entry unless it was already replaced
    fn remove_from_table(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let removed = table
            .remove_if(&self.key, |_, session| std::ptr::eq(Arc::as_ptr(session), self))
            .is_some();
        if removed {
            QuoteMetrics::set_active_sessions(table.len());
        }
    }

    async fn send(&self, event: SessionEvent) {
        let Some(conn) = self.connection.upgrade() else {
            return;
        };
        let payload = match event_payload(&self.key.key, &event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(session_key = %self.key.key, error = %e, "Failed to serialize session event");
                return;
            }
        };
        if conn.send(ServerMessage::channel(RFQ_CHANNEL, &payload)).await.is_err() {
            tracing::debug!(
                session_key = %self.key.key,
                connection_id = %conn.identity,
                "Connection closed before session event was delivered"
            );
        }
    }
}

impl Drop for QuoteSession {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_lock() {
            state.clear_timer();
        }
    }
}

fn offer_event(request: &QuoteRequest, quote: &Quote, fee_percent: Decimal) -> SessionEvent {
    SessionEvent::Offer {
        amount_to: format_fixed(quote.converted_amount),
        amount_from: request.amount_from.clone(),
        exchange_rate: format_fixed(quote.exchange_rate),
        comission_fee: percent_number(fee_percent),
    }
}

/// `{ "key": ..., "action": ..., ...fields }`
fn event_payload(key: &str, event: &SessionEvent) -> Result<Value, serde_json::Error> {
    let mut payload = serde_json::to_value(event)?;
    if let Value::Object(fields) = &mut payload {
        fields.insert("key".to_string(), Value::String(key.to_string()));
    }
    Ok(payload)
}
