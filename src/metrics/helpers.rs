//! Metrics helper structs for convenient metric recording

use std::time::Duration;

use prometheus::{Encoder, TextEncoder};

use super::{
    CHANNELS_RUNNING, CHANNEL_DELIVERIES, COMMANDS_DROPPED, CONNECTIONS_CLOSED,
    CONNECTIONS_OPENED, CONNECTIONS_REJECTED, CONNECTIONS_TOTAL, FRAMES_RECEIVED,
    FRAMES_REJECTED, HEARTBEAT_TERMINATIONS, PRICE_FETCH_LATENCY, QUOTES_SENT, QUOTE_FAILURES,
    SESSIONS_ACTIVE, SESSION_TIMEOUTS,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened(live: usize) {
        CONNECTIONS_OPENED.inc();
        CONNECTIONS_TOTAL.set(live as i64);
    }

    pub fn record_closed(live: usize) {
        CONNECTIONS_CLOSED.inc();
        CONNECTIONS_TOTAL.set(live as i64);
    }

    /// Record a refused connection (`limit` or `invalid_user`)
    pub fn record_rejected(reason: &str) {
        CONNECTIONS_REJECTED.with_label_values(&[reason]).inc();
    }
}

/// Helper struct for heartbeat metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    pub fn record_terminated(count: u64) {
        HEARTBEAT_TERMINATIONS.inc_by(count);
    }
}

/// Helper struct for inbound frame metrics
pub struct FrameMetrics;

impl FrameMetrics {
    pub fn record_text() {
        FRAMES_RECEIVED.with_label_values(&["text"]).inc();
    }

    pub fn record_binary() {
        FRAMES_RECEIVED.with_label_values(&["binary"]).inc();
    }

    pub fn record_control() {
        FRAMES_RECEIVED.with_label_values(&["control"]).inc();
    }

    pub fn record_rejected() {
        FRAMES_REJECTED.inc();
    }

    pub fn record_dropped() {
        COMMANDS_DROPPED.inc();
    }
}

/// Helper struct for broadcast channel metrics
pub struct ChannelMetrics;

impl ChannelMetrics {
    pub fn record_started() {
        CHANNELS_RUNNING.inc();
    }

    pub fn record_stopped() {
        CHANNELS_RUNNING.dec();
    }

    pub fn record_delivered(channel: &str, count: u64) {
        CHANNEL_DELIVERIES.with_label_values(&[channel]).inc_by(count);
    }
}

/// Helper struct for quote session metrics
pub struct QuoteMetrics;

impl QuoteMetrics {
    pub fn set_active_sessions(count: usize) {
        SESSIONS_ACTIVE.set(count as i64);
    }

    pub fn record_offer() {
        QUOTES_SENT.inc();
    }

    pub fn record_failure() {
        QUOTE_FAILURES.inc();
    }

    pub fn record_timeout() {
        SESSION_TIMEOUTS.inc();
    }

    pub fn observe_fetch(elapsed: Duration) {
        PRICE_FETCH_LATENCY.observe(elapsed.as_secs_f64());
    }
}
