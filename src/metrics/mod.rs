//! Prometheus metrics for the RFQ broadcast service.
//!
//! - Connection metrics (live connections, accepts, rejections, heartbeat reaping)
//! - Frame metrics (inbound frames by kind, malformed frames, dropped commands)
//! - Channel metrics (running channels, broadcast deliveries)
//! - Quote metrics (sessions, offers, failures, timeouts, price fetch latency)

mod helpers;

pub use helpers::{
    encode_metrics, ChannelMetrics, ConnectionMetrics, FrameMetrics, HeartbeatMetrics,
    QuoteMetrics,
};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "rfq";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Total number of live WebSocket connections
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Total number of live WebSocket connections"
    ).unwrap();

    /// Connections accepted since start
    pub static ref CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total WebSocket connections accepted"
    ).unwrap();

    /// Connections closed since start
    pub static ref CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total WebSocket connections closed"
    ).unwrap();

    /// Connections refused at accept time, by reason
    pub static ref CONNECTIONS_REJECTED: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_rejected_total", METRIC_PREFIX),
        "Total WebSocket connections refused at accept time",
        &["reason"]
    ).unwrap();

    /// Connections terminated by the heartbeat sweep
    pub static ref HEARTBEAT_TERMINATIONS: IntCounter = register_int_counter!(
        format!("{}_heartbeat_terminations_total", METRIC_PREFIX),
        "Total connections terminated for missing a heartbeat"
    ).unwrap();

    // ============================================================================
    // Frame Metrics
    // ============================================================================

    /// Inbound frames by kind
    pub static ref FRAMES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_frames_received_total", METRIC_PREFIX),
        "Total inbound WebSocket frames",
        &["kind"]
    ).unwrap();

    /// Frames that failed to parse
    pub static ref FRAMES_REJECTED: IntCounter = register_int_counter!(
        format!("{}_frames_rejected_total", METRIC_PREFIX),
        "Total malformed inbound frames"
    ).unwrap();

    /// Commands dropped for an identity mismatch
    pub static ref COMMANDS_DROPPED: IntCounter = register_int_counter!(
        format!("{}_commands_dropped_total", METRIC_PREFIX),
        "Total commands dropped because the uuid did not match the connection"
    ).unwrap();

    // ============================================================================
    // Channel Metrics
    // ============================================================================

    /// Channels with an active broadcast timer
    pub static ref CHANNELS_RUNNING: IntGauge = register_int_gauge!(
        format!("{}_channels_running", METRIC_PREFIX),
        "Number of channels with an active broadcast timer"
    ).unwrap();

    /// Broadcast frames delivered, per channel
    pub static ref CHANNEL_DELIVERIES: IntCounterVec = register_int_counter_vec!(
        format!("{}_channel_deliveries_total", METRIC_PREFIX),
        "Total broadcast frames delivered to subscribers",
        &["channel"]
    ).unwrap();

    // ============================================================================
    // Quote Metrics
    // ============================================================================

    /// Quote sessions currently registered
    pub static ref SESSIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_sessions_active", METRIC_PREFIX),
        "Number of active quote sessions"
    ).unwrap();

    /// Offers sent to clients
    pub static ref QUOTES_SENT: IntCounter = register_int_counter!(
        format!("{}_quotes_sent_total", METRIC_PREFIX),
        "Total offers sent"
    ).unwrap();

    /// Price fetch failures
    pub static ref QUOTE_FAILURES: IntCounter = register_int_counter!(
        format!("{}_quote_failures_total", METRIC_PREFIX),
        "Total failed quote fetches"
    ).unwrap();

    /// Sessions ended by the quote ceiling
    pub static ref SESSION_TIMEOUTS: IntCounter = register_int_counter!(
        format!("{}_session_timeouts_total", METRIC_PREFIX),
        "Total quote sessions that reached the quote ceiling"
    ).unwrap();

    /// Price provider round trip
    pub static ref PRICE_FETCH_LATENCY: Histogram = register_histogram!(
        format!("{}_price_fetch_latency_seconds", METRIC_PREFIX),
        "Price provider latency in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).unwrap();
}
