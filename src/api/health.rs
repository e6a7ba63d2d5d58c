//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::channel::ChannelInfo;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: usize,
    pub sessions: usize,
    pub channels: Vec<ChannelInfo>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        connections: state.connection_manager.connection_count(),
        sessions: state.rfq.session_count(),
        channels: state.channels.stats().await,
    })
}
