// Shared components
pub mod config;
pub mod error;
pub mod metrics;

// Connections and channels
pub mod channel;
pub mod connection_manager;
pub mod rfq;
pub mod status;

// Application layer
pub mod api;
pub mod server;
pub mod websocket;

// Supporting modules
pub mod shutdown;
pub mod tasks;
