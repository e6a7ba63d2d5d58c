//! WebSocket endpoint: upgrade, per-connection reader/writer tasks and the
//! `{ "<channel>": <command> }` wire envelope.

mod handler;
mod message;

pub use handler::ws_handler;
pub use message::{
    ClientFrame, FrameError, OutboundMessage, ServerMessage, CLOSE_GOING_AWAY,
    CLOSE_INVALID_USER, CLOSE_NO_RETRY,
};
