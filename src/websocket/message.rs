use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::channel::{ActionCommand, ChannelCommand};

/// Application close code: authentication rejected, client must not retry
pub const CLOSE_NO_RETRY: u16 = 4422;
/// Standard close code for server shutdown
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Standard policy-violation close code, used for invalid users
pub const CLOSE_INVALID_USER: u16 = 1008;

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// `{ "handshake": "<identity>" }`
    Handshake { handshake: String },
    /// `{ "status": "error", "error": "<message>" }`
    Error { status: String, error: String },
    /// `{ "channel": "<name>", ...payload }`
    Channel(Value),
}

impl ServerMessage {
    pub fn handshake(identity: impl Into<String>) -> Self {
        Self::Handshake {
            handshake: identity.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            status: "error".to_string(),
            error: message.into(),
        }
    }

    /// Wrap a payload in the channel envelope.
    ///
    /// Object payloads are merged next to `channel`; anything else is carried
    /// under `data`.
    pub fn channel(name: &str, payload: &Value) -> Self {
        let mut envelope = Map::new();
        envelope.insert("channel".to_string(), Value::String(name.to_string()));
        match payload {
            Value::Object(fields) => {
                for (k, v) in fields {
                    envelope.insert(k.clone(), v.clone());
                }
            }
            other => {
                envelope.insert("data".to_string(), other.clone());
            }
        }
        Self::Channel(Value::Object(envelope))
    }
}

/// Everything the per-connection writer task can be asked to do
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// Serialized when written to the socket
    Raw(ServerMessage),
    /// Serialized once and shared between recipients
    Preserialized(Arc<str>),
    /// Liveness probe
    Ping,
    /// Close handshake; the writer stops afterwards
    Close { code: u16, reason: &'static str },
}

impl OutboundMessage {
    /// JSON text for data messages, `None` for control frames
    pub fn to_json(&self) -> Result<Option<String>, serde_json::Error> {
        match self {
            Self::Raw(message) => serde_json::to_string(message).map(Some),
            Self::Preserialized(text) => Ok(Some(text.to_string())),
            Self::Ping | Self::Close { .. } => Ok(None),
        }
    }
}

/// Why an inbound frame was rejected
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame must be a JSON object")]
    NotAnObject,

    #[error("frame must contain exactly one channel, found {0}")]
    ChannelCount(usize),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid command for channel {channel}: {reason}")]
    InvalidCommand { channel: String, reason: String },
}

/// A parsed `{ "<channel>": <command> }` envelope
#[derive(Debug, Clone, PartialEq)]
pub struct ClientFrame {
    pub channel: String,
    pub command: ChannelCommand,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut fields) = value else {
            return Err(FrameError::NotAnObject);
        };
        if fields.len() != 1 {
            return Err(FrameError::ChannelCount(fields.len()));
        }

        let channel = fields.keys().next().cloned().unwrap_or_default();
        let body = fields.remove(&channel).unwrap_or(Value::Null);

        let command = match body {
            Value::String(name) => match name.as_str() {
                "subscribe" => ChannelCommand::Subscribe,
                "unsubscribe" => ChannelCommand::Unsubscribe,
                "current" => ChannelCommand::Current,
                _ => return Err(FrameError::UnknownCommand(name)),
            },
            Value::Object(_) => {
                let action: ActionCommand =
                    serde_json::from_value(body).map_err(|e| FrameError::InvalidCommand {
                        channel: channel.clone(),
                        reason: e.to_string(),
                    })?;
                ChannelCommand::Action(action)
            }
            _ => {
                return Err(FrameError::InvalidCommand {
                    channel,
                    reason: "expected a command string or object".to_string(),
                })
            }
        };

        Ok(Self { channel, command })
    }
}
