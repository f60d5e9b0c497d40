//! Control channel message types.
//!
//! One JSON object per WebSocket text frame, internally tagged on `type`:
//!
//! ```text
//! client -> server   { "type": "start", "duration": 10 }   { "type": "stop" }
//! server -> client   { "type": "speed", "speed": 93.4 }    { "type": "final", "average": 91.2 }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Commands sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Begin a run. Absent or zero duration means the configured default.
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<u64>,
    },
    /// End the current run early.
    Stop,
    /// Any other `type`; ignored.
    #[serde(other)]
    Unknown,
}

/// Reports sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// One sample, in Mbps.
    Speed { speed: f64 },
    /// Mean of all samples of the run, in Mbps. Exactly one per run.
    Final { average: f64 },
}

/// An inbound frame that could not be understood.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn decode_client(text: &str) -> Result<ClientMessage, DecodeError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_server(msg: &ServerMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}
