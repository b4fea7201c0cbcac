//! Wire protocol: one JSON object per line, UTF-8, `\n`-terminated, over a
//! duplex pipe endpoint. Field names are PascalCase on the wire. A frame
//! with an embedded newline cannot exist by construction (JSON escapes
//! control characters), and oversized frames are rejected on both sides.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Default pipe endpoint name.
pub const DEFAULT_PIPE_NAME: &str = "XStateNet.MessageBus";

/// Upper bound for a single frame, delimiter included.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// The pipe name maps to a socket path under the system temp directory.
pub fn socket_path(pipe_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{pipe_name}.sock"))
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterPayload {
    pub machine_id: String,
    pub process_name: String,
    pub process_id: u32,
    pub registered_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct UnregisterPayload {
    pub machine_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct SubscribePayload {
    pub machine_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct EventPayload {
    pub source_machine_id: String,
    pub target_machine_id: String,
    pub event_name: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventPayload {
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        event_name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            source_machine_id: source.into(),
            target_machine_id: target.into(),
            event_name: event_name.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Request/reply opt-in marker carried inside the event payload.
    pub fn correlation_id(&self) -> Option<&str> {
        self.payload.get("correlationId")?.as_str()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<EventPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One frame on the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum PipeMessage {
    Register(RegisterPayload),
    Unregister(UnregisterPayload),
    Subscribe(SubscribePayload),
    SendEvent(EventPayload),
    Response(ResponsePayload),
}

/// Serialize a frame, newline delimiter included.
pub fn encode_frame(message: &PipeMessage) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    if bytes.len() + 1 > MAX_FRAME_BYTES {
        bail!("frame of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit", bytes.len());
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one line (without its delimiter) into a frame.
pub fn decode_frame(line: &str) -> Result<PipeMessage> {
    if line.len() > MAX_FRAME_BYTES {
        bail!("frame of {} bytes exceeds the {MAX_FRAME_BYTES} byte limit", line.len());
    }
    serde_json::from_str(line).map_err(|e| anyhow!("malformed frame: {e}"))
}
