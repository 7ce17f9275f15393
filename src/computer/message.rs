//! Inbound frame shape

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A result frame received from the remote computer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputerMessage {
    /// Echo of the action that produced this frame
    #[serde(default)]
    pub raw_input: Value,
    pub tool_result: ToolResult,
    pub metadata: MessageMetadata,
}

/// Outcome of one action on the remote side; every field may be null
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub base64_image: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}

/// Envelope fields set by the remote side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub session_id: Uuid,
    pub message_id: Uuid,
    pub request_timestamp: DateTime<Utc>,
    pub response_timestamp: DateTime<Utc>,
}
