//! Reasoning oracles
//!
//! An [`Oracle`] turns the conversation so far into the next assistant turn:
//! ordered text and tool-call intents. Two HTTP implementations are provided,
//! the Anthropic Messages API with native computer-use tools and Ollama's
//! `/api/chat` with plain function tools.

pub mod anthropic;
pub mod ollama;

pub use anthropic::AnthropicOracle;
pub use ollama::{parse_tool_calls_from_text, OllamaOracle};

use async_trait::async_trait;
use thiserror::Error;

use crate::agent::conversation::{ContentItem, Conversation};
use crate::computer::ToolDescriptor;

/// Error type for oracle calls
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("oracle returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("failed to parse oracle response: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("empty response from oracle")]
    EmptyResponse,
}

/// Decides which tools to call next
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    async fn respond(
        &self,
        system: &str,
        conversation: &Conversation,
        tools: &[ToolDescriptor],
    ) -> Result<Vec<ContentItem>, OracleError>;
}
