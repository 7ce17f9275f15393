//! Anthropic Messages API oracle
//!
//! The fixed tools are advertised with their native computer-use types, so the
//! model's `input` for them already has the `params` shape the computer expects.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Oracle, OracleError};
use crate::agent::conversation::{ContentItem, Conversation, ResultBlock, ToolCallIntent, Turn};
use crate::computer::ToolDescriptor;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const COMPUTER_USE_BETA: &str = "computer-use-2024-10-22";

/// Client for `/v1/messages`
#[derive(Clone)]
pub struct AnthropicOracle {
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

impl AnthropicOracle {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens: 4096,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Request body for one turn
    pub fn request_body(
        &self,
        system: &str,
        conversation: &Conversation,
        tools: &[ToolDescriptor],
    ) -> Value {
        json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": conversation.turns().iter().map(turn_to_message).collect::<Vec<_>>(),
            "tools": tools.iter().map(tool_to_json).collect::<Vec<_>>(),
        })
    }
}

#[async_trait]
impl Oracle for AnthropicOracle {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn respond(
        &self,
        system: &str,
        conversation: &Conversation,
        tools: &[ToolDescriptor],
    ) -> Result<Vec<ContentItem>, OracleError> {
        let endpoint = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = self.request_body(system, conversation, tools);

        let response = self
            .client
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("anthropic-beta", COMPUTER_USE_BETA)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(OracleError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        if text.is_empty() {
            return Err(OracleError::EmptyResponse);
        }

        let parsed: MessagesResponse = serde_json::from_str(&text)?;
        Ok(into_content_items(parsed))
    }
}

fn into_content_items(response: MessagesResponse) -> Vec<ContentItem> {
    response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ResponseBlock::Text { text } => Some(ContentItem::Text { text }),
            ResponseBlock::ToolUse { id, name, input } => {
                Some(ContentItem::ToolCall(ToolCallIntent { id, name, input }))
            }
            ResponseBlock::Other => None,
        })
        .collect()
}

fn tool_to_json(tool: &ToolDescriptor) -> Value {
    match tool {
        ToolDescriptor::Bash => json!({"type": "bash_20241022", "name": "bash"}),
        ToolDescriptor::Computer {
            display_width_px,
            display_height_px,
            display_number,
        } => {
            let mut value = json!({
                "type": "computer_20241022",
                "name": "computer",
                "display_width_px": display_width_px,
                "display_height_px": display_height_px,
            });
            if let Some(number) = display_number {
                value["display_number"] = json!(number);
            }
            value
        }
        ToolDescriptor::Editor => {
            json!({"type": "text_editor_20241022", "name": "str_replace_editor"})
        }
        ToolDescriptor::Function { .. } => json!({
            "name": tool.name(),
            "description": tool.description(),
            "input_schema": tool.input_schema(),
        }),
    }
}

fn turn_to_message(turn: &Turn) -> Value {
    match turn {
        Turn::User { text } => json!({
            "role": "user",
            "content": [{"type": "text", "text": text}],
        }),
        Turn::Assistant { content } => {
            let blocks: Vec<Value> = content
                .iter()
                .map(|item| match item {
                    ContentItem::Text { text } => json!({"type": "text", "text": text}),
                    ContentItem::ToolCall(intent) => json!({
                        "type": "tool_use",
                        "id": intent.id,
                        "name": intent.name,
                        "input": intent.input,
                    }),
                })
                .collect();
            json!({"role": "assistant", "content": blocks})
        }
        Turn::ToolResults { results } => {
            let blocks: Vec<Value> = results
                .iter()
                .map(|result| {
                    let content: Vec<Value> = result
                        .content
                        .iter()
                        .map(|block| match block {
                            ResultBlock::Text { text } => json!({"type": "text", "text": text}),
                            ResultBlock::Image { media_type, data } => json!({
                                "type": "image",
                                "source": {"type": "base64", "media_type": media_type, "data": data},
                            }),
                        })
                        .collect();
                    json!({
                        "type": "tool_result",
                        "tool_use_id": result.call_id,
                        "is_error": result.is_error,
                        "content": content,
                    })
                })
                .collect();
            json!({"role": "user", "content": blocks})
        }
    }
}
