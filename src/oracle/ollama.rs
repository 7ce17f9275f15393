//! Ollama Chat API oracle
//!
//! Talks to `/api/chat` with function tools. Smaller local models often write
//! the tool call as JSON inside the text instead of using `tool_calls`, so the
//! text is parsed as a fallback. Ollama does not issue call ids; they are
//! synthesized here so results can be correlated like any other oracle's.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{Oracle, OracleError};
use crate::agent::conversation::{ContentItem, Conversation, ResultBlock, ToolCallIntent, Turn};
use crate::computer::ToolDescriptor;

/// A message in a chat conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String, // "system", "user", "assistant", "tool"
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Base64 images attached to the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            images: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new("tool", content)
    }
}

/// A tool call from the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub function: FunctionCall,
}

/// Function call details
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
}

/// Tool definition for the model
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String, // Always "function"
    pub function: ToolFunction,
}

/// Function specification for a tool
#[derive(Debug, Clone, Serialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    pub parameters: Value, // JSON Schema
}

impl From<&ToolDescriptor> for Tool {
    fn from(descriptor: &ToolDescriptor) -> Self {
        Tool {
            tool_type: "function".to_string(),
            function: ToolFunction {
                name: descriptor.name().to_string(),
                description: descriptor.description(),
                parameters: descriptor.input_schema(),
            },
        }
    }
}

/// Response from /api/chat
#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub message: ChatMessage,
}

/// Oracle backed by a local Ollama server
#[derive(Clone)]
pub struct OllamaOracle {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaOracle {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Send a chat request with optional tools
    pub async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<Tool>>,
    ) -> Result<ChatResponse, OracleError> {
        let endpoint = format!("{}/api/chat", self.base_url.trim_end_matches('/'));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": 0.0
            }
        });

        if let Some(t) = tools {
            body["tools"] = serde_json::to_value(t)?;
        }

        let response = self.client.post(&endpoint).json(&body).send().await?;
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

        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl Oracle for OllamaOracle {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn respond(
        &self,
        system: &str,
        conversation: &Conversation,
        tools: &[ToolDescriptor],
    ) -> Result<Vec<ContentItem>, OracleError> {
        let messages = to_chat_messages(system, conversation);
        let tools = tools.iter().map(Tool::from).collect();
        let response = self.chat(messages, Some(tools)).await?;
        Ok(into_content_items(response.message))
    }
}

/// Flatten the conversation into Ollama's role/content messages
pub fn to_chat_messages(system: &str, conversation: &Conversation) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(system)];

    for turn in conversation.turns() {
        match turn {
            Turn::User { text } => messages.push(ChatMessage::user(text.as_str())),
            Turn::Assistant { content } => {
                let mut text = Vec::new();
                let mut calls = Vec::new();
                for item in content {
                    match item {
                        ContentItem::Text { text: t } => text.push(t.as_str()),
                        ContentItem::ToolCall(intent) => calls.push(ToolCall {
                            function: FunctionCall {
                                name: intent.name.clone(),
                                arguments: intent.input.clone(),
                            },
                        }),
                    }
                }
                let mut message = ChatMessage::assistant(text.join("\n"));
                if !calls.is_empty() {
                    message.tool_calls = Some(calls);
                }
                messages.push(message);
            }
            Turn::ToolResults { results } => {
                for result in results {
                    let mut message = ChatMessage::tool(if result.is_error {
                        format!("Error from {}: {}", result.tool, result.text())
                    } else {
                        result.text()
                    });
                    let images: Vec<String> = result
                        .content
                        .iter()
                        .filter_map(|block| match block {
                            ResultBlock::Image { data, .. } => Some(data.clone()),
                            ResultBlock::Text { .. } => None,
                        })
                        .collect();
                    if !images.is_empty() {
                        message.images = Some(images);
                    }
                    messages.push(message);
                }
            }
        }
    }

    messages
}

/// Turn a reply into content items, falling back to tool calls written as text
fn into_content_items(message: ChatMessage) -> Vec<ContentItem> {
    let native = message.tool_calls.filter(|calls| !calls.is_empty());
    let from_text = native.is_none();
    let calls = native.unwrap_or_else(|| parse_tool_calls_from_text(&message.content));

    let mut items = Vec::new();
    // text that was only a serialized tool call is not narrative
    if !message.content.trim().is_empty() && !(from_text && !calls.is_empty()) {
        items.push(ContentItem::Text {
            text: message.content,
        });
    }
    for call in calls {
        items.push(ContentItem::ToolCall(ToolCallIntent {
            id: format!("call_{}", Uuid::now_v7().simple()),
            name: call.function.name,
            input: normalize_arguments(call.function.arguments),
        }));
    }
    items
}

/// Some models send arguments as a JSON-encoded string
fn normalize_arguments(arguments: Value) -> Value {
    match arguments {
        Value::String(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
        other => other,
    }
}

/// Try to parse tool calls from the response content text
///
/// This handles models that output tool calls as JSON in the text
/// instead of using the native tool_calls field.
pub fn parse_tool_calls_from_text(content: &str) -> Vec<ToolCall> {
    let mut tool_calls = Vec::new();

    let content = content.trim();

    // Try parsing the entire content as a tool call
    if let Some(tool_call) = try_parse_tool_call(content) {
        tool_calls.push(tool_call);
        return tool_calls;
    }

    // Otherwise scan for balanced {...} spans
    let mut depth = 0;
    let mut start = None;

    for (i, c) in content.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        if let Some(tool_call) = try_parse_tool_call(&content[s..=i]) {
                            tool_calls.push(tool_call);
                        }
                    }
                    start = None;
                }
            }
            _ => {}
        }
    }

    tool_calls
}

/// Try to parse a single tool call from a JSON string
fn try_parse_tool_call(json_str: &str) -> Option<ToolCall> {
    if let Ok(value) = serde_json::from_str::<Value>(json_str) {
        return parse_tool_call_from_value(&value);
    }

    // Fallback: unescaped quotes inside a shell command
    // {"name": "bash", "arguments": {"command": "echo "hello""}}
    if let Some(fixed) = try_fix_malformed_json(json_str) {
        if let Ok(value) = serde_json::from_str::<Value>(&fixed) {
            return parse_tool_call_from_value(&value);
        }
    }

    None
}

/// Escape stray double quotes in the last string field before the closing braces
fn try_fix_malformed_json(json_str: &str) -> Option<String> {
    let (marker_start, marker) = ["\"command\": \"", "\"text\": \"", "\"file_text\": \""]
        .iter()
        .find_map(|marker| json_str.find(marker).map(|i| (i, *marker)))?;
    let value_start = marker_start + marker.len();

    let remaining = &json_str[value_start..];
    let end_pattern = remaining.rfind("\"}}")?;
    let inner = &remaining[..end_pattern];

    let escaped = inner
        .replace("\\\"", "\u{FFFF}") // keep already-escaped quotes
        .replace('"', "\\\"")
        .replace('\u{FFFF}', "\\\"");

    let prefix = &json_str[..value_start];
    let suffix = &json_str[value_start + end_pattern..];

    Some(format!("{}{}{}", prefix, escaped, suffix))
}

/// Parse a tool call from a JSON Value
fn parse_tool_call_from_value(value: &Value) -> Option<ToolCall> {
    // Expected: {"name": "...", "arguments": {...}}
    let name = value.get("name").and_then(|n| n.as_str())?;

    let arguments = if let Some(args) = value.get("arguments") {
        args.clone()
    } else if let Some(params) = value.get("parameters") {
        // Some models use "parameters" and mix schema with values:
        // {"parameters": {"command": {"value": "ls"}}}
        match params {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| {
                        let unwrapped = v.get("value").cloned().unwrap_or_else(|| v.clone());
                        (key.clone(), unwrapped)
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    } else {
        return None;
    };

    Some(ToolCall {
        function: FunctionCall {
            name: name.to_string(),
            arguments,
        },
    })
}
