//! Conversation state owned by the agent loop

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::computer::ComputerMessage;
use crate::mcp::{CallToolResult, ContentBlock};

/// A structured request from the oracle to run a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallIntent {
    /// Oracle-assigned id, echoed back in the matching result
    pub id: String,
    pub name: String,
    pub input: Value,
}

/// One item of an oracle turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentItem {
    Text { text: String },
    ToolCall(ToolCallIntent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultBlock {
    Text { text: String },
    Image { media_type: String, data: String },
}

/// The outcome of one tool-call intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultItem {
    pub call_id: String,
    pub tool: String,
    pub content: Vec<ResultBlock>,
    pub is_error: bool,
}

impl ToolResultItem {
    pub fn error(intent: &ToolCallIntent, message: impl Into<String>) -> Self {
        Self {
            call_id: intent.id.clone(),
            tool: intent.name.clone(),
            content: vec![ResultBlock::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }

    /// Result of a fixed action, built from the computer's frame
    pub fn from_message(intent: &ToolCallIntent, message: &ComputerMessage) -> Self {
        let result = &message.tool_result;
        let mut content = Vec::new();

        if let Some(output) = result.output.as_deref().filter(|s| !s.is_empty()) {
            content.push(ResultBlock::Text {
                text: output.to_string(),
            });
        }
        if let Some(error) = result.error.as_deref().filter(|s| !s.is_empty()) {
            content.push(ResultBlock::Text {
                text: format!("Error: {}", error),
            });
        }
        if let Some(image) = result.base64_image.as_deref().filter(|s| !s.is_empty()) {
            content.push(ResultBlock::Image {
                media_type: "image/png".to_string(),
                data: image.to_string(),
            });
        }
        if content.is_empty() {
            content.push(ResultBlock::Text {
                text: "(no output)".to_string(),
            });
        }

        Self {
            call_id: intent.id.clone(),
            tool: intent.name.clone(),
            content,
            is_error: result.is_error(),
        }
    }

    /// Result of an extension tool served by the side channel
    pub fn from_call_result(intent: &ToolCallIntent, result: &CallToolResult) -> Self {
        let mut content: Vec<ResultBlock> = result
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(ResultBlock::Text { text: text.clone() }),
                ContentBlock::Image { data, mime_type } => Some(ResultBlock::Image {
                    media_type: mime_type.clone(),
                    data: data.clone(),
                }),
                ContentBlock::Unsupported => None,
            })
            .collect();
        if content.is_empty() {
            content.push(ResultBlock::Text {
                text: "(no output)".to_string(),
            });
        }

        Self {
            call_id: intent.id.clone(),
            tool: intent.name.clone(),
            content,
            is_error: result.is_error,
        }
    }

    /// Text blocks joined by newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ResultBlock::Text { text } => Some(text.as_str()),
                ResultBlock::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Turn {
    User { text: String },
    Assistant { content: Vec<ContentItem> },
    ToolResults { results: Vec<ToolResultItem> },
}

impl Turn {
    pub fn tool_calls(&self) -> Vec<&ToolCallIntent> {
        match self {
            Turn::Assistant { content } => content
                .iter()
                .filter_map(|item| match item {
                    ContentItem::ToolCall(intent) => Some(intent),
                    ContentItem::Text { .. } => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Ordered turns of one agent run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    turns: Vec<Turn>,
}

impl Conversation {
    /// A conversation seeded with the user's task
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn::User { text: task.into() }],
        }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Copy with every image payload replaced by its size
    pub fn redacted(&self) -> Conversation {
        let turns = self
            .turns
            .iter()
            .map(|turn| match turn {
                Turn::ToolResults { results } => Turn::ToolResults {
                    results: results
                        .iter()
                        .map(|result| ToolResultItem {
                            content: result
                                .content
                                .iter()
                                .map(|block| match block {
                                    ResultBlock::Image { media_type, data } => ResultBlock::Image {
                                        media_type: media_type.clone(),
                                        data: format!("<omitted {} bytes>", data.len()),
                                    },
                                    other => other.clone(),
                                })
                                .collect(),
                            ..result.clone()
                        })
                        .collect(),
                },
                other => other.clone(),
            })
            .collect();
        Conversation { turns }
    }
}
