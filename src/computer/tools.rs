//! Tool descriptors advertised to an oracle
//!
//! The set is versioned and replaced as a whole: the handshake publishes a
//! new [`ToolSet`] carrying the real display size, readers hold an `Arc` to
//! whichever version they fetched.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::action::{BASH_TOOL, COMPUTER_TOOL, EDITOR_TOOL};

/// Display size advertised before the welcome frame arrives
pub const PLACEHOLDER_DISPLAY: (u32, u32) = (1024, 768);

/// A tool the oracle may call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolDescriptor {
    Bash,
    Computer {
        display_width_px: u32,
        display_height_px: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_number: Option<u32>,
    },
    Editor,
    /// A dynamically registered tool served over the side channel
    Function {
        name: String,
        description: String,
        input_schema: Value,
    },
}

impl ToolDescriptor {
    pub fn computer(width: u32, height: u32, display_number: Option<u32>) -> Self {
        ToolDescriptor::Computer {
            display_width_px: width,
            display_height_px: height,
            display_number,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ToolDescriptor::Bash => BASH_TOOL,
            ToolDescriptor::Computer { .. } => COMPUTER_TOOL,
            ToolDescriptor::Editor => EDITOR_TOOL,
            ToolDescriptor::Function { name, .. } => name,
        }
    }

    pub fn is_extension(&self) -> bool {
        matches!(self, ToolDescriptor::Function { .. })
    }

    pub fn description(&self) -> String {
        match self {
            ToolDescriptor::Bash => {
                "Run a shell command on the remote computer and return its output.".to_string()
            }
            ToolDescriptor::Computer {
                display_width_px,
                display_height_px,
                ..
            } => format!(
                "Control the mouse and keyboard of the remote computer and take screenshots. \
                 The display is {}x{} pixels; coordinates are [x, y] integers.",
                display_width_px, display_height_px
            ),
            ToolDescriptor::Editor => {
                "View, create and edit files on the remote computer.".to_string()
            }
            ToolDescriptor::Function { description, .. } => description.clone(),
        }
    }

    /// JSON Schema of the tool's params, for oracles that only speak function calling
    pub fn input_schema(&self) -> Value {
        match self {
            ToolDescriptor::Bash => json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The shell command to run"}
                },
                "required": ["command"]
            }),
            ToolDescriptor::Computer { .. } => json!({
                "type": "object",
                "properties": {
                    "action": {
                        "type": "string",
                        "enum": [
                            "mouse_move", "left_click_drag", "cursor_position", "left_click",
                            "right_click", "middle_click", "double_click", "key", "type",
                            "screenshot"
                        ]
                    },
                    "coordinate": {
                        "type": "array",
                        "items": {"type": "integer"},
                        "minItems": 2,
                        "maxItems": 2
                    },
                    "text": {"type": "string"}
                },
                "required": ["action"]
            }),
            ToolDescriptor::Editor => json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "enum": ["view", "create", "str_replace", "insert", "undo_edit"]
                    },
                    "path": {"type": "string"},
                    "file_text": {"type": "string"},
                    "old_str": {"type": "string"},
                    "new_str": {"type": "string"},
                    "insert_line": {"type": "integer"},
                    "view_range": {"type": "array", "items": {"type": "integer"}}
                },
                "required": ["command", "path"]
            }),
            ToolDescriptor::Function { input_schema, .. } => input_schema.clone(),
        }
    }
}

/// Versioned, immutable set of tool descriptors
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSet {
    version: u64,
    tools: Vec<ToolDescriptor>,
}

impl Default for ToolSet {
    fn default() -> Self {
        let (width, height) = PLACEHOLDER_DISPLAY;
        Self {
            version: 0,
            tools: vec![
                ToolDescriptor::Bash,
                ToolDescriptor::computer(width, height, None),
                ToolDescriptor::Editor,
            ],
        }
    }
}

impl ToolSet {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    /// Copy of this set with the computer descriptor resized, one version later
    pub fn with_display(&self, width: u32, height: u32, display_number: Option<u32>) -> ToolSet {
        let tools = self
            .tools
            .iter()
            .map(|tool| match tool {
                ToolDescriptor::Computer { .. } => {
                    ToolDescriptor::computer(width, height, display_number)
                }
                other => other.clone(),
            })
            .collect();

        ToolSet {
            version: self.version + 1,
            tools,
        }
    }
}
