//! Action types carried over the computer channel
//!
//! An [`Action`] serializes to the exact frame body the remote computer expects:
//!
//! ```text
//! {"tool": "bash", "params": {"command": "ls -la"}}
//! {"tool": "computer", "params": {"action": "mouse_move", "coordinate": [100, 200]}}
//! {"tool": "str_replace_editor", "params": {"command": "view", "path": "/etc/hosts"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const BASH_TOOL: &str = "bash";
pub const COMPUTER_TOOL: &str = "computer";
pub const EDITOR_TOOL: &str = "str_replace_editor";

/// Tool names owned by the fixed action union. Extension calls may never use these.
pub const FIXED_TOOLS: [&str; 3] = [BASH_TOOL, COMPUTER_TOOL, EDITOR_TOOL];

/// A command for the remote computer, discriminated by its `tool` field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "params", rename_all = "snake_case")]
pub enum Action {
    Bash(BashParams),
    Computer(ComputerAction),
    StrReplaceEditor(EditorCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BashParams {
    pub command: String,
}

/// Screen position as an `[x, y]` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinate(pub i32, pub i32);

/// Pointer, keyboard and screenshot primitives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ComputerAction {
    MouseMove { coordinate: Coordinate },
    LeftClickDrag { coordinate: Coordinate },
    CursorPosition,
    LeftClick,
    RightClick,
    MiddleClick,
    DoubleClick,
    Key { text: String },
    Type { text: String },
    Screenshot,
}

/// File viewing and editing primitives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum EditorCommand {
    View {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        view_range: Option<[i64; 2]>,
    },
    Create {
        path: String,
        file_text: String,
    },
    StrReplace {
        path: String,
        old_str: String,
        new_str: String,
    },
    Insert {
        path: String,
        insert_line: u64,
        new_str: String,
    },
    UndoEdit {
        path: String,
    },
}

impl Action {
    pub fn bash(command: impl Into<String>) -> Self {
        Action::Bash(BashParams {
            command: command.into(),
        })
    }

    pub fn computer(action: ComputerAction) -> Self {
        Action::Computer(action)
    }

    pub fn editor(command: EditorCommand) -> Self {
        Action::StrReplaceEditor(command)
    }

    /// Wire name of the tool this action targets
    pub fn tool_name(&self) -> &'static str {
        match self {
            Action::Bash(_) => BASH_TOOL,
            Action::Computer(_) => COMPUTER_TOOL,
            Action::StrReplaceEditor(_) => EDITOR_TOOL,
        }
    }

    /// Field-level constraints that serde's shape checks cannot express
    pub(crate) fn check(&self) -> Result<(), String> {
        match self {
            Action::Bash(params) => {
                if params.command.is_empty() {
                    return Err("command must not be empty".to_string());
                }
            }
            Action::Computer(ComputerAction::Key { text })
            | Action::Computer(ComputerAction::Type { text }) => {
                if text.is_empty() {
                    return Err("text must not be empty".to_string());
                }
            }
            Action::Computer(_) => {}
            Action::StrReplaceEditor(command) => {
                if command.path().is_empty() {
                    return Err("path must not be empty".to_string());
                }
                if let EditorCommand::StrReplace { old_str, .. } = command {
                    if old_str.is_empty() {
                        return Err("old_str must not be empty".to_string());
                    }
                }
            }
        }
        Ok(())
    }
}

impl EditorCommand {
    pub fn path(&self) -> &str {
        match self {
            EditorCommand::View { path, .. }
            | EditorCommand::Create { path, .. }
            | EditorCommand::StrReplace { path, .. }
            | EditorCommand::Insert { path, .. }
            | EditorCommand::UndoEdit { path } => path,
        }
    }
}

/// A call to a tool outside the fixed union, routed to the side channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionCall {
    pub tool: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

/// Outcome of validation: either a fixed action or an extension call
#[derive(Debug, Clone, PartialEq)]
pub enum ValidatedAction {
    Fixed(Action),
    Extension(ExtensionCall),
}

impl ValidatedAction {
    pub fn tool_name(&self) -> &str {
        match self {
            ValidatedAction::Fixed(action) => action.tool_name(),
            ValidatedAction::Extension(call) => &call.tool,
        }
    }
}
