//! Agent module for oracle-driven computer use
//!
//! # Architecture
//!
//! ```text
//! User Task → AgentController → Oracle (history + tool set)
//!                  ↓
//!           Tool-call intents, in order
//!                  ↓
//!           validate_call()
//!             ├─ fixed action  → Computer::execute → WebSocket → remote VM
//!             ├─ extension     → ToolRegistry::call_tool → side channel
//!             └─ neither       → error result naming the tool
//!                  ↓
//!           Tool-result turn → Oracle → Loop or Complete
//! ```

pub mod controller;
pub mod conversation;

pub use controller::{system_preamble, AgentConfig, AgentController, AgentError, AgentEvent, AgentResult};
pub use conversation::{ContentItem, Conversation, ResultBlock, ToolCallIntent, ToolResultItem, Turn};
