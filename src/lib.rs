//! vmpilot - client SDK for driving a remote computer over a WebSocket
//!
//! A remote "computer" is a sandboxed VM exposing bash, mouse and keyboard,
//! screenshots and file editing. This crate validates actions, carries them
//! over a single authenticated channel, correlates each result with its
//! request, and can hand the whole job to an oracle-driven tool-use loop.
//!
//! # Modules
//!
//! - `action` - Action model and two-stage validation
//! - `computer` - Channel, handshake and session state
//! - `mcp` - Side channel for dynamically registered tools
//! - `oracle` - Pluggable reasoning backends (Anthropic, Ollama)
//! - `agent` - Orchestration loop and conversation state
//! - `logging` - JSON Lines conversation log with externalized screenshots
//! - `config` - Client configuration from env or YAML
//! - `metrics` - Prometheus metrics
//! - `telemetry` - Tracing and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use vmpilot::{Computer, ComputerConfig};
//!
//! let computer = Computer::new(ComputerConfig::new("wss://host/ws", api_key));
//! let result = computer.bash("echo hello world").await?;
//! assert_eq!(result.tool_result.output.as_deref(), Some("hello world"));
//! ```

pub mod action;
pub mod agent;
pub mod computer;
pub mod config;
pub mod logging;
pub mod mcp;
pub mod metrics;
pub mod oracle;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use action::{validate, Action, ComputerAction, Coordinate, EditorCommand, ValidationError};
pub use agent::{AgentConfig, AgentController, AgentError, AgentEvent, AgentResult};
pub use computer::{Computer, ComputerError, ComputerEvent, ComputerMessage, ConnectionState};
pub use config::ComputerConfig;
pub use mcp::{SideChannelError, ToolRegistry};
pub use oracle::{AnthropicOracle, OllamaOracle, Oracle};
