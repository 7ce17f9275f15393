//! Side channel for dynamically registered tools
//!
//! A second connection, independent of the computer channel, that speaks
//! JSON-RPC 2.0 over HTTP: `initialize`, `tools/list`, `tools/call` and
//! `ping`, plus a REST endpoint for starting tool providers by name.
//! Tool names the action model does not recognize are routed here.

mod client;
pub mod protocol;

pub use client::{SideChannelError, ToolRegistry};
pub use protocol::{CallToolResult, ContentBlock, RemoteTool, ServerInfo, SpawnedServer};
