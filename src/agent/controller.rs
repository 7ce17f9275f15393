//! Agent Controller - orchestration loop between an oracle and a remote computer
//!
//! Each iteration asks the oracle for a turn, resolves its tool-call intents in
//! order (channel first, then side channel, otherwise an error result), and
//! appends the results as one turn. The run ends on the first oracle turn
//! without tool calls.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::conversation::{ContentItem, Conversation, ToolCallIntent, ToolResultItem, Turn};
use crate::action::{validate_call, ValidatedAction};
use crate::computer::{Computer, ComputerError, MachineMetadata, ToolDescriptor};
use crate::mcp::ToolRegistry;
use crate::metrics::{AGENT_ITERATIONS, AGENT_TASKS, AGENT_TOOL_CALLS, ORACLE_CALL_DURATION};
use crate::oracle::{Oracle, OracleError};

/// Configuration for the agent controller
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Model name passed to the oracle
    pub model: String,
    /// Maximum number of oracle turns before giving up
    pub max_iterations: usize,
    /// Custom system prompt (the machine-aware default is used if None)
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: "claude-3-5-sonnet-20241022".to_string(),
            max_iterations: 50,
            system_prompt: None,
            max_tokens: 4096,
        }
    }
}

/// Result of an agent run
#[derive(Debug, Clone)]
pub struct AgentResult {
    /// Text of the final oracle turn
    pub final_response: String,
    /// Number of oracle turns
    pub iterations: usize,
    pub tool_calls_made: usize,
    /// Unique trace ID for this agent run
    pub trace_id: String,
    pub conversation: Conversation,
}

/// Progress of a run, for callers that display it live
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Text(String),
    ToolCall(ToolCallIntent),
    ToolResult(ToolResultItem),
    Done { iterations: usize },
}

/// Error type for agent operations
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("computer channel failed: {0}")]
    Transport(#[from] ComputerError),
    #[error("oracle failed: {0}")]
    Oracle(#[from] OracleError),
    #[error("maximum iterations reached ({0})")]
    MaxIterationsReached(usize),
}

/// Agent Controller orchestrating an oracle and a remote computer
pub struct AgentController {
    oracle: Arc<dyn Oracle>,
    computer: Arc<Computer>,
    registry: Option<Arc<ToolRegistry>>,
    config: AgentConfig,
    events: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl AgentController {
    pub fn new(oracle: Arc<dyn Oracle>, computer: Arc<Computer>, config: AgentConfig) -> Self {
        Self {
            oracle,
            computer,
            registry: None,
            config,
            events: None,
        }
    }

    /// Route unrecognized tool names to a connected side channel
    pub fn with_registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<AgentEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run the agent loop for a given task
    pub async fn run(&self, task: &str) -> Result<AgentResult, AgentError> {
        let trace_id = Uuid::now_v7().to_string();

        let root_span = info_span!(
            "agent_task",
            trace_id = %trace_id,
            oracle = %self.oracle.name(),
            model = %self.config.model,
            otel.name = "agent_task"
        );

        let result = self.run_inner(task, &trace_id).instrument(root_span).await;
        match &result {
            Ok(_) => AGENT_TASKS.with_label_values(&["success"]).inc(),
            Err(AgentError::MaxIterationsReached(_)) => {
                AGENT_TASKS.with_label_values(&["max_iterations"]).inc()
            }
            Err(_) => AGENT_TASKS.with_label_values(&["error"]).inc(),
        }
        result
    }

    async fn run_inner(&self, task: &str, trace_id: &str) -> Result<AgentResult, AgentError> {
        info!(trace_id = %trace_id, task = %task, "Starting agent task");

        let metadata = match self.computer.wait_for_metadata(None).await {
            Ok(metadata) => Some(metadata),
            Err(ComputerError::HandshakeTimeout(timeout)) => {
                warn!(?timeout, "No machine metadata, continuing with placeholder display");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let system_prompt = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| system_preamble(metadata.as_ref()));
        let extension_tools = self.extension_tools().await;

        let mut conversation = Conversation::new(task);
        let mut iterations = 0;
        let mut tool_calls_made = 0;

        loop {
            iterations += 1;

            if iterations > self.config.max_iterations {
                warn!(trace_id = %trace_id, iterations, "Max iterations reached");
                AGENT_ITERATIONS.observe((iterations - 1) as f64);
                return Err(AgentError::MaxIterationsReached(self.config.max_iterations));
            }

            let mut tools: Vec<ToolDescriptor> = self.computer.tools().tools().to_vec();
            tools.extend(extension_tools.iter().cloned());

            let oracle_span = info_span!(
                "oracle_call",
                trace_id = %trace_id,
                iteration = iterations,
                otel.name = "oracle_call"
            );
            let call_start = Instant::now();
            let content = self
                .oracle
                .respond(&system_prompt, &conversation, &tools)
                .instrument(oracle_span)
                .await?;
            let call_secs = call_start.elapsed().as_secs_f64();
            ORACLE_CALL_DURATION
                .with_label_values(&[self.oracle.name()])
                .observe(call_secs);
            info!(
                trace_id = %trace_id,
                iteration = iterations,
                duration_ms = call_secs * 1000.0,
                "Oracle call completed"
            );

            let turn = Turn::Assistant { content };
            let intents: Vec<ToolCallIntent> = turn.tool_calls().into_iter().cloned().collect();
            if let Turn::Assistant { content } = &turn {
                for item in content {
                    if let ContentItem::Text { text } = item {
                        self.emit(AgentEvent::Text(text.clone()));
                    }
                }
            }
            conversation.push(turn);

            if intents.is_empty() {
                info!(trace_id = %trace_id, iterations, tool_calls = tool_calls_made, "Agent task completed");
                AGENT_ITERATIONS.observe(iterations as f64);
                self.emit(AgentEvent::Done { iterations });
                debug!(
                    conversation = %serde_json::to_string(&conversation.redacted()).unwrap_or_default(),
                    "Final conversation"
                );

                return Ok(AgentResult {
                    final_response: final_text(&conversation),
                    iterations,
                    tool_calls_made,
                    trace_id: trace_id.to_string(),
                    conversation,
                });
            }

            let mut results = Vec::with_capacity(intents.len());
            for intent in &intents {
                tool_calls_made += 1;
                self.emit(AgentEvent::ToolCall(intent.clone()));

                let dispatch_span = info_span!(
                    "tool_dispatch",
                    trace_id = %trace_id,
                    tool = %intent.name,
                    call_id = %intent.id,
                    otel.name = "tool_dispatch"
                );
                let result = self.dispatch(intent).instrument(dispatch_span).await?;

                self.emit(AgentEvent::ToolResult(result.clone()));
                results.push(result);
            }
            conversation.push(Turn::ToolResults { results });
        }
    }

    /// Resolve one intent. Only a broken channel is an error; everything else
    /// becomes an error-flagged result for the oracle to read.
    async fn dispatch(&self, intent: &ToolCallIntent) -> Result<ToolResultItem, AgentError> {
        match validate_call(&intent.name, &intent.input) {
            Ok(ValidatedAction::Fixed(action)) => {
                AGENT_TOOL_CALLS.with_label_values(&["channel"]).inc();
                info!(tool = %intent.name, "Executing action");
                match self.computer.execute(action).await {
                    Ok(message) => Ok(ToolResultItem::from_message(intent, &message)),
                    Err(e) if e.is_transport() => Err(e.into()),
                    Err(e) => {
                        warn!(tool = %intent.name, error = %e, "Action failed");
                        Ok(ToolResultItem::error(intent, e.to_string()))
                    }
                }
            }
            Ok(ValidatedAction::Extension(call)) => {
                let registry = match &self.registry {
                    Some(registry) if registry.advertises(&call.tool).await => registry,
                    _ => {
                        AGENT_TOOL_CALLS.with_label_values(&["unrecognized"]).inc();
                        warn!(tool = %call.tool, "Unrecognized tool");
                        return Ok(ToolResultItem::error(
                            intent,
                            format!("unrecognized tool '{}'", call.tool),
                        ));
                    }
                };

                AGENT_TOOL_CALLS.with_label_values(&["side_channel"]).inc();
                info!(tool = %call.tool, "Calling side channel tool");
                match registry.call_tool(&call.tool, call.params).await {
                    Ok(result) => Ok(ToolResultItem::from_call_result(intent, &result)),
                    Err(e) => {
                        warn!(tool = %intent.name, error = %e, "Side channel call failed");
                        Ok(ToolResultItem::error(intent, e.to_string()))
                    }
                }
            }
            Err(e) => {
                AGENT_TOOL_CALLS.with_label_values(&["invalid"]).inc();
                warn!(tool = %intent.name, error = %e, "Rejected tool call");
                Ok(ToolResultItem::error(intent, e.to_string()))
            }
        }
    }

    async fn extension_tools(&self) -> Vec<ToolDescriptor> {
        let Some(registry) = &self.registry else {
            return Vec::new();
        };
        match registry.descriptors().await {
            Ok(tools) => {
                debug!(count = tools.len(), "Side channel tools listed");
                tools
            }
            Err(e) => {
                warn!(error = %e, "Side channel tools unavailable");
                Vec::new()
            }
        }
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn final_text(conversation: &Conversation) -> String {
    match conversation.turns().last() {
        Some(Turn::Assistant { content }) => content
            .iter()
            .filter_map(|item| match item {
                ContentItem::Text { text } => Some(text.as_str()),
                ContentItem::ToolCall(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Default system prompt, filled in with whatever the handshake revealed
pub fn system_preamble(metadata: Option<&MachineMetadata>) -> String {
    let machine = match metadata {
        Some(m) => format!(
            "The machine runs on {} with a {}x{} display{}.",
            m.arch.as_deref().unwrap_or("an unknown architecture"),
            m.display_width,
            m.display_height,
            m.display_num
                .map(|n| format!(" (display :{})", n))
                .unwrap_or_default()
        ),
        None => "The machine's display size is not known yet; take a screenshot first.".to_string(),
    };

    format!(
        r#"You are operating a remote Linux computer through tools.

{machine}

Guidelines:
- Use the bash tool for shell commands and the str_replace_editor tool for files
- Use the computer tool for the mouse, keyboard and screenshots; coordinates are [x, y] pixels
- After a GUI action, take a screenshot to confirm the result before continuing
- If a tool returns an error, read it and adjust instead of repeating the same call
- When the task is complete, respond with your final answer in plain text and no tool calls"#
    )
}
