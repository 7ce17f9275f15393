//! Prometheus metrics for the channel, side channel and agent loop
//!
//! Everything registers against the default registry on first use.
//! [`gather_text`] renders it for whatever exposition endpoint the host runs.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, register_histogram_vec, Counter,
    CounterVec, Encoder, Histogram, HistogramVec, TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Channel
    // ─────────────────────────────────────────────────────────────────────────────

    /// Action frames written to the channel.
    ///
    /// Labels:
    /// - tool: "bash", "computer" or "str_replace_editor"
    pub static ref ACTIONS_SENT: CounterVec = register_counter_vec!(
        "vmpilot_actions_sent_total",
        "Action frames sent to the remote computer",
        &["tool"]
    ).expect("failed to register ACTIONS_SENT metric");

    /// Text frames read from the channel, including welcome frames.
    pub static ref FRAMES_RECEIVED: Counter = register_counter!(
        "vmpilot_frames_received_total",
        "Frames received from the remote computer"
    ).expect("failed to register FRAMES_RECEIVED metric");

    /// Round trip of one execute call, send to matched response.
    pub static ref EXECUTE_DURATION: HistogramVec = register_histogram_vec!(
        "vmpilot_execute_duration_seconds",
        "Time from sending an action to receiving its result",
        &["tool"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).expect("failed to register EXECUTE_DURATION metric");

    /// Execute calls that ended in an error.
    ///
    /// Labels:
    /// - kind: short error kind, e.g. "closed", "validation", "connect"
    pub static ref EXECUTE_ERRORS: CounterVec = register_counter_vec!(
        "vmpilot_execute_errors_total",
        "Execute calls that failed, by error kind",
        &["kind"]
    ).expect("failed to register EXECUTE_ERRORS metric");

    pub static ref HANDSHAKES: Counter = register_counter!(
        "vmpilot_handshakes_total",
        "Welcome payloads promoted into session state"
    ).expect("failed to register HANDSHAKES metric");

    /// Labels:
    /// - reason: "remote", "client", "error" or "eof"
    pub static ref CHANNEL_CLOSED: CounterVec = register_counter_vec!(
        "vmpilot_channel_closed_total",
        "Channel closures by cause",
        &["reason"]
    ).expect("failed to register CHANNEL_CLOSED metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Side channel
    // ─────────────────────────────────────────────────────────────────────────────

    /// Labels:
    /// - method: JSON-RPC method or "spawn_server"
    /// - status: "ok" or "error"
    pub static ref SIDE_CHANNEL_CALLS: CounterVec = register_counter_vec!(
        "vmpilot_side_channel_calls_total",
        "Requests made over the side channel",
        &["method", "status"]
    ).expect("failed to register SIDE_CHANNEL_CALLS metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Agent
    // ─────────────────────────────────────────────────────────────────────────────

    /// Labels:
    /// - status: "success", "max_iterations" or "error"
    pub static ref AGENT_TASKS: CounterVec = register_counter_vec!(
        "vmpilot_agent_tasks_total",
        "Agent runs by outcome",
        &["status"]
    ).expect("failed to register AGENT_TASKS metric");

    pub static ref AGENT_ITERATIONS: Histogram = register_histogram!(
        "vmpilot_agent_iterations",
        "Oracle turns per agent run",
        vec![1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 100.0]
    ).expect("failed to register AGENT_ITERATIONS metric");

    /// Labels:
    /// - route: "channel", "side_channel" or "unrecognized"
    pub static ref AGENT_TOOL_CALLS: CounterVec = register_counter_vec!(
        "vmpilot_agent_tool_calls_total",
        "Tool-call intents dispatched by the agent",
        &["route"]
    ).expect("failed to register AGENT_TOOL_CALLS metric");

    /// Labels:
    /// - oracle: oracle implementation name
    pub static ref ORACLE_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "vmpilot_oracle_call_duration_seconds",
        "Latency of one oracle turn",
        &["oracle"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).expect("failed to register ORACLE_CALL_DURATION metric");
}

/// Render the default registry in the Prometheus text format
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
