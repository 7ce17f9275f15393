//! vmpilot CLI: run one task on a remote computer
//!
//! ```text
//! VMPILOT_ENDPOINT=wss://host/ws VMPILOT_API_KEY=... ANTHROPIC_API_KEY=... \
//!     vmpilot "open a terminal and print the kernel version"
//! ```

use std::env;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use vmpilot::agent::{AgentConfig, AgentController, AgentEvent};
use vmpilot::computer::Computer;
use vmpilot::config::ComputerConfig;
use vmpilot::mcp::ToolRegistry;
use vmpilot::oracle::{AnthropicOracle, OllamaOracle, Oracle};
use vmpilot::telemetry::{init_tracing, shutdown_tracing, LogFormat};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let otlp = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
    init_tracing("vmpilot", otlp.as_deref(), LogFormat::from_env())?;

    let task = env::args().skip(1).collect::<Vec<_>>().join(" ");
    if task.trim().is_empty() {
        eprintln!("usage: vmpilot <task>");
        std::process::exit(2);
    }

    let config = match env::var("VMPILOT_CONFIG") {
        Ok(path) => ComputerConfig::from_yaml_file(path)?,
        Err(_) => ComputerConfig::from_env()?,
    };
    let agent_config = agent_config_from_env()?;

    let computer = Arc::new(Computer::new(config.clone()));
    computer.connect().await?;
    let metadata = match computer.wait_for_metadata(None).await {
        Ok(metadata) => {
            println!(
                "[VMPILOT] Connected: {}x{} display, arch {}",
                metadata.display_width,
                metadata.display_height,
                metadata.arch.as_deref().unwrap_or("unknown")
            );
            Some(metadata)
        }
        Err(e) => {
            warn!(error = %e, "Continuing without machine metadata");
            None
        }
    };

    let oracle = oracle_from_env(&agent_config)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut controller = AgentController::new(oracle, Arc::clone(&computer), agent_config).with_events(tx);

    if env::var("VMPILOT_SIDE_CHANNEL").as_deref() == Ok("1") {
        let registry = ToolRegistry::for_computer(&config, metadata.as_ref())?;
        match registry.connect().await {
            Ok(()) => controller = controller.with_registry(Arc::new(registry)),
            Err(e) => warn!(error = %e, "Side channel unavailable, continuing without it"),
        }
    }

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::Text(text) => println!("[AGENT] {}", text),
                AgentEvent::ToolCall(call) => println!("[TOOL] {} {}", call.name, call.input),
                AgentEvent::ToolResult(result) => {
                    let marker = if result.is_error { "❌" } else { "✅" };
                    println!("[RESULT] {} {}", marker, first_line(&result.text()));
                }
                AgentEvent::Done { iterations } => {
                    println!("[AGENT] Finished after {} iterations", iterations)
                }
            }
        }
    });

    let outcome = controller.run(&task).await;
    drop(controller);
    let _ = printer.await;

    computer.close().await?;
    shutdown_tracing();

    let result = outcome?;
    println!("--------------------------------------------------");
    println!("{}", result.final_response);
    println!("--------------------------------------------------");
    println!(
        "trace {} | {} iterations | {} tool calls",
        result.trace_id, result.iterations, result.tool_calls_made
    );
    Ok(())
}

fn agent_config_from_env() -> Result<AgentConfig, BoxError> {
    let mut config = AgentConfig::default();
    if let Ok(model) = env::var("VMPILOT_MODEL") {
        config.model = model;
    }
    if let Ok(value) = env::var("VMPILOT_MAX_ITERATIONS") {
        config.max_iterations = value
            .parse()
            .map_err(|_| format!("invalid VMPILOT_MAX_ITERATIONS: '{}'", value))?;
    }
    config.system_prompt = env::var("VMPILOT_SYSTEM_PROMPT").ok();
    Ok(config)
}

fn oracle_from_env(config: &AgentConfig) -> Result<Arc<dyn Oracle>, BoxError> {
    if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
        let mut oracle = AnthropicOracle::new(key, &config.model).with_max_tokens(config.max_tokens);
        if let Ok(base) = env::var("ANTHROPIC_BASE_URL") {
            oracle = oracle.with_base_url(base);
        }
        return Ok(Arc::new(oracle));
    }
    if let Ok(url) = env::var("OLLAMA_URL") {
        let model = env::var("VMPILOT_MODEL").unwrap_or_else(|_| "qwen3".to_string());
        return Ok(Arc::new(OllamaOracle::new(url, model)));
    }
    Err("set ANTHROPIC_API_KEY or OLLAMA_URL to choose an oracle".into())
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}
