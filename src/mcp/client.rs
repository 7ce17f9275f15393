//! HTTP JSON-RPC client for the side channel

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use super::protocol::{
    CallToolResult, InitializeResult, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    RemoteTool, ServerInfo, SpawnedServer, PROTOCOL_VERSION,
};
use crate::action::FIXED_TOOLS;
use crate::computer::{MachineMetadata, ToolDescriptor};
use crate::config::{ComputerConfig, ConfigError};
use crate::metrics::SIDE_CHANNEL_CALLS;

const SESSION_HEADER: &str = "mcp-session-id";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the side channel
#[derive(Debug, Error)]
pub enum SideChannelError {
    #[error("side channel is not connected")]
    Unavailable,
    #[error("side channel request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("side channel returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("side channel error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("side channel protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone)]
struct Connection {
    session_id: Option<String>,
    init: InitializeResult,
}

/// Client for dynamically registered tools on the remote machine
pub struct ToolRegistry {
    endpoint: Url,
    token: Option<String>,
    http: reqwest::Client,
    next_id: AtomicI64,
    connection: RwLock<Option<Connection>>,
    tools: RwLock<Vec<RemoteTool>>,
    servers: RwLock<HashMap<String, SpawnedServer>>,
}

impl ToolRegistry {
    pub fn new(endpoint: Url) -> Result<Self, SideChannelError> {
        let http = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            endpoint,
            token: None,
            http,
            next_id: AtomicI64::new(1),
            connection: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            servers: RwLock::new(HashMap::new()),
        })
    }

    /// Registry for the side channel of a computer, authenticated with its key
    pub fn for_computer(
        config: &ComputerConfig,
        metadata: Option<&MachineMetadata>,
    ) -> Result<Self, SideChannelError> {
        let machine_id = metadata.and_then(|m| m.machine_id.as_deref());
        let url = config.side_channel_url(machine_id)?;
        let mut registry = Self::new(url)?;
        registry.token = Some(config.api_key.clone());
        Ok(registry)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    /// Establish the side channel with an `initialize` exchange
    pub async fn connect(&self) -> Result<(), SideChannelError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION")},
        });
        let (value, session_id) = self.rpc("initialize", Some(params), None).await?;
        let init: InitializeResult = decode(value)?;

        info!(
            endpoint = %self.endpoint,
            server = init.server_info.as_ref().map(|s| s.name.as_str()).unwrap_or("unknown"),
            "Side channel connected"
        );
        *self.connection.write().await = Some(Connection { session_id, init });

        if let Err(e) = self.notify("notifications/initialized").await {
            debug!(error = %e, "initialized notification not accepted");
        }
        Ok(())
    }

    /// Fetch the tool list and remember it for [`Self::advertises`]
    pub async fn list_tools(&self) -> Result<Vec<RemoteTool>, SideChannelError> {
        let session = self.session().await?;
        let (value, _) = self.rpc("tools/list", Some(json!({})), session.as_deref()).await?;
        let list: ListToolsResult = decode(value)?;

        *self.tools.write().await = list.tools.clone();
        Ok(list.tools)
    }

    /// Listed tools as descriptors for the oracle, without any fixed tool names
    pub async fn descriptors(&self) -> Result<Vec<ToolDescriptor>, SideChannelError> {
        let tools = self.list_tools().await?;
        Ok(tools
            .into_iter()
            .filter(|tool| {
                let fixed = FIXED_TOOLS.contains(&tool.name.as_str());
                if fixed {
                    warn!(tool = %tool.name, "Side channel tool shadows a fixed tool, skipped");
                }
                !fixed
            })
            .map(|tool| ToolDescriptor::Function {
                description: tool.description.unwrap_or_else(|| tool.name.clone()),
                name: tool.name,
                input_schema: tool.input_schema,
            })
            .collect())
    }

    /// Whether the last fetched tool list contains `name`
    pub async fn advertises(&self, name: &str) -> bool {
        self.tools.read().await.iter().any(|tool| tool.name == name)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
    ) -> Result<CallToolResult, SideChannelError> {
        let session = self.session().await?;
        let params = json!({"name": name, "arguments": arguments});
        let (value, _) = self.rpc("tools/call", Some(params), session.as_deref()).await?;
        let result: CallToolResult = decode(value)?;
        debug!(tool = name, is_error = result.is_error, "Side channel tool returned");
        Ok(result)
    }

    /// Round-trip latency of a `ping`
    pub async fn ping(&self) -> Result<Duration, SideChannelError> {
        let session = self.session().await?;
        let started = Instant::now();
        self.rpc("ping", None, session.as_deref()).await?;
        Ok(started.elapsed())
    }

    /// Capabilities reported by `initialize`
    pub async fn capabilities(&self) -> Result<Value, SideChannelError> {
        let connection = self.connection.read().await;
        let connection = connection.as_ref().ok_or(SideChannelError::Unavailable)?;
        Ok(connection.init.capabilities.clone())
    }

    /// Protocol version and server identity reported by `initialize`
    pub async fn version(&self) -> Result<(Option<String>, Option<ServerInfo>), SideChannelError> {
        let connection = self.connection.read().await;
        let connection = connection.as_ref().ok_or(SideChannelError::Unavailable)?;
        Ok((
            connection.init.protocol_version.clone(),
            connection.init.server_info.clone(),
        ))
    }

    /// Start a tool provider by name; a second call for the same name returns the first's info
    pub async fn spawn_server(
        &self,
        name: &str,
        command: &str,
    ) -> Result<SpawnedServer, SideChannelError> {
        let session = self.session().await?;
        if let Some(existing) = self.servers.read().await.get(name) {
            return Ok(existing.clone());
        }

        let url = self.servers_url()?;
        let mut request = self
            .http
            .post(url.clone())
            .json(&json!({"name": name, "command": command}));
        request = self.decorate(request, session.as_deref());

        let response = request.send().await.inspect_err(|_| {
            SIDE_CHANNEL_CALLS.with_label_values(&["spawn_server", "error"]).inc();
        })?;
        let status = response.status();

        let server = if status.is_success() {
            response.json::<SpawnedServer>().await?
        } else if status == StatusCode::CONFLICT {
            // already running: the body may carry its info, otherwise look it up
            match response.json::<SpawnedServer>().await {
                Ok(server) => server,
                Err(_) => self.fetch_server(&url, name, session.as_deref()).await?,
            }
        } else {
            SIDE_CHANNEL_CALLS.with_label_values(&["spawn_server", "error"]).inc();
            let body = response.text().await.unwrap_or_default();
            return Err(SideChannelError::Http {
                status: status.as_u16(),
                body,
            });
        };

        SIDE_CHANNEL_CALLS.with_label_values(&["spawn_server", "ok"]).inc();
        info!(name, pid = ?server.pid, "Tool provider running");
        self.servers
            .write()
            .await
            .insert(name.to_string(), server.clone());
        Ok(server)
    }

    async fn fetch_server(
        &self,
        servers_url: &Url,
        name: &str,
        session: Option<&str>,
    ) -> Result<SpawnedServer, SideChannelError> {
        let mut url = servers_url.clone();
        url.path_segments_mut()
            .map_err(|_| SideChannelError::Protocol("side channel URL cannot be a base".to_string()))?
            .push(name);
        let response = self.decorate(self.http.get(url), session).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SideChannelError::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }

    fn servers_url(&self) -> Result<Url, SideChannelError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| SideChannelError::Protocol("side channel URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push("servers");
        Ok(url)
    }

    async fn session(&self) -> Result<Option<String>, SideChannelError> {
        let connection = self.connection.read().await;
        let connection = connection.as_ref().ok_or(SideChannelError::Unavailable)?;
        Ok(connection.session_id.clone())
    }

    fn decorate(
        &self,
        request: reqwest::RequestBuilder,
        session: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let mut request = request.header(ACCEPT, "application/json, text/event-stream");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(session) = session {
            request = request.header(SESSION_HEADER, session);
        }
        request
    }

    async fn notify(&self, method: &str) -> Result<(), SideChannelError> {
        let session = self.session().await?;
        let request = self
            .http
            .post(self.endpoint.clone())
            .json(&JsonRpcRequest::notification(method));
        let response = self.decorate(request, session.as_deref()).send().await?;
        if !response.status().is_success() {
            return Err(SideChannelError::Http {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn rpc(
        &self,
        method: &str,
        params: Option<Value>,
        session: Option<&str>,
    ) -> Result<(Value, Option<String>), SideChannelError> {
        let result = self.send_request(method, params, session).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        SIDE_CHANNEL_CALLS.with_label_values(&[method, status]).inc();
        result
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        session: Option<&str>,
    ) -> Result<(Value, Option<String>), SideChannelError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest::new(id, method, params);

        let builder = self.http.post(self.endpoint.clone()).json(&request);
        let response = self.decorate(builder, session).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SideChannelError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| session.map(str::to_string));
        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        let text = response.text().await?;
        let body = if is_stream {
            parse_event_stream(&text)?
        } else {
            serde_json::from_str(&text)
                .map_err(|e| SideChannelError::Protocol(format!("invalid JSON response: {}", e)))?
        };

        Ok((decode_response(body, id)?, session_id))
    }
}

/// Collect the `data:` payloads of an SSE body as a batch
fn parse_event_stream(text: &str) -> Result<Value, SideChannelError> {
    let messages = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| {
            serde_json::from_str::<Value>(data.trim())
                .map_err(|e| SideChannelError::Protocol(format!("invalid event payload: {}", e)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Value::Array(messages))
}

/// Pick the response matching `id` out of a single message or a batch
fn decode_response(body: Value, id: i64) -> Result<Value, SideChannelError> {
    let candidates = match body {
        Value::Array(items) => items,
        other => vec![other],
    };

    for candidate in candidates {
        let Ok(response) = serde_json::from_value::<JsonRpcResponse>(candidate) else {
            continue;
        };
        if response.id.as_ref().and_then(Value::as_i64) != Some(id) {
            continue;
        }
        if let Some(error) = response.error {
            return Err(SideChannelError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        return Ok(response.result.unwrap_or(Value::Null));
    }

    Err(SideChannelError::Protocol(format!(
        "no response for request id {}",
        id
    )))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, SideChannelError> {
    serde_json::from_value(value)
        .map_err(|e| SideChannelError::Protocol(format!("unexpected result shape: {}", e)))
}
