//! In-process stand-in for a remote computer
//!
//! Accepts WebSocket connections on 127.0.0.1, checks the bearer token,
//! optionally sends a welcome frame, and answers a small set of actions:
//!
//! - `bash` with `echo X` answers `X`; `resend-welcome` answers with a second
//!   welcome payload in `system`
//! - `computer` `mouse_move` updates the cursor, `cursor_position` reports it
//!   as `X=..,Y=..`, `screenshot` returns a tiny base64 PNG
//! - everything else answers with an empty output

#![allow(dead_code)]

pub mod rpc;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

pub const API_KEY: &str = "test-key";

/// PNG signature, enough to exercise screenshot handling
pub const TINY_PNG: &str = "iVBORw0KGgo=";

#[derive(Debug, Clone)]
pub struct MockOptions {
    pub api_key: String,
    /// Payload for `tool_result.system` of the first frame on each connection
    pub welcome: Option<Value>,
    /// Read actions but never answer them
    pub silent: bool,
    /// Answer the first action with a close frame (code 1011)
    pub close_on_first: bool,
    /// Hold every answer back this long
    pub delay: Option<Duration>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            api_key: API_KEY.to_string(),
            welcome: Some(welcome_payload(1280, 800)),
            silent: false,
            close_on_first: false,
            delay: None,
        }
    }
}

pub fn welcome_payload(width: u32, height: u32) -> Value {
    json!({
        "display_width": width,
        "display_height": height,
        "display_num": 1,
        "arch": "x86_64",
        "hostname": "mock-vm",
        "access_token": "secret-token"
    })
}

pub struct MockComputer {
    pub url: String,
    /// Connections that passed authentication
    pub connections: Arc<AtomicUsize>,
    /// Every action frame received, in order
    pub received: Arc<Mutex<Vec<Value>>>,
}

impl MockComputer {
    pub async fn received_count(&self) -> usize {
        self.received.lock().await.len()
    }

    /// Wait until at least `count` actions have arrived
    pub async fn wait_for_actions(&self, count: usize) {
        for _ in 0..200 {
            if self.received_count().await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("mock computer never received {} actions", count);
    }
}

pub async fn spawn_mock(options: MockOptions) -> MockComputer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let received = Arc::new(Mutex::new(Vec::new()));

    let conn_count = Arc::clone(&connections);
    let log = Arc::clone(&received);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let options = options.clone();
            let conn_count = Arc::clone(&conn_count);
            let log = Arc::clone(&log);
            tokio::spawn(async move {
                serve_connection(stream, options, conn_count, log).await;
            });
        }
    });

    MockComputer {
        url: format!("ws://{}/ws", addr),
        connections,
        received,
    }
}

async fn serve_connection(
    stream: TcpStream,
    options: MockOptions,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
) {
    let expected = format!("Bearer {}", options.api_key);
    let check_auth = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let authorized = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some(expected.as_str());
        if authorized {
            Ok(resp)
        } else {
            let mut err = ErrorResponse::new(Some("unauthorized".to_string()));
            *err.status_mut() = StatusCode::UNAUTHORIZED;
            Err(err)
        }
    };

    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, check_auth).await else {
        return;
    };
    connections.fetch_add(1, Ordering::SeqCst);

    let session_id = Uuid::now_v7();
    if let Some(welcome) = &options.welcome {
        let frame = frame(session_id, Value::Null, None, None, Some(welcome.to_string()));
        if ws.send(Message::Text(frame.to_string().into())).await.is_err() {
            return;
        }
    }

    let mut cursor = (0, 0);
    let mut answered = 0usize;

    while let Some(Ok(msg)) = ws.next().await {
        let text = match msg {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let action: Value = match serde_json::from_str(&text) {
            Ok(action) => action,
            Err(_) => continue,
        };
        received.lock().await.push(action.clone());

        if options.silent {
            continue;
        }
        if options.close_on_first && answered == 0 {
            let close = CloseFrame {
                code: CloseCode::Error,
                reason: "internal error".into(),
            };
            let _ = ws.send(Message::Close(Some(close))).await;
            // drain until the client acknowledges
            while let Some(Ok(_)) = ws.next().await {}
            return;
        }

        if let Some(delay) = options.delay {
            tokio::time::sleep(delay).await;
        }
        let reply = answer(session_id, &action, &mut cursor);
        answered += 1;
        if ws.send(Message::Text(reply.to_string().into())).await.is_err() {
            break;
        }
    }
}

fn answer(session_id: Uuid, action: &Value, cursor: &mut (i64, i64)) -> Value {
    let params = &action["params"];
    match action["tool"].as_str() {
        Some("bash") => {
            let command = params["command"].as_str().unwrap_or_default();
            if command == "resend-welcome" {
                let system = welcome_payload(640, 480).to_string();
                return frame(session_id, action.clone(), Some("again".to_string()), None, Some(system));
            }
            let output = command.strip_prefix("echo ").unwrap_or_default().to_string();
            frame(session_id, action.clone(), Some(output), None, None)
        }
        Some("computer") => match params["action"].as_str() {
            Some("mouse_move") => {
                cursor.0 = params["coordinate"][0].as_i64().unwrap_or_default();
                cursor.1 = params["coordinate"][1].as_i64().unwrap_or_default();
                frame(session_id, action.clone(), Some(String::new()), None, None)
            }
            Some("cursor_position") => {
                let output = format!("X={},Y={}", cursor.0, cursor.1);
                frame(session_id, action.clone(), Some(output), None, None)
            }
            Some("screenshot") => {
                let mut reply = frame(session_id, action.clone(), None, None, None);
                reply["tool_result"]["base64_image"] = json!(TINY_PNG);
                reply
            }
            _ => frame(session_id, action.clone(), Some(String::new()), None, None),
        },
        _ => frame(
            session_id,
            action.clone(),
            None,
            Some("unsupported tool".to_string()),
            None,
        ),
    }
}

fn frame(
    session_id: Uuid,
    raw_input: Value,
    output: Option<String>,
    error: Option<String>,
    system: Option<String>,
) -> Value {
    let now = Utc::now().to_rfc3339();
    json!({
        "raw_input": raw_input,
        "tool_result": {
            "output": output,
            "error": error,
            "base64_image": null,
            "system": system,
        },
        "metadata": {
            "session_id": session_id,
            "message_id": Uuid::now_v7(),
            "request_timestamp": now,
            "response_timestamp": now,
        }
    })
}
