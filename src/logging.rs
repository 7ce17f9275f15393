//! Conversation log
//!
//! Every sent action and received frame is appended to a JSON Lines file.
//! Screenshots are decoded and written next to it as PNG files, and the log
//! record keeps only the relative path. Writes happen on a background task
//! fed through an unbounded channel, so logging never blocks the transport.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::action::Action;
use crate::computer::ComputerMessage;

const SCREENSHOT_DIR: &str = "screenshots";

/// Receiver of both directions of channel traffic
pub trait LogSink: Send + Sync {
    fn log_send(&self, action: &Action);
    fn log_receive(&self, message: &ComputerMessage);
}

enum LogCommand {
    Sent {
        at: DateTime<Utc>,
        action: Action,
    },
    Received {
        at: DateTime<Utc>,
        message: Box<ComputerMessage>,
    },
    Flush(oneshot::Sender<()>),
}

/// JSON Lines log with externalized screenshots
#[derive(Clone)]
pub struct ConversationLog {
    tx: mpsc::UnboundedSender<LogCommand>,
    path: PathBuf,
}

impl ConversationLog {
    /// Start a new log file under `dir`. Must be called inside a tokio runtime.
    pub fn new(dir: impl Into<PathBuf>, screenshots: bool) -> Self {
        let dir = dir.into();
        let path = dir.join(format!(
            "conversation-{}-{}.jsonl",
            Utc::now().format("%Y%m%dT%H%M%S"),
            Uuid::now_v7().simple()
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(dir, path.clone(), screenshots, rx));

        Self { tx, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every entry queued before this call is on disk
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl LogSink for ConversationLog {
    fn log_send(&self, action: &Action) {
        let _ = self.tx.send(LogCommand::Sent {
            at: Utc::now(),
            action: action.clone(),
        });
    }

    fn log_receive(&self, message: &ComputerMessage) {
        let _ = self.tx.send(LogCommand::Received {
            at: Utc::now(),
            message: Box::new(message.clone()),
        });
    }
}

async fn run_writer(
    dir: PathBuf,
    path: PathBuf,
    screenshots: bool,
    mut rx: mpsc::UnboundedReceiver<LogCommand>,
) {
    let mut file: Option<tokio::fs::File> = None;

    while let Some(cmd) = rx.recv().await {
        let entry = match cmd {
            LogCommand::Flush(done) => {
                if let Some(file) = file.as_mut() {
                    let _ = file.flush().await;
                }
                let _ = done.send(());
                continue;
            }
            LogCommand::Sent { at, action } => json!({
                "timestamp": at,
                "direction": "send",
                "action": action,
            }),
            LogCommand::Received { at, message } => {
                let record = receive_record(&dir, screenshots, *message).await;
                json!({
                    "timestamp": at,
                    "direction": "receive",
                    "message": record,
                })
            }
        };

        if file.is_none() {
            file = open_log(&path).await;
        }
        let Some(out) = file.as_mut() else { continue };

        let line = serde_json::to_string(&entry).unwrap_or_else(|_| "{}".to_string());
        if let Err(err) = out.write_all(format!("{}\n", line).as_bytes()).await {
            tracing::warn!(error = %err, path = %path.display(), "Failed to write conversation log");
        }
    }
}

async fn open_log(path: &Path) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => Some(file),
        Err(err) => {
            tracing::warn!(error = %err, path = %path.display(), "Failed to open conversation log");
            None
        }
    }
}

/// Log form of a frame: screenshot externalized, access token masked
async fn receive_record(dir: &Path, screenshots: bool, mut message: ComputerMessage) -> Value {
    let image = message.tool_result.base64_image.take();
    if let Some(system) = message.tool_result.system.as_mut() {
        *system = mask_access_token(system);
    }

    let mut record = serde_json::to_value(&message).unwrap_or(Value::Null);
    let Some(image) = image else { return record };

    let reference = if screenshots {
        let name = format!("{}.png", message.metadata.message_id);
        match save_screenshot(dir, &name, &image).await {
            Ok(()) => json!(format!("{}/{}", SCREENSHOT_DIR, name)),
            Err(reason) => {
                tracing::warn!(message_id = %message.metadata.message_id, %reason, "Screenshot not saved");
                json!(format!("<unsaved screenshot: {}>", reason))
            }
        }
    } else {
        json!(format!("<omitted {} bytes>", image.len()))
    };

    if let Some(result) = record.get_mut("tool_result").and_then(Value::as_object_mut) {
        result.insert("base64_image".to_string(), Value::Null);
        result.insert("screenshot".to_string(), reference);
    }
    record
}

async fn save_screenshot(dir: &Path, name: &str, image: &str) -> Result<(), String> {
    let bytes = STANDARD.decode(image.trim()).map_err(|e| e.to_string())?;
    let screenshot_dir = dir.join(SCREENSHOT_DIR);
    tokio::fs::create_dir_all(&screenshot_dir)
        .await
        .map_err(|e| e.to_string())?;
    tokio::fs::write(screenshot_dir.join(name), bytes)
        .await
        .map_err(|e| e.to_string())
}

fn mask_access_token(system: &str) -> String {
    let Ok(mut value) = serde_json::from_str::<Value>(system) else {
        return system.to_string();
    };
    match value.get_mut("access_token") {
        Some(token) if !token.is_null() => {
            *token = json!("<redacted>");
            value.to_string()
        }
        _ => system.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computer::{MessageMetadata, ToolResult};

    fn message(image: Option<&str>, system: Option<&str>) -> ComputerMessage {
        ComputerMessage {
            raw_input: json!({"tool": "computer", "params": {"action": "screenshot"}}),
            tool_result: ToolResult {
                output: None,
                error: None,
                base64_image: image.map(str::to_string),
                system: system.map(str::to_string),
            },
            metadata: MessageMetadata {
                session_id: Uuid::now_v7(),
                message_id: Uuid::now_v7(),
                request_timestamp: Utc::now(),
                response_timestamp: Utc::now(),
            },
        }
    }

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_both_directions_logged_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path(), true);

        log.log_send(&Action::bash("echo hi"));
        log.log_receive(&message(None, None));
        log.flush().await;

        let lines = read_lines(log.path());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["direction"], "send");
        assert_eq!(lines[0]["action"]["params"]["command"], "echo hi");
        assert_eq!(lines[1]["direction"], "receive");
    }

    #[tokio::test]
    async fn test_screenshot_externalized() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path(), true);

        let frame = message(Some("aGVsbG8="), None);
        let message_id = frame.metadata.message_id;
        log.log_receive(&frame);
        log.flush().await;

        let lines = read_lines(log.path());
        let result = &lines[0]["message"]["tool_result"];
        let reference = format!("screenshots/{}.png", message_id);
        assert!(result["base64_image"].is_null());
        assert_eq!(result["screenshot"], reference.as_str());

        let saved = std::fs::read(dir.path().join(&reference)).unwrap();
        assert_eq!(saved, b"hello");
    }

    #[tokio::test]
    async fn test_screenshot_omitted_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path(), false);

        log.log_receive(&message(Some("aGVsbG8="), None));
        log.flush().await;

        let lines = read_lines(log.path());
        let result = &lines[0]["message"]["tool_result"];
        assert_eq!(result["screenshot"], "<omitted 8 bytes>");
        assert!(!dir.path().join(SCREENSHOT_DIR).exists());
    }

    #[tokio::test]
    async fn test_access_token_masked() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path(), true);

        let system = r#"{"display_width":1024,"display_height":768,"access_token":"s3cret"}"#;
        log.log_receive(&message(None, Some(system)));
        log.flush().await;

        let text = std::fs::read_to_string(log.path()).unwrap();
        assert!(!text.contains("s3cret"));
        assert!(text.contains("<redacted>"));
    }
}
