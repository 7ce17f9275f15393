//! Integration tests for the computer channel against an in-process mock VM

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{spawn_mock, MockOptions, API_KEY, TINY_PNG};
use vmpilot::action::Action;
use vmpilot::computer::{Computer, ComputerError, ComputerEvent, ConnectionState};
use vmpilot::config::ComputerConfig;
use vmpilot::logging::{ConversationLog, LogSink};

fn client(url: &str) -> Computer {
    Computer::new(ComputerConfig::new(url, API_KEY))
}

/// Test the basic bash round trip
#[tokio::test]
async fn test_bash_echo() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);
    computer.connect().await.unwrap();

    let result = computer.bash("echo hello world").await.unwrap();
    assert_eq!(result.tool_result.output.as_deref(), Some("hello world"));
    assert!(!result.tool_result.is_error());
    assert_eq!(result.raw_input["tool"], "bash");
    assert_eq!(result.raw_input["params"]["command"], "echo hello world");
}

/// Test that execute opens the channel on demand
#[tokio::test]
async fn test_execute_connects_lazily() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);
    assert_eq!(computer.state(), ConnectionState::Disconnected);

    let result = computer.bash("echo lazy").await.unwrap();
    assert_eq!(result.tool_result.output.as_deref(), Some("lazy"));
    assert_eq!(computer.state(), ConnectionState::Connected);
    assert_eq!(mock.connections.load(std::sync::atomic::Ordering::SeqCst), 1);
}

/// Test mouse movement followed by a cursor query
#[tokio::test]
async fn test_mouse_move_then_cursor_position() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);

    computer.mouse_move(100, 100).await.unwrap();
    let result = computer.cursor_position().await.unwrap();
    assert_eq!(result.tool_result.output.as_deref(), Some("X=100,Y=100"));

    let received = mock.received.lock().await;
    assert_eq!(received[0]["params"]["action"], "mouse_move");
    assert_eq!(received[0]["params"]["coordinate"], serde_json::json!([100, 100]));
    assert_eq!(received[1]["params"]["action"], "cursor_position");
}

#[tokio::test]
async fn test_screenshot_returns_image() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);

    let result = computer.screenshot().await.unwrap();
    assert_eq!(result.tool_result.base64_image.as_deref(), Some(TINY_PNG));
}

/// Test that the welcome frame is promoted once and not returned to a caller
#[tokio::test]
async fn test_handshake_promoted_once_per_connection() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);
    let mut events = computer.subscribe();

    let metadata = computer.wait_for_metadata(None).await.unwrap();
    assert_eq!(metadata.display_width, 1280);
    assert_eq!(metadata.display_height, 800);
    assert_eq!(metadata.machine_id.as_deref(), Some("mock-vm"));
    assert_eq!(computer.tools().version(), 1);

    // a later welcome-shaped payload is an ordinary result
    let result = computer.bash("resend-welcome").await.unwrap();
    assert_eq!(result.tool_result.output.as_deref(), Some("again"));
    assert_eq!(computer.metadata().unwrap().display_width, 1280);
    assert_eq!(computer.tools().version(), 1);

    let session = computer.session().await;
    assert!(session.session_id.is_some());
    assert_eq!(session.metadata.as_ref().map(|m| m.display_height), Some(800));

    let mut ready = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ComputerEvent::MetadataReady(_)) {
            ready += 1;
        }
    }
    assert_eq!(ready, 1);
}

/// Test that a new physical connection performs a new handshake
#[tokio::test]
async fn test_reconnect_gets_fresh_handshake() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);

    computer.wait_for_metadata(None).await.unwrap();
    let first_session = computer.session().await.session_id;
    computer.close().await.unwrap();
    assert_eq!(computer.state(), ConnectionState::Closed);

    computer.connect().await.unwrap();
    computer.wait_for_metadata(None).await.unwrap();
    let second_session = computer.session().await.session_id;

    assert_eq!(mock.connections.load(std::sync::atomic::Ordering::SeqCst), 2);
    assert_eq!(computer.tools().version(), 2);
    assert_ne!(first_session, second_session);
}

/// Test that the tool set advertises the machine's real display after the handshake
#[tokio::test]
async fn test_tools_follow_display() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);
    assert_eq!(computer.tools().version(), 0);

    computer.wait_for_metadata(None).await.unwrap();
    let tools = computer.tools();
    let schema = serde_json::to_value(tools.get("computer").unwrap()).unwrap();
    assert_eq!(schema["display_width_px"], 1280);
    assert_eq!(schema["display_height_px"], 800);
}

#[tokio::test]
async fn test_wait_for_metadata_times_out() {
    let mock = spawn_mock(MockOptions {
        welcome: None,
        ..MockOptions::default()
    })
    .await;
    let computer = client(&mock.url);

    let err = computer
        .wait_for_metadata(Some(Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, ComputerError::HandshakeTimeout(_)));
    // the channel itself stays usable
    assert_eq!(computer.state(), ConnectionState::Connected);
}

/// Test that a wrong key surfaces the HTTP rejection
#[tokio::test]
async fn test_rejected_key() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = Computer::new(ComputerConfig::new(&mock.url, "wrong-key"));

    let err = computer.connect().await.unwrap_err();
    match err {
        ComputerError::Connect { status, .. } => assert_eq!(status, Some(401)),
        other => panic!("expected Connect error, got {other:?}"),
    }
    assert!(computer.bash("echo x").await.unwrap_err().is_transport());
    assert_eq!(computer.state(), ConnectionState::Closed);
}

/// Test that closing the client rejects the in-flight exchange
#[tokio::test]
async fn test_close_rejects_pending() {
    let mock = spawn_mock(MockOptions {
        silent: true,
        ..MockOptions::default()
    })
    .await;
    let computer = Arc::new(client(&mock.url));
    computer.connect().await.unwrap();

    let worker = Arc::clone(&computer);
    let handle = tokio::spawn(async move { worker.bash("echo never").await });
    mock.wait_for_actions(1).await;

    computer.close().await.unwrap();
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, ComputerError::ChannelClosed { .. }));
    assert_eq!(computer.state(), ConnectionState::Closed);
}

/// Test that a remote close frame rejects the in-flight exchange with its code
#[tokio::test]
async fn test_remote_close_rejects_pending() {
    let mock = spawn_mock(MockOptions {
        close_on_first: true,
        ..MockOptions::default()
    })
    .await;
    let computer = client(&mock.url);
    let mut events = computer.subscribe();

    let err = computer.bash("echo hi").await.unwrap_err();
    match err {
        ComputerError::ChannelClosed { code, .. } => assert_eq!(code, Some(1011)),
        other => panic!("expected ChannelClosed, got {other:?}"),
    }

    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(ComputerEvent::Closed { code, .. }) = events.recv().await {
                return code;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(closed, Some(1011));
}

/// Test that concurrent callers are served in arrival order with their own results
#[tokio::test]
async fn test_concurrent_executes_are_fifo() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);
    computer.wait_for_metadata(None).await.unwrap();

    let (a, b, c) = tokio::join!(
        computer.bash("echo one"),
        computer.bash("echo two"),
        computer.bash("echo three"),
    );
    assert_eq!(a.unwrap().tool_result.output.as_deref(), Some("one"));
    assert_eq!(b.unwrap().tool_result.output.as_deref(), Some("two"));
    assert_eq!(c.unwrap().tool_result.output.as_deref(), Some("three"));

    let commands: Vec<String> = mock
        .received
        .lock()
        .await
        .iter()
        .map(|a| a["params"]["command"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(commands, vec!["echo one", "echo two", "echo three"]);
}

/// Test that a caller that gives up does not leave its answer for the next one
#[tokio::test]
async fn test_timed_out_call_does_not_steal_next_answer() {
    let mock = spawn_mock(MockOptions {
        delay: Some(Duration::from_millis(100)),
        ..MockOptions::default()
    })
    .await;
    let computer = client(&mock.url);
    computer.wait_for_metadata(None).await.unwrap();

    let abandoned = tokio::time::timeout(Duration::from_millis(20), computer.bash("echo a")).await;
    assert!(abandoned.is_err());

    let result = computer.bash("echo b").await.unwrap();
    assert_eq!(result.tool_result.output.as_deref(), Some("b"));
    assert_eq!(result.raw_input["params"]["command"], "echo b");
    assert_eq!(mock.received_count().await, 2);
}

/// Test that the answer to a fire-and-forget send is not handed to a later execute
#[tokio::test]
async fn test_send_answer_not_delivered_to_execute() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);
    computer.connect().await.unwrap();

    computer.send(&Action::bash("echo first")).await.unwrap();
    let result = computer.bash("echo second").await.unwrap();
    assert_eq!(result.tool_result.output.as_deref(), Some("second"));

    let commands: Vec<String> = mock
        .received
        .lock()
        .await
        .iter()
        .map(|a| a["params"]["command"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(commands, vec!["echo first", "echo second"]);
}

#[tokio::test]
async fn test_send_without_connection_writes_nothing() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);

    let err = computer.send(&Action::bash("echo x")).await.unwrap_err();
    assert!(matches!(err, ComputerError::NotConnected));
    assert_eq!(mock.received_count().await, 0);
}

/// Test that invalid actions never reach the wire
#[tokio::test]
async fn test_invalid_raw_action_not_sent() {
    let mock = spawn_mock(MockOptions::default()).await;
    let computer = client(&mock.url);
    computer.connect().await.unwrap();

    let err = computer
        .execute_raw(&serde_json::json!({"tool": "computer", "params": {"action": "mouse_move"}}))
        .await
        .unwrap_err();
    assert!(matches!(err, ComputerError::Validation(_)));

    let err = computer.type_text("").await.unwrap_err();
    assert!(matches!(err, ComputerError::Validation(_)));

    computer.bash("echo ok").await.unwrap();
    assert_eq!(mock.received_count().await, 1);
}

/// Test the conversation log with an externalized screenshot and redacted token
#[tokio::test]
async fn test_conversation_log_written() {
    let mock = spawn_mock(MockOptions::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let log = ConversationLog::new(dir.path(), true);
    let sink: Arc<dyn LogSink> = Arc::new(log.clone());
    let computer = Computer::with_sink(ComputerConfig::new(&mock.url, API_KEY), Some(sink));

    computer.wait_for_metadata(None).await.unwrap();
    computer.bash("echo logged").await.unwrap();
    let shot = computer.screenshot().await.unwrap();
    log.flush().await;

    let text = std::fs::read_to_string(log.path()).unwrap();
    let records: Vec<serde_json::Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    // welcome, two sends, two receives
    assert_eq!(records.len(), 5);
    assert!(!text.contains("secret-token"));
    assert!(!text.contains(TINY_PNG));

    let sends = records.iter().filter(|r| r["direction"] == "send").count();
    assert_eq!(sends, 2);

    let png = dir
        .path()
        .join("screenshots")
        .join(format!("{}.png", shot.metadata.message_id));
    assert!(png.exists());
}
