//! Remote computer client
//!
//! A [`Computer`] owns one WebSocket channel to a remote VM. The channel has
//! no request ids, so correlation is positional: [`Computer::execute`]
//! registers a single pending exchange, sends the action, and the next frame
//! the reader task sees resolves it. Concurrent callers queue on a fair mutex
//! and are served in arrival order.
//!
//! A caller that stops waiting (a dropped future, a timeout) leaves its
//! exchange behind. If its frame never reached the wire the next caller
//! discards it; otherwise the next caller waits until the abandoned answer
//! has been consumed, so it never receives someone else's result.
//!
//! The first frame of every physical connection is a welcome frame whose
//! `tool_result.system` carries the machine's capabilities. The reader task
//! promotes it into the session exactly once and does not hand it to the
//! pending exchange.

mod error;
mod handshake;
mod message;
mod session;
mod tools;

pub use error::ComputerError;
pub use handshake::{parse_metadata, MachineMetadata};
pub use message::{ComputerMessage, MessageMetadata, ToolResult};
pub use session::{ConnectionState, Session};
pub use tools::{ToolDescriptor, ToolSet, PLACEHOLDER_DISPLAY};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::action::{validate, Action, ComputerAction, Coordinate, ValidatedAction, ValidationError};
use crate::config::{ComputerConfig, MachineIdField};
use crate::logging::{ConversationLog, LogSink};
use crate::metrics::{
    ACTIONS_SENT, CHANNEL_CLOSED, EXECUTE_DURATION, EXECUTE_ERRORS, FRAMES_RECEIVED, HANDSHAKES,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

type Responder = oneshot::Sender<Result<ComputerMessage, ComputerError>>;

const EVENT_CAPACITY: usize = 64;

/// Notifications about the channel, for observers that are not awaiting a result
#[derive(Debug, Clone)]
pub enum ComputerEvent {
    StateChanged(ConnectionState),
    MetadataReady(MachineMetadata),
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

struct PendingExchange {
    tool: &'static str,
    responder: Responder,
    /// Set once the action frame may have reached the wire
    written: bool,
}

impl PendingExchange {
    fn abandoned(&self) -> bool {
        self.responder.is_closed()
    }
}

/// State shared between the caller-facing handle and the reader task
struct Shared {
    state: watch::Sender<ConnectionState>,
    metadata: watch::Sender<Option<MachineMetadata>>,
    tools: watch::Sender<Arc<ToolSet>>,
    session: RwLock<Session>,
    pending: SyncMutex<Option<PendingExchange>>,
    slot_freed: Notify,
    events: broadcast::Sender<ComputerEvent>,
    generation: AtomicU64,
    machine_id_field: MachineIdField,
    log: Option<Arc<dyn LogSink>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "Connection state changed");
            let _ = self.events.send(ComputerEvent::StateChanged(state));
        }
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    // never held across an await
    fn slot(&self) -> MutexGuard<'_, Option<PendingExchange>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the pending slot
    ///
    /// A live exchange in the slot is an error. An abandoned one is dropped if
    /// its frame was never written, and waited out otherwise.
    async fn register_pending(&self, tool: &'static str) -> Result<PendingHandle, ComputerError> {
        loop {
            let freed = self.slot_freed.notified();
            {
                let mut slot = self.slot();
                let wait = match slot.as_ref() {
                    Some(existing) if !existing.abandoned() => {
                        return Err(ComputerError::ExchangeInFlight(existing.tool.to_string()));
                    }
                    Some(existing) if existing.written => {
                        debug!(tool = existing.tool, "Waiting for the answer to an abandoned exchange");
                        true
                    }
                    Some(existing) => {
                        debug!(tool = existing.tool, "Discarding abandoned exchange that was never sent");
                        false
                    }
                    None => false,
                };
                if !wait {
                    let (responder, rx) = oneshot::channel();
                    *slot = Some(PendingExchange {
                        tool,
                        responder,
                        written: false,
                    });
                    return Ok(PendingHandle { rx });
                }
            }
            freed.await;
        }
    }

    fn mark_written(&self) {
        if let Some(pending) = self.slot().as_mut() {
            pending.written = true;
        }
    }

    fn take_pending(&self) -> Option<PendingExchange> {
        let taken = self.slot().take();
        if taken.is_some() {
            self.slot_freed.notify_waiters();
        }
        taken
    }

    fn fail_pending(&self, error: ComputerError) {
        if let Some(pending) = self.take_pending() {
            debug!(tool = pending.tool, error = %error, "Rejecting pending exchange");
            let _ = pending.responder.send(Err(error));
        }
    }

    async fn handle_text(&self, text: &str) {
        FRAMES_RECEIVED.inc();

        let message: ComputerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Inbound frame failed validation");
                self.fail_pending(ComputerError::InvalidFrame(e.to_string()));
                return;
            }
        };

        if let Some(log) = &self.log {
            log.log_receive(&message);
        }
        self.session
            .write()
            .await
            .touch(message.metadata.response_timestamp);

        if self.promote_handshake(&message).await {
            return;
        }

        match self.take_pending() {
            Some(pending) => {
                let message_id = message.metadata.message_id;
                match pending.responder.send(Ok(message)) {
                    Ok(()) => debug!(tool = pending.tool, %message_id, "Frame resolved pending exchange"),
                    Err(_) => debug!(tool = pending.tool, %message_id, "Answer to abandoned exchange discarded"),
                }
            }
            None => {
                debug!(message_id = %message.metadata.message_id, "Unsolicited frame dropped");
            }
        }
    }

    /// Store welcome metadata if this is the first welcome frame on the connection
    async fn promote_handshake(&self, message: &ComputerMessage) -> bool {
        let Some(system) = message.tool_result.system.as_deref() else {
            return false;
        };
        let Some(metadata) = parse_metadata(system, self.machine_id_field) else {
            return false;
        };
        if self.metadata.borrow().is_some() {
            debug!("Repeated welcome payload ignored");
            return false;
        }

        {
            let mut session = self.session.write().await;
            session.session_id = Some(message.metadata.session_id);
            session.metadata = Some(metadata.clone());
        }
        self.tools.send_modify(|tools| {
            *tools = Arc::new(tools.with_display(
                metadata.display_width,
                metadata.display_height,
                metadata.display_num,
            ));
        });
        self.metadata.send_replace(Some(metadata.clone()));

        HANDSHAKES.inc();
        info!(
            session_id = %message.metadata.session_id,
            width = metadata.display_width,
            height = metadata.display_height,
            arch = metadata.arch.as_deref().unwrap_or("unknown"),
            "Machine metadata received"
        );
        let _ = self.events.send(ComputerEvent::MetadataReady(metadata));
        true
    }

    /// Tear down after the reader stops, unless a newer connection replaced this one
    async fn finish_connection(&self, generation: u64, code: Option<u16>, reason: String, cause: &str) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        // state first, so an execute that registers concurrently sees the close
        self.set_state(ConnectionState::Closed);
        self.session.write().await.state = ConnectionState::Closed;
        self.fail_pending(ComputerError::ChannelClosed {
            code,
            reason: reason.clone(),
        });

        CHANNEL_CLOSED.with_label_values(&[cause]).inc();
        info!(code = ?code, reason = %reason, "Channel closed");
        let _ = self.events.send(ComputerEvent::Closed { code, reason });
    }
}

#[derive(Debug)]
struct PendingHandle {
    rx: oneshot::Receiver<Result<ComputerMessage, ComputerError>>,
}

/// Client for one remote computer
pub struct Computer {
    config: ComputerConfig,
    shared: Arc<Shared>,
    writer: Mutex<Option<WsWriter>>,
    /// Serializes execute calls; tokio's mutex is fair, so waiters are FIFO
    queue: Mutex<()>,
    connect_lock: Mutex<()>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl Computer {
    /// Create a client. Nothing is opened until the first operation needs it.
    pub fn new(config: ComputerConfig) -> Self {
        let log: Option<Arc<dyn LogSink>> = if config.log_enabled {
            match tokio::runtime::Handle::try_current() {
                Ok(_) => Some(Arc::new(ConversationLog::new(
                    config.log_dir.clone(),
                    config.screenshot_log_enabled,
                ))),
                Err(_) => {
                    warn!("Conversation log requested outside a tokio runtime, logging disabled");
                    None
                }
            }
        } else {
            None
        };
        Self::with_sink(config, log)
    }

    /// Create a client with a caller-supplied log sink
    pub fn with_sink(config: ComputerConfig, log: Option<Arc<dyn LogSink>>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (metadata, _) = watch::channel(None);
        let (tools, _) = watch::channel(Arc::new(ToolSet::default()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let shared = Shared {
            state,
            metadata,
            tools,
            session: RwLock::new(Session::new()),
            pending: SyncMutex::new(None),
            slot_freed: Notify::new(),
            events,
            generation: AtomicU64::new(0),
            machine_id_field: config.machine_id_field,
            log,
        };

        Self {
            config,
            shared: Arc::new(shared),
            writer: Mutex::new(None),
            queue: Mutex::new(()),
            connect_lock: Mutex::new(()),
            recv_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ComputerConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.current_state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ComputerEvent> {
        self.shared.events.subscribe()
    }

    /// Machine metadata of the current connection, if the handshake has happened
    pub fn metadata(&self) -> Option<MachineMetadata> {
        self.shared.metadata.borrow().clone()
    }

    /// Current version of the advertised tool set
    pub fn tools(&self) -> Arc<ToolSet> {
        Arc::clone(&*self.shared.tools.borrow())
    }

    pub async fn session(&self) -> Session {
        let mut session = self.shared.session.read().await.clone();
        session.state = self.state();
        session
    }

    /// Open the channel. Returns immediately if it is already open.
    pub async fn connect(&self) -> Result<(), ComputerError> {
        let _guard = self.connect_lock.lock().await;
        if self.state() == ConnectionState::Connected {
            return Ok(());
        }

        let url = self.config.validate()?;
        let endpoint = url.to_string();
        self.shared.set_state(ConnectionState::Connecting);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ComputerError::InvalidUrl(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|_| ComputerError::InvalidUrl("api key is not a valid header value".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let timeout = self.config.connect_timeout();
        let stream = match tokio::time::timeout(timeout, connect_async(request)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                self.shared.set_state(ConnectionState::Closed);
                warn!(endpoint = %endpoint, error = %e, "Connection failed");
                return Err(connect_error(endpoint, e));
            }
            Err(_) => {
                self.shared.set_state(ConnectionState::Closed);
                warn!(endpoint = %endpoint, ?timeout, "Connection timed out");
                return Err(ComputerError::ConnectTimeout { endpoint, timeout });
            }
        };

        // a new physical connection gets a fresh handshake
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.metadata.send_replace(None);
        {
            let mut session = self.shared.session.write().await;
            session.reset_connection();
            session.state = ConnectionState::Connected;
        }

        let (writer, reader) = stream.split();
        *self.writer.lock().await = Some(writer);
        self.shared.set_state(ConnectionState::Connected);

        let task = tokio::spawn(read_loop(reader, Arc::clone(&self.shared), generation));
        if let Some(previous) = self.recv_task.lock().await.replace(task) {
            previous.abort();
        }

        info!(endpoint = %endpoint, "Connected to computer");
        Ok(())
    }

    async fn ensure_connected(&self) -> Result<(), ComputerError> {
        if self.state() != ConnectionState::Connected {
            self.connect().await?;
        }
        Ok(())
    }

    /// Write one action frame without waiting for its result
    ///
    /// The send takes its turn in the execute queue. Its answer is consumed
    /// and discarded, and the next `execute` waits for it to arrive.
    pub async fn send(&self, action: &Action) -> Result<(), ComputerError> {
        if self.state() != ConnectionState::Connected {
            return Err(ComputerError::NotConnected);
        }
        let _turn = self.queue.lock().await;

        let pending = self.shared.register_pending(action.tool_name()).await?;
        let written = self.write_action(action).await;
        if written.is_err() {
            self.shared.take_pending();
        }
        drop(pending);
        written
    }

    /// Send an action and wait for the frame that answers it
    pub async fn execute(&self, action: Action) -> Result<ComputerMessage, ComputerError> {
        let _turn = self.queue.lock().await;
        let result = self.exchange(&action).await;
        if let Err(e) = &result {
            EXECUTE_ERRORS.with_label_values(&[e.kind()]).inc();
        }
        result
    }

    async fn exchange(&self, action: &Action) -> Result<ComputerMessage, ComputerError> {
        self.ensure_connected().await?;

        let tool = action.tool_name();
        let pending = self.shared.register_pending(tool).await?;

        if self.state() != ConnectionState::Connected {
            self.shared.take_pending();
            return Err(ComputerError::ChannelClosed {
                code: None,
                reason: "channel closed before send".to_string(),
            });
        }

        let started = Instant::now();
        if let Err(e) = self.write_action(action).await {
            self.shared.take_pending();
            return Err(e);
        }

        let result = pending.rx.await.unwrap_or_else(|_| {
            Err(ComputerError::ChannelClosed {
                code: None,
                reason: "exchange dropped".to_string(),
            })
        });

        EXECUTE_DURATION
            .with_label_values(&[tool])
            .observe(started.elapsed().as_secs_f64());
        result
    }

    /// Log and write one frame. The pending exchange, if any, counts as
    /// written from the moment the writer is held.
    async fn write_action(&self, action: &Action) -> Result<(), ComputerError> {
        if self.state() != ConnectionState::Connected {
            return Err(ComputerError::NotConnected);
        }
        let text = serde_json::to_string(action)?;

        if let Some(log) = &self.shared.log {
            log.log_send(action);
        }

        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ComputerError::NotConnected)?;
        self.shared.mark_written();
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|e| ComputerError::Channel(e.to_string()))?;

        ACTIONS_SENT.with_label_values(&[action.tool_name()]).inc();
        debug!(tool = action.tool_name(), "Action sent");
        Ok(())
    }

    /// Validate a raw `{tool, params}` payload and execute it
    ///
    /// Extension tools are not served by the channel and are rejected here.
    pub async fn execute_raw(&self, raw: &serde_json::Value) -> Result<ComputerMessage, ComputerError> {
        match validate(raw)? {
            ValidatedAction::Fixed(action) => self.execute(action).await,
            ValidatedAction::Extension(call) => Err(ComputerError::Validation(ValidationError {
                tool: Some(call.tool),
                message: "not a channel tool".to_string(),
            })),
        }
    }

    /// Wait until the welcome frame has been promoted
    ///
    /// Uses the configured metadata timeout when `timeout` is `None`.
    pub async fn wait_for_metadata(
        &self,
        timeout: Option<Duration>,
    ) -> Result<MachineMetadata, ComputerError> {
        self.ensure_connected().await?;
        let timeout = timeout.unwrap_or_else(|| self.config.metadata_timeout());

        let mut rx = self.shared.metadata.subscribe();
        let wait = async move {
            loop {
                if let Some(metadata) = rx.borrow_and_update().clone() {
                    return Some(metadata);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(metadata)) => Ok(metadata),
            Ok(None) => Err(ComputerError::NotConnected),
            Err(_) => Err(ComputerError::HandshakeTimeout(timeout)),
        }
    }

    /// Close the channel and reject anything still pending
    pub async fn close(&self) -> Result<(), ComputerError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.send(Message::Close(None)).await;
            let _ = writer.close().await;
        }
        if let Some(task) = self.recv_task.lock().await.take() {
            task.abort();
        }
        // orphan the reader's own teardown
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Closed
        ) {
            return Ok(());
        }
        self.shared
            .finish_connection(generation, None, "closed by client".to_string(), "client")
            .await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience operations
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn bash(&self, command: impl Into<String>) -> Result<ComputerMessage, ComputerError> {
        self.checked(Action::bash(command)).await
    }

    pub async fn screenshot(&self) -> Result<ComputerMessage, ComputerError> {
        self.execute(Action::computer(ComputerAction::Screenshot)).await
    }

    pub async fn cursor_position(&self) -> Result<ComputerMessage, ComputerError> {
        self.execute(Action::computer(ComputerAction::CursorPosition)).await
    }

    pub async fn mouse_move(&self, x: i32, y: i32) -> Result<ComputerMessage, ComputerError> {
        self.execute(Action::computer(ComputerAction::MouseMove {
            coordinate: Coordinate(x, y),
        }))
        .await
    }

    pub async fn left_click(&self) -> Result<ComputerMessage, ComputerError> {
        self.execute(Action::computer(ComputerAction::LeftClick)).await
    }

    pub async fn type_text(&self, text: impl Into<String>) -> Result<ComputerMessage, ComputerError> {
        self.checked(Action::computer(ComputerAction::Type { text: text.into() }))
            .await
    }

    pub async fn key(&self, text: impl Into<String>) -> Result<ComputerMessage, ComputerError> {
        self.checked(Action::computer(ComputerAction::Key { text: text.into() }))
            .await
    }

    async fn checked(&self, action: Action) -> Result<ComputerMessage, ComputerError> {
        action.check().map_err(|message| ValidationError {
            tool: Some(action.tool_name().to_string()),
            message,
        })?;
        self.execute(action).await
    }
}

impl Drop for Computer {
    fn drop(&mut self) {
        if let Some(task) = self.recv_task.get_mut().take() {
            task.abort();
        }
    }
}

async fn read_loop(mut reader: WsReader, shared: Arc<Shared>, generation: u64) {
    let mut code = None;
    let mut reason = "stream ended".to_string();
    let mut cause = "eof";

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => shared.handle_text(text.as_str()).await,
            Ok(Message::Close(frame)) => {
                if let Some(frame) = frame {
                    code = Some(u16::from(frame.code));
                    reason = frame.reason.to_string();
                } else {
                    reason = "closed by remote".to_string();
                }
                cause = "remote";
                break;
            }
            Ok(Message::Binary(_)) => debug!("Ignoring binary frame"),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
            Err(e) => {
                warn!(error = %e, "Channel error");
                let _ = shared.events.send(ComputerEvent::Error(e.to_string()));
                shared.fail_pending(ComputerError::Channel(e.to_string()));
                reason = e.to_string();
                cause = "error";
                break;
            }
        }
    }

    shared.finish_connection(generation, code, reason, cause).await;
}

fn connect_error(endpoint: String, error: WsError) -> ComputerError {
    match error {
        WsError::Http(response) => {
            let status = response.status();
            ComputerError::Connect {
                endpoint,
                status: Some(status.as_u16()),
                message: status
                    .canonical_reason()
                    .unwrap_or("handshake rejected")
                    .to_string(),
            }
        }
        other => ComputerError::Connect {
            endpoint,
            status: None,
            message: other.to_string(),
        },
    }
}
