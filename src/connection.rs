//! Transport channel to the runtime.
//!
//! A [`Connection`] owns one WebSocket, performs the file-token
//! authorization handshake, correlates `ack` frames with outstanding
//! requests, and fans unsolicited frames out to the [`InterAppBus`].
//!
//! # Lifecycle
//!
//! ```text
//! Init ──connect()──► Connecting ──socket open──► Open
//!                                                  │ request-external-authorization
//!                                                  ▼
//!                     external-authorization-response ──► Authenticating
//!                                                  │ token written, request-authorization
//!                                                  ▼
//!                            authorization-response ──► Ready
//!
//! any state ──close frame / read error──► Closed | Error   (terminal)
//! ```
//!
//! # Tasks
//!
//! One reader task pulls frames off the socket. Handshake frames and pings
//! are handled inline; everything else is queued to a fixed pool of worker
//! tasks so a slow bus listener never stalls frame reception. Writes go
//! through a single async mutex around the writer half.
//!
//! Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};

use crate::bus::{InterAppBus, Transport};
use crate::correlation::Multiplexer;
use crate::error::{Error, Result};
use crate::protocol::{action, IncomingFrame, OutgoingFrame};
use crate::ws::{self, Inbound, SocketReader, SocketWriter};

/// Default runtime WebSocket port.
pub const DEFAULT_PORT: u16 = 9696;

/// Default number of inbound worker tasks.
pub const DEFAULT_WORKERS: usize = 10;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for the authorization handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Close reason sent by [`Connection::disconnect`].
const NORMAL_CLOSURE: &str = "normal closure";

/// Options for [`Connection::new`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Runtime host.
    pub host: String,
    /// Runtime WebSocket port.
    pub port: u16,
    /// Connection identity; a random UUID v4 when `None`.
    pub uuid: Option<String>,
    /// License key forwarded in the handshake.
    pub license_key: Option<String>,
    /// Runtime config URL forwarded in the handshake.
    pub config_url: Option<String>,
    /// Deadline for each correlated request.
    pub request_timeout: Duration,
    /// Deadline for the authorization handshake.
    pub handshake_timeout: Duration,
    /// Inbound worker pool size.
    pub workers: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            uuid: None,
            license_key: None,
            config_url: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            workers: DEFAULT_WORKERS,
        }
    }
}

impl ConnectionOptions {
    /// Options for `host:port` with every other field defaulted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }
}

/// Channel lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Created, `connect()` not yet called.
    #[default]
    Init,
    /// Opening the socket.
    Connecting,
    /// Socket open, handshake started.
    Open,
    /// Token written, waiting for the authorization verdict.
    Authenticating,
    /// Authorized; all operations available.
    Ready,
    /// Closed normally or by the peer.
    Closed,
    /// Failed.
    Error(String),
}

impl ConnectionState {
    /// Whether frames may be written in this state.
    pub fn can_send(&self) -> bool {
        matches!(self, Self::Open | Self::Authenticating | Self::Ready)
    }

    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error(_))
    }
}

/// Lifecycle callbacks. All methods default to no-ops.
pub trait ConnectionObserver: Send + Sync {
    /// The handshake completed and the connection is ready.
    fn on_open(&self) {}

    /// The socket closed with `code` and `reason`.
    fn on_close(&self, _code: u16, _reason: &str) {}

    /// The socket failed.
    fn on_error(&self, _message: &str) {}
}

/// How the reader task ended.
#[derive(Debug)]
enum Teardown {
    Closed { code: u16, reason: String },
    Failed(String),
    Lost,
}

type Handshake = oneshot::Sender<Result<()>>;

/// Authenticated WebSocket channel to the runtime.
pub struct Connection {
    uuid: String,
    options: ConnectionOptions,
    state: RwLock<ConnectionState>,
    acks: Multiplexer<Value>,
    writer: tokio::sync::Mutex<Option<SocketWriter>>,
    observers: RwLock<Vec<Arc<dyn ConnectionObserver>>>,
    handshake: Mutex<Option<Handshake>>,
    torn_down: AtomicBool,
    bus: InterAppBus,
    this: Weak<Connection>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .field("pending_acks", &self.acks.len())
            .finish_non_exhaustive()
    }
}

/// Bus transport holding only a weak reference back to the connection.
struct ConnectionTransport(Weak<Connection>);

#[async_trait]
impl Transport for ConnectionTransport {
    async fn send_message(&self, action: &str, payload: Value) -> Result<Value> {
        let conn = self.0.upgrade().ok_or(Error::NotConnected)?;
        conn.send_message(action, payload).await
    }
}

impl Connection {
    /// Create an unconnected channel.
    pub fn new(options: ConnectionOptions) -> Arc<Self> {
        let uuid = options
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let request_timeout = options.request_timeout;

        Arc::new_cyclic(|this: &Weak<Connection>| Self {
            uuid,
            options,
            state: RwLock::new(ConnectionState::Init),
            acks: Multiplexer::new("ack", request_timeout),
            writer: tokio::sync::Mutex::new(None),
            observers: RwLock::new(Vec::new()),
            handshake: Mutex::new(None),
            torn_down: AtomicBool::new(false),
            bus: InterAppBus::new(Arc::new(ConnectionTransport(this.clone()))),
            this: this.clone(),
        })
    }

    /// Connection identity sent in the handshake.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Options this connection was created with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Whether the handshake completed and the channel is still open.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// The bus multiplexed over this connection.
    pub fn bus(&self) -> &InterAppBus {
        &self.bus
    }

    /// Number of requests waiting for an ack.
    pub fn pending_acks(&self) -> usize {
        self.acks.len()
    }

    /// Register a lifecycle observer.
    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        match self.observers.write() {
            Ok(mut list) => list.push(observer),
            Err(e) => e.into_inner().push(observer),
        }
    }

    /// Open the socket and run the authorization handshake.
    ///
    /// Resolves once the runtime authorizes the connection.
    ///
    /// # Errors
    ///
    /// `ConnectFailed` if the socket cannot be opened, `Handshake` if the
    /// runtime rejects the token, `Io` if the token file cannot be written,
    /// `Timeout` if the handshake does not finish in time.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.write_state();
            if *state != ConnectionState::Init {
                return Err(Error::ConnectFailed(format!(
                    "connection {} already used (state {:?})",
                    self.uuid, *state
                )));
            }
            *state = ConnectionState::Connecting;
        }

        log::info!(
            "[Connection] Connecting to {} as {}",
            ws::endpoint_url(&self.options.host, self.options.port),
            self.uuid
        );

        let (writer, reader) = match ws::open(&self.options.host, self.options.port).await {
            Ok(halves) => halves,
            Err(e) => {
                log::error!("[Connection] {}", e);
                self.set_state(ConnectionState::Error(e.to_string()));
                self.torn_down.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        *self.writer.lock().await = Some(writer);
        let (handshake_tx, handshake_rx) = oneshot::channel();
        *self.lock_handshake() = Some(handshake_tx);
        self.set_state(ConnectionState::Open);

        self.spawn_reader(reader);

        let hello = self.external_authorization_payload();
        if let Err(e) = self
            .write_frame(action::REQUEST_EXTERNAL_AUTHORIZATION, None, &hello)
            .await
        {
            self.abort_handshake(&e).await;
            return Err(e);
        }

        let timeout = self.options.handshake_timeout;
        let verdict = match tokio::time::timeout(timeout, handshake_rx).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(_)) => Err(Error::Closed("closed during handshake".to_string())),
            Err(_) => Err(Error::Timeout {
                what: "authorization handshake".to_string(),
                after: timeout,
            }),
        };

        match verdict {
            Ok(()) => {
                self.set_state(ConnectionState::Ready);
                log::info!("[Connection] Authorized as {}", self.uuid);
                for observer in self.observer_snapshot() {
                    observer.on_open();
                }
                Ok(())
            }
            Err(e) => {
                log::error!("[Connection] Handshake failed: {}", e);
                self.abort_handshake(&e).await;
                Err(e)
            }
        }
    }

    /// Send `action` and resolve with the payload of its `ack`.
    ///
    /// # Errors
    ///
    /// `NotConnected` when the channel is not open, `Write` if the frame
    /// cannot be written, `Closed` if the channel closes first, `Timeout`
    /// when no ack arrives within the request deadline.
    pub async fn send_message(&self, action: &str, payload: Value) -> Result<Value> {
        if !self.state().can_send() {
            return Err(Error::NotConnected);
        }

        let pending = self.acks.register();
        self.write_frame(action, Some(pending.id()), &payload).await?;
        pending.wait().await
    }

    /// Send a normal-closure close frame. The reader task finishes teardown
    /// when the runtime echoes the close.
    pub async fn disconnect(&self) -> Result<()> {
        if !self.state().can_send() {
            log::debug!("[Connection] disconnect() in state {:?}, nothing to do", self.state());
            return Ok(());
        }

        log::info!("[Connection] Disconnecting {}", self.uuid);
        self.set_state(ConnectionState::Closed);
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.close(1000, NORMAL_CLOSURE).await,
            None => Ok(()),
        }
    }

    async fn write_frame(
        &self,
        action: &str,
        message_id: Option<u64>,
        payload: &Value,
    ) -> Result<()> {
        let frame = OutgoingFrame {
            action,
            message_id,
            payload,
        };
        let text = serde_json::to_string(&frame)?;
        log::trace!("[Connection] >>> {}", text);

        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w.send_document(&text).await,
            None => Err(Error::NotConnected),
        }
    }

    fn external_authorization_payload(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("uuid".into(), Value::String(self.uuid.clone()));
        payload.insert("type".into(), Value::String("file-token".into()));
        payload.insert(
            "client".into(),
            serde_json::json!({ "type": "rust", "version": env!("CARGO_PKG_VERSION") }),
        );
        if let Some(key) = &self.options.license_key {
            payload.insert("licenseKey".into(), Value::String(key.clone()));
        }
        if let Some(url) = &self.options.config_url {
            payload.insert("configUrl".into(), Value::String(url.clone()));
        }
        Value::Object(payload)
    }

    fn spawn_reader(&self, mut reader: SocketReader) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel::<IncomingFrame>();
        let queue_rx = Arc::new(tokio::sync::Mutex::new(queue_rx));

        for worker in 0..self.options.workers.max(1) {
            let queue_rx = Arc::clone(&queue_rx);
            let this = self.this.clone();
            tokio::spawn(async move {
                loop {
                    let next = queue_rx.lock().await.recv().await;
                    let Some(frame) = next else { break };
                    let Some(conn) = this.upgrade() else { break };
                    conn.dispatch(frame);
                }
                log::trace!("[Connection] Worker {} stopped", worker);
            });
        }

        let this = self.this.clone();
        tokio::spawn(async move {
            let guard_ref = this.clone();
            let mut outcome = scopeguard::guard(Teardown::Lost, move |outcome| {
                if let Some(conn) = guard_ref.upgrade() {
                    conn.teardown(outcome);
                }
            });

            while let Some(message) = reader.next_inbound().await {
                let Some(conn) = this.upgrade() else { return };
                match message {
                    Ok(Inbound::Document(text)) => {
                        log::trace!("[Connection] <<< {}", text);
                        let frame = match serde_json::from_str::<IncomingFrame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                log::warn!("[Connection] Malformed frame ({}): {}", e, text);
                                continue;
                            }
                        };
                        match frame.action.as_str() {
                            action::EXTERNAL_AUTHORIZATION_RESPONSE => {
                                conn.on_external_authorization(frame.payload).await;
                            }
                            action::AUTHORIZATION_RESPONSE => {
                                conn.on_authorization(&frame.payload);
                            }
                            _ => {
                                if queue_tx.send(frame).is_err() {
                                    log::warn!("[Connection] Worker pool gone, dropping frame");
                                }
                            }
                        }
                    }
                    Ok(Inbound::Ping(data)) => {
                        if let Some(w) = conn.writer.lock().await.as_mut() {
                            if let Err(e) = w.pong(data).await {
                                log::warn!("[Connection] Pong failed: {}", e);
                            }
                        }
                    }
                    Ok(Inbound::Closed { code, reason }) => {
                        log::info!("[Connection] Closed by peer: {} {}", code, reason);
                        *outcome = Teardown::Closed { code, reason };
                        break;
                    }
                    Err(e) => {
                        log::error!("[Connection] {}", e);
                        *outcome = Teardown::Failed(e.to_string());
                        break;
                    }
                }
            }
            // Dropping queue_tx here stops the workers once the queue drains.
        });
    }

    /// Route one queued frame.
    fn dispatch(&self, frame: IncomingFrame) {
        match frame.action.as_str() {
            action::ACK => match frame.correlation_id {
                Some(id) => {
                    self.acks.complete(id, Ok(frame.payload));
                }
                None => log::warn!("[Connection] ack without correlationId: {}", frame.payload),
            },
            action::PROCESS_MESSAGE => self.bus.process_message(&frame.payload),
            other => log::trace!("[Connection] Ignoring action {}", other),
        }
    }

    async fn on_external_authorization(&self, payload: Value) {
        let file = payload.get("file").and_then(Value::as_str);
        let token = payload.get("token").and_then(Value::as_str);
        let (Some(file), Some(token)) = (file, token) else {
            self.finish_handshake(Err(Error::Protocol(format!(
                "external-authorization-response without file/token: {payload}"
            ))));
            return;
        };

        self.set_state(ConnectionState::Authenticating);
        log::debug!("[Connection] Writing authorization token to {}", file);
        if let Err(e) = tokio::fs::write(file, token).await {
            self.finish_handshake(Err(Error::Io(format!("{file}: {e}"))));
            return;
        }

        // The verdict arrives as authorization-response; the ack (if any) is
        // only logged. Awaited off the reader task so the reader keeps reading.
        let Some(conn) = self.this.upgrade() else { return };
        tokio::spawn(async move {
            let payload = serde_json::json!({ "uuid": conn.uuid, "type": "file-token" });
            if let Err(e) = conn.send_message(action::REQUEST_AUTHORIZATION, payload).await {
                log::debug!("[Connection] request-authorization not acknowledged: {}", e);
            }
        });
    }

    fn on_authorization(&self, payload: &Value) {
        if payload.get("success").and_then(Value::as_bool) == Some(false) {
            let reason = payload
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("authorization rejected");
            self.finish_handshake(Err(Error::Handshake(reason.to_string())));
        } else {
            self.finish_handshake(Ok(()));
        }
    }

    fn finish_handshake(&self, verdict: Result<()>) {
        match self.lock_handshake().take() {
            Some(tx) => {
                let _ = tx.send(verdict);
            }
            None => log::warn!("[Connection] Handshake frame with no handshake in progress"),
        }
    }

    async fn abort_handshake(&self, error: &Error) {
        self.set_state(ConnectionState::Error(error.to_string()));
        if let Some(w) = self.writer.lock().await.as_mut() {
            let _ = w.close(1000, "handshake failed").await;
        }
    }

    /// Fail everything outstanding and notify observers. Runs once.
    fn teardown(&self, outcome: Teardown) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let reason = match &outcome {
            Teardown::Closed { code, reason } => format!("closed ({code}) {reason}"),
            Teardown::Failed(message) => message.clone(),
            Teardown::Lost => "connection lost".to_string(),
        };

        {
            let mut state = self.write_state();
            let next = match (&outcome, &*state) {
                (_, ConnectionState::Error(prev)) => ConnectionState::Error(prev.clone()),
                (Teardown::Failed(message), _) => ConnectionState::Error(message.clone()),
                _ => ConnectionState::Closed,
            };
            *state = next;
        }

        if let Some(tx) = self.lock_handshake().take() {
            let _ = tx.send(Err(Error::Closed(reason.clone())));
        }
        self.acks.fail_all(&reason);
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        log::info!("[Connection] {} torn down: {}", self.uuid, reason);
        for observer in self.observer_snapshot() {
            match &outcome {
                Teardown::Closed { code, reason } => observer.on_close(*code, reason),
                Teardown::Failed(message) => observer.on_error(message),
                Teardown::Lost => observer.on_close(1006, "connection lost"),
            }
        }
    }

    fn observer_snapshot(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        match self.observers.read() {
            Ok(list) => list.clone(),
            Err(e) => e.into_inner().clone(),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        log::debug!("[Connection] state -> {:?}", state);
        *self.write_state() = state;
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ConnectionState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_handshake(&self) -> std::sync::MutexGuard<'_, Option<Handshake>> {
        self.handshake.lock().unwrap_or_else(|e| e.into_inner())
    }
}
