//! RPC façade over the bus.
//!
//! A [`Gateway`] is one session with a small agent application running inside
//! the runtime. Requests are wrapped in an [`RpcEnvelope`] and sent over the
//! bus to the agent's exec topic; the agent answers on the same topic and the
//! reply is matched back to the caller by its session-scoped message id.
//!
//! ```text
//! caller ── invoke ──► Gateway ── send-message(gw, "<gw>-exec") ──► agent
//!   ▲                                                                 │
//!   └──── PendingRequest ◄── process-message("<gw>-exec") ◄───────────┘
//! ```
//!
//! Listeners get their own bus topic (`"<gw>-listener-<n>"`). The agent
//! publishes event arguments there and waits for an optional reply on the
//! same topic.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use tempfile::TempPath;

use crate::bus::{InterAppBus, MessageListener};
use crate::connection::{Connection, ConnectionObserver};
use crate::correlation::Multiplexer;
use crate::error::{Error, Result};
use crate::protocol::{ack_succeeded, action, field, rpc, Identity, RpcEnvelope};
use crate::proxy::{InvokeResult, ProxyListener, ProxyObject};

/// Page hosting the in-runtime agent.
const GATEWAY_PAGE: &str = include_str!("../assets/gateway.html");

/// Callback for remote events. Receives the event arguments as a JSON array;
/// a non-null return value is sent back to the event source.
pub type EventHandler = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;

/// Session lifecycle callbacks. All methods default to no-ops.
pub trait GatewayListener: Send + Sync {
    /// Bootstrap finished.
    fn on_open(&self, _gateway: &Gateway) {}

    /// The underlying connection closed.
    fn on_close(&self) {}

    /// The underlying connection failed.
    fn on_error(&self, _message: &str) {}
}

/// Options for [`Gateway::open`].
#[derive(Clone, Default)]
pub struct GatewayOptions {
    /// Serve the agent from this URL instead of the embedded page.
    pub app_url: Option<String>,
    /// Open the agent's developer tools after bootstrap.
    pub show_console: bool,
    /// Application option document passed to `fin.Application.start`.
    pub startup_app: Option<Value>,
    /// Manifest URL passed to `fin.Application.startFromManifest`.
    pub startup_manifest: Option<String>,
    /// Lifecycle listener.
    pub listener: Option<Arc<dyn GatewayListener>>,
}

impl std::fmt::Debug for GatewayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayOptions")
            .field("app_url", &self.app_url)
            .field("show_console", &self.show_console)
            .field("startup_app", &self.startup_app)
            .field("startup_manifest", &self.startup_manifest)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

struct GatewayInner {
    id: String,
    identity: Identity,
    exec_topic: String,
    listener_prefix: String,
    listener_seq: AtomicU64,
    rpc: Arc<Multiplexer<Value>>,
    connection: Arc<Connection>,
    listener: Option<Arc<dyn GatewayListener>>,
    // Keeps the materialized agent page alive for the session.
    _page: Option<TempPath>,
}

/// Session with the in-runtime agent. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("id", &self.inner.id)
            .field("pending", &self.inner.rpc.len())
            .finish_non_exhaustive()
    }
}

/// Fails the session's outstanding requests when the connection ends.
struct SessionObserver {
    rpc: Arc<Multiplexer<Value>>,
    listener: Option<Arc<dyn GatewayListener>>,
}

impl ConnectionObserver for SessionObserver {
    fn on_close(&self, code: u16, reason: &str) {
        self.rpc.fail_all(&format!("connection closed ({code}) {reason}"));
        if let Some(listener) = &self.listener {
            listener.on_close();
        }
    }

    fn on_error(&self, message: &str) {
        self.rpc.fail_all(message);
        if let Some(listener) = &self.listener {
            listener.on_error(message);
        }
    }
}

impl Gateway {
    /// Launch the agent application on a ready connection and open a session.
    ///
    /// # Errors
    ///
    /// Fails if the agent page cannot be written, the runtime rejects
    /// `create-application` / `run-application`, the exec topic cannot be
    /// subscribed, or a startup invocation fails.
    pub async fn open(connection: Arc<Connection>, options: GatewayOptions) -> Result<Self> {
        let (page, url) = match &options.app_url {
            Some(url) => (None, url.clone()),
            None => {
                let (path, url) = materialize_page()?;
                (Some(path), url)
            }
        };

        let gateway = Self::new(connection, options.listener.clone(), page);
        let inner = &gateway.inner;
        log::info!("[Gateway] Starting {} from {}", inner.id, url);

        let mut app = Map::new();
        app.insert("uuid".into(), Value::String(inner.identity.uuid.clone()));
        app.insert("name".into(), Value::String(inner.identity.name.clone()));
        app.insert("url".into(), Value::String(url));
        app.insert("autoShow".into(), Value::Bool(false));
        gateway
            .runtime_request(action::CREATE_APPLICATION, Value::Object(app))
            .await?;
        gateway
            .runtime_request(action::RUN_APPLICATION, inner.identity.to_json())
            .await?;

        let rpc = Arc::clone(&inner.rpc);
        let exec_listener = MessageListener::new(move |_source, message| {
            route_response(&rpc, message);
        });
        gateway
            .bus()
            .subscribe(Some(&inner.identity), &inner.exec_topic, exec_listener)
            .await?;

        inner.connection.add_observer(Arc::new(SessionObserver {
            rpc: Arc::clone(&inner.rpc),
            listener: inner.listener.clone(),
        }));

        if options.show_console {
            gateway
                .invoke("fin.System.showDeveloperTools", &[inner.identity.to_json()])
                .await?;
        }
        if let Some(app) = options.startup_app {
            gateway.invoke("fin.Application.start", &[app]).await?;
        }
        if let Some(manifest) = options.startup_manifest {
            gateway
                .invoke("fin.Application.startFromManifest", &[Value::String(manifest)])
                .await?;
        }

        log::info!("[Gateway] {} ready", inner.id);
        if let Some(listener) = &inner.listener {
            listener.on_open(&gateway);
        }
        Ok(gateway)
    }

    pub(crate) fn new(
        connection: Arc<Connection>,
        listener: Option<Arc<dyn GatewayListener>>,
        page: Option<TempPath>,
    ) -> Self {
        let id = format!("{}-gateway", connection.uuid());
        let timeout = connection.options().request_timeout;
        Self {
            inner: Arc::new(GatewayInner {
                identity: Identity::application(id.clone()),
                exec_topic: format!("{id}-exec"),
                listener_prefix: format!("{id}-listener"),
                listener_seq: AtomicU64::new(0),
                rpc: Arc::new(Multiplexer::new("rpc", timeout)),
                connection,
                listener,
                _page: page,
                id,
            }),
        }
    }

    /// Session id (`"<connection uuid>-gateway"`).
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Identity of the agent application.
    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    /// Topic requests and responses travel on.
    pub fn exec_topic(&self) -> &str {
        &self.inner.exec_topic
    }

    /// The bus this session runs over.
    pub fn bus(&self) -> &InterAppBus {
        self.inner.connection.bus()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.inner.connection
    }

    /// Number of requests waiting for the agent.
    pub fn pending_requests(&self) -> usize {
        self.inner.rpc.len()
    }

    /// Call a static method by dotted path.
    pub async fn invoke(&self, method: &str, args: &[Value]) -> Result<InvokeResult> {
        self.call(false, None, method, args).await
    }

    /// Call a static method and keep a remote reference to its result.
    pub async fn invoke_for_proxy(&self, method: &str, args: &[Value]) -> Result<InvokeResult> {
        self.call(true, None, method, args).await
    }

    /// Call `method` on `target` (or statically when `None`).
    ///
    /// Trailing null arguments are dropped; inner nulls are sent as `null`.
    ///
    /// # Errors
    ///
    /// `Remote` when the agent reports a failure, plus any transport error.
    pub async fn call(
        &self,
        create_proxy: bool,
        target: Option<&ProxyObject>,
        method: &str,
        args: &[Value],
    ) -> Result<InvokeResult> {
        let mut payload = Map::new();
        payload.insert(field::PROXY_RESULT.into(), Value::Bool(create_proxy));
        payload.insert(field::METHOD.into(), Value::String(method.to_string()));
        if let Some(target) = target {
            payload.insert(field::PROXY_OBJ_ID.into(), target.id().clone());
        }
        if let Some(args) = encode_args(args) {
            payload.insert(field::ARGS.into(), args);
        }

        log::debug!("[Gateway] invoke {}", method);
        let response = self.request(rpc::INVOKE, Value::Object(payload)).await?;
        Ok(InvokeResult::new(response, target.cloned(), self.clone()))
    }

    /// Register `handler` with a static `method` for `event`.
    ///
    /// The event name goes at argument 0 and the callback at index 1; without
    /// an event the callback is the only argument. No remote listener
    /// reference is kept, so the result is always `None` unless the agent
    /// returns one anyway.
    pub async fn add_listener(
        &self,
        method: &str,
        event: Option<&str>,
        handler: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Result<Option<ProxyListener>> {
        self.add_event_listener(false, None, method, event, Arc::new(handler))
            .await
    }

    /// Like [`Gateway::add_listener`] but asks the agent to keep a reference
    /// so the listener can be removed later.
    pub async fn add_proxy_listener(
        &self,
        method: &str,
        event: Option<&str>,
        handler: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Result<Option<ProxyListener>> {
        self.add_event_listener(true, None, method, event, Arc::new(handler))
            .await
    }

    pub(crate) async fn add_event_listener(
        &self,
        create_proxy_listener: bool,
        target: Option<&ProxyObject>,
        method: &str,
        event: Option<&str>,
        handler: EventHandler,
    ) -> Result<Option<ProxyListener>> {
        match event {
            Some(event) => {
                let args = [Value::String(event.to_string())];
                self.add_listener_with(create_proxy_listener, target, method, handler, 1, &args)
                    .await
            }
            None => {
                self.add_listener_with(create_proxy_listener, target, method, handler, 0, &[])
                    .await
            }
        }
    }

    /// Register `handler` as argument `listener_arg_index` of `method`.
    ///
    /// The callback topic is subscribed before the agent is asked to attach
    /// the callback, so no event can be missed. When the request fails the
    /// subscription is dropped again.
    ///
    /// Returns a [`ProxyListener`] when the agent kept a reference.
    pub async fn add_listener_with(
        &self,
        create_proxy_listener: bool,
        target: Option<&ProxyObject>,
        method: &str,
        handler: EventHandler,
        listener_arg_index: usize,
        extra_args: &[Value],
    ) -> Result<Option<ProxyListener>> {
        let inner = &self.inner;
        let n = inner.listener_seq.fetch_add(1, Ordering::SeqCst);
        let topic = format!("{}-{}", inner.listener_prefix, n);

        let bus_listener =
            reply_listener(Arc::downgrade(&inner.connection), topic.clone(), handler);
        self.bus()
            .subscribe(Some(&inner.identity), &topic, bus_listener.clone())
            .await?;

        let mut payload = Map::new();
        payload.insert(field::PROXY_RESULT.into(), Value::Bool(create_proxy_listener));
        payload.insert(field::IAB_TOPIC.into(), Value::String(topic.clone()));
        payload.insert(field::METHOD.into(), Value::String(method.to_string()));
        payload.insert(field::LISTENER_ARG_IDX.into(), Value::from(listener_arg_index));
        if let Some(target) = target {
            payload.insert(field::PROXY_OBJ_ID.into(), target.id().clone());
        }
        if let Some(args) = encode_args(extra_args) {
            payload.insert(field::ARGS.into(), args);
        }

        log::debug!("[Gateway] add-listener {} on {}", method, topic);
        let response = match self.request(rpc::ADD_LISTENER, Value::Object(payload)).await {
            Ok(response) => response,
            Err(e) => {
                if let Err(undo) = self
                    .bus()
                    .unsubscribe(Some(&inner.identity), &topic, &bus_listener)
                    .await
                {
                    log::warn!(
                        "[Gateway] Could not drop {} after failed add-listener: {}",
                        topic,
                        undo
                    );
                }
                return Err(e);
            }
        };

        Ok(response.get(field::PROXY_OBJ_ID).map(|id| {
            ProxyListener::new(id.clone(), topic, bus_listener, target.cloned(), self.clone())
        }))
    }

    /// Detach `listener` from `method`/`event` and release it.
    ///
    /// Unsubscribes the callback topic, asks the agent to detach the
    /// callback, then deletes the agent's listener reference. The handle is
    /// only borrowed, so after a failed step the caller can retry or fall
    /// back to [`ProxyListener::dispose`].
    pub async fn remove_listener(
        &self,
        target: Option<&ProxyObject>,
        method: &str,
        event: &str,
        listener: &ProxyListener,
    ) -> Result<()> {
        listener.unsubscribe().await?;

        let mut payload = Map::new();
        payload.insert(field::METHOD.into(), Value::String(method.to_string()));
        payload.insert(field::EVENT.into(), Value::String(event.to_string()));
        payload.insert(field::PROXY_LISTENER_ID.into(), listener.id().clone());
        if let Some(target) = target {
            payload.insert(field::PROXY_OBJ_ID.into(), target.id().clone());
        }

        log::debug!("[Gateway] remove-listener {} {}", method, event);
        self.request(rpc::REMOVE_LISTENER, Value::Object(payload)).await?;
        self.delete_proxy_object(listener.id()).await
    }

    /// Release the agent's reference `id`.
    pub async fn delete_proxy_object(&self, id: &Value) -> Result<()> {
        log::debug!("[Gateway] delete {}", id);
        self.request(rpc::DELETE, id.clone()).await.map(|_| ())
    }

    /// Round-trip a `ping` through the agent.
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        self.request(rpc::PING, Value::from(millis)).await?;
        Ok(started.elapsed())
    }

    /// Stop the agent and disconnect.
    ///
    /// The connection is closed even when the agent does not acknowledge
    /// `quit`; that failure is still returned.
    pub async fn close(&self) -> Result<()> {
        log::info!("[Gateway] Closing {}", self.inner.id);
        let quit = self
            .request(rpc::QUIT, Value::Object(Map::new()))
            .await
            .map(|_| ());
        let disconnect = self.inner.connection.disconnect().await;
        quit.and(disconnect)
    }

    /// Send one envelope to the agent and wait for the correlated response.
    async fn request(&self, action: &str, payload: Value) -> Result<Value> {
        let pending = self.inner.rpc.register();
        let envelope = RpcEnvelope {
            message_id: pending.id(),
            action: action.to_string(),
            payload,
        };
        let message = serde_json::to_value(&envelope)?;
        self.bus()
            .send(&self.inner.identity, &self.inner.exec_topic, message)
            .await?;
        pending.wait().await
    }

    /// Runtime-level request whose ack must report success.
    async fn runtime_request(&self, action: &str, payload: Value) -> Result<()> {
        let ack = self.inner.connection.send_message(action, payload).await?;
        if ack_succeeded(&ack) {
            Ok(())
        } else {
            Err(Error::rejected(action, &ack))
        }
    }
}

/// Complete the pending request an agent response answers.
fn route_response(rpc: &Multiplexer<Value>, message: &Value) {
    let envelope: RpcEnvelope = match serde_json::from_value(message.clone()) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("[Gateway] Malformed response ({}): {}", e, message);
            return;
        }
    };

    let result = if envelope.action == rpc::ERROR {
        let message = envelope
            .payload
            .get("error")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| envelope.payload.to_string());
        Err(Error::Remote { message })
    } else {
        Ok(envelope.payload)
    };
    rpc.complete(envelope.message_id, result);
}

/// Bus listener running `handler` and sending a non-null result back to the
/// event source on the same topic.
fn reply_listener(
    connection: Weak<Connection>,
    topic: String,
    handler: EventHandler,
) -> MessageListener {
    MessageListener::new(move |source, event| {
        let Some(reply) = handler(event.clone()) else {
            return;
        };
        if reply.is_null() {
            return;
        }
        let Some(connection) = connection.upgrade() else {
            return;
        };
        let source = source.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.bus().send(&source, &topic, reply).await {
                log::warn!("[Gateway] Reply on {} failed: {}", topic, e);
            }
        });
    })
}

/// Trim `args` after the last non-null value. `None` when nothing is left.
pub fn encode_args(args: &[Value]) -> Option<Value> {
    let last = args.iter().rposition(|a| !a.is_null())?;
    Some(Value::Array(args[..=last].to_vec()))
}

/// Write the embedded agent page to a temp file and return it with its URL.
fn materialize_page() -> Result<(TempPath, String)> {
    let mut file = tempfile::Builder::new()
        .prefix("fingate-gateway-")
        .suffix(".html")
        .tempfile()?;
    file.write_all(GATEWAY_PAGE.as_bytes())?;
    file.flush()?;

    let path = file.into_temp_path();
    let url = url::Url::from_file_path(&path)
        .map_err(|()| Error::Io(format!("not an absolute path: {}", path.display())))?;
    log::debug!("[Gateway] Agent page at {}", path.display());
    Ok((path, url.to_string()))
}
