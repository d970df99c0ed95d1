//! In-process fake runtime for integration tests.
//!
//! Speaks the runtime side of the wire protocol over a real WebSocket on
//! `127.0.0.1:<ephemeral>`: the file-token handshake, acks for every
//! request, bus loopback, and an emulation of the in-runtime agent that
//! answers RPC envelopes sent to `<gateway>-exec`.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fingate::{Connection, ConnectionOptions, Gateway, GatewayOptions};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Runtime version reported by `fin.System.getVersion`.
pub const RUNTIME_VERSION: &str = "16.83.50.9";

/// Knobs for misbehaving runtimes.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Answer `request-authorization` with `success: false`.
    pub reject_auth: bool,
    /// Never answer `request-external-authorization`.
    pub silent_auth: bool,
    /// Reject `subscribe` for this topic.
    pub reject_topic: Option<String>,
    /// Reject `run-application`.
    pub reject_run: bool,
}

/// Everything the fake runtime observed.
#[derive(Default)]
pub struct State {
    /// Every frame the client sent, in order.
    pub frames: Vec<Value>,
    /// Active wire subscriptions `(uuid, name, topic)`.
    pub subscriptions: Vec<(String, String, String)>,
    /// Callback topics registered via `add-listener`.
    pub listener_topics: Vec<String>,
    /// Listener replies `(topic, message)` sent back by the client.
    pub listener_replies: Vec<(String, Value)>,
    /// Live agent references.
    pub refs: HashSet<String>,
    /// Handshake token file and token.
    pub token: Option<(PathBuf, String)>,
    client_uuid: String,
    next_ref: u64,
    outbound: Option<mpsc::UnboundedSender<Message>>,
}

impl State {
    /// Frames the client sent with `action`.
    pub fn frames_with(&self, action: &str) -> Vec<Value> {
        self.frames
            .iter()
            .filter(|f| f["action"] == action)
            .cloned()
            .collect()
    }

    /// RPC envelopes (`send-message` to the exec topic) with `action`.
    pub fn rpc_with(&self, action: &str) -> Vec<Value> {
        self.frames_with("send-message")
            .into_iter()
            .map(|f| f["payload"]["message"].clone())
            .filter(|m| m["action"] == action)
            .collect()
    }

    fn gateway_id(&self) -> String {
        format!("{}-gateway", self.client_uuid)
    }
}

struct Shared {
    state: Mutex<State>,
    behavior: Behavior,
    dir: tempfile::TempDir,
}

/// Handle to a running fake runtime.
pub struct FakeRuntime {
    /// Port the runtime listens on.
    pub port: u16,
    shared: Arc<Shared>,
}

impl FakeRuntime {
    /// Start a well-behaved runtime.
    pub async fn start() -> Self {
        Self::with_behavior(Behavior::default()).await
    }

    /// Start a runtime with custom behavior.
    pub async fn with_behavior(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            behavior,
            dir: tempfile::tempdir().unwrap(),
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(stream, Arc::clone(&accept_shared)));
            }
        });

        Self { port, shared }
    }

    /// Connection options pointing at this runtime.
    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            uuid: Some("host-app".into()),
            request_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            ..ConnectionOptions::new("127.0.0.1", self.port)
        }
    }

    /// Connect and authorize.
    pub async fn connect(&self) -> Arc<Connection> {
        let conn = Connection::new(self.options());
        conn.connect().await.unwrap();
        conn
    }

    /// Connect and open a gateway session.
    pub async fn gateway(&self) -> Gateway {
        self.gateway_with(self.options(), GatewayOptions::default()).await
    }

    /// Connect with `conn_opts` and open a gateway with `gw_opts`.
    pub async fn gateway_with(
        &self,
        conn_opts: ConnectionOptions,
        gw_opts: GatewayOptions,
    ) -> Gateway {
        let conn = Connection::new(conn_opts);
        conn.connect().await.unwrap();
        Gateway::open(conn, gw_opts).await.unwrap()
    }

    /// Inspect the recorded state.
    pub fn state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        f(&self.shared.state.lock().unwrap())
    }

    /// Fire an agent-side event on a callback topic.
    pub fn fire(&self, topic: &str, args: Value) {
        let state = self.shared.state.lock().unwrap();
        let gw = state.gateway_id();
        push(&state, process_message(&gw, &gw, topic, args));
    }

    /// Deliver a bus message from `uuid/name` on `topic`.
    pub fn deliver(&self, uuid: &str, name: &str, topic: &str, message: Value) {
        let state = self.shared.state.lock().unwrap();
        push(&state, process_message(uuid, name, topic, message));
    }

    /// Push raw `text` to the client as one text frame.
    pub fn push_raw(&self, text: &str) {
        let state = self.shared.state.lock().unwrap();
        if let Some(tx) = &state.outbound {
            let _ = tx.send(Message::Text(text.to_string()));
        }
    }

    /// Close the socket from the runtime side.
    pub fn close(&self, code: u16, reason: &str) {
        let state = self.shared.state.lock().unwrap();
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        if let Some(tx) = &state.outbound {
            let _ = tx.send(Message::Close(Some(frame)));
        }
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

fn push(state: &State, frame: Value) {
    if let Some(tx) = &state.outbound {
        let _ = tx.send(Message::Text(frame.to_string()));
    }
}

fn ack(state: &State, id: Option<u64>, payload: Value) {
    if let Some(id) = id {
        push(state, json!({ "action": "ack", "correlationId": id, "payload": payload }));
    }
}

fn process_message(uuid: &str, name: &str, topic: &str, message: Value) -> Value {
    json!({
        "action": "process-message",
        "payload": {
            "sourceUuid": uuid,
            "sourceWindowName": name,
            "topic": topic,
            "message": message,
        }
    })
}

async fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    shared.state.lock().unwrap().outbound = Some(tx);

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    // Keep reading after a close so tungstenite can flush the close reply.
    while let Some(Ok(message)) = source.next().await {
        if let Message::Text(text) = message {
            let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            handle(&shared, frame);
        }
    }
}

fn handle(shared: &Arc<Shared>, frame: Value) {
    let action = frame["action"].as_str().unwrap_or_default().to_string();
    let id = frame.get("messageId").and_then(Value::as_u64);
    let payload = frame["payload"].clone();
    let behavior = &shared.behavior;

    let mut state = shared.state.lock().unwrap();
    state.frames.push(frame);

    match action.as_str() {
        "request-external-authorization" => {
            state.client_uuid = payload["uuid"].as_str().unwrap_or_default().to_string();
            if behavior.silent_auth {
                return;
            }
            let file = shared.dir.path().join("auth-token");
            let token = format!("token-{}", state.client_uuid);
            push(
                &state,
                json!({
                    "action": "external-authorization-response",
                    "payload": { "file": file.to_string_lossy(), "token": token },
                }),
            );
            state.token = Some((file, token));
        }
        "request-authorization" => {
            ack(&state, id, json!({ "success": true }));
            let written = state
                .token
                .as_ref()
                .is_some_and(|(file, token)| {
                    std::fs::read_to_string(file).ok().as_deref() == Some(token.as_str())
                });
            let verdict = if behavior.reject_auth || !written {
                json!({ "success": false, "reason": "invalid token" })
            } else {
                json!({ "success": true })
            };
            push(&state, json!({ "action": "authorization-response", "payload": verdict }));
        }
        "subscribe" => {
            let topic = payload["topic"].as_str().unwrap_or_default().to_string();
            if behavior.reject_topic.as_deref() == Some(topic.as_str()) {
                ack(&state, id, json!({ "success": false, "reason": "topic not allowed" }));
                return;
            }
            state.subscriptions.push((
                payload["sourceUuid"].as_str().unwrap_or_default().to_string(),
                payload["sourceWindowName"].as_str().unwrap_or_default().to_string(),
                topic,
            ));
            ack(&state, id, json!({ "success": true }));
        }
        "unsubscribe" => {
            let key = (
                payload["sourceUuid"].as_str().unwrap_or_default().to_string(),
                payload["sourceWindowName"].as_str().unwrap_or_default().to_string(),
                payload["topic"].as_str().unwrap_or_default().to_string(),
            );
            state.subscriptions.retain(|s| *s != key);
            ack(&state, id, json!({ "success": true }));
        }
        "publish-message" => {
            ack(&state, id, json!({ "success": true }));
            let uuid = state.client_uuid.clone();
            let topic = payload["topic"].as_str().unwrap_or_default().to_string();
            push(&state, process_message(&uuid, &uuid, &topic, payload["message"].clone()));
        }
        "create-application" => ack(&state, id, json!({ "success": true })),
        "run-application" => {
            if behavior.reject_run {
                ack(&state, id, json!({ "success": false, "reason": "cannot run" }));
            } else {
                ack(&state, id, json!({ "success": true }));
            }
        }
        "send-message" => {
            ack(&state, id, json!({ "success": true }));
            let gw = state.gateway_id();
            let topic = payload["topic"].as_str().unwrap_or_default().to_string();
            let message = payload["message"].clone();
            if topic == format!("{gw}-exec") {
                agent(shared, &mut state, message);
            } else if topic.starts_with(&format!("{gw}-listener-")) {
                state.listener_replies.push((topic, message));
            } else if payload["destinationUuid"] == state.client_uuid.as_str() {
                let uuid = state.client_uuid.clone();
                push(&state, process_message(&uuid, &uuid, &topic, message));
            }
        }
        // Never acknowledged; exercises request deadlines.
        "hang" => {}
        _ => ack(&state, id, json!({ "success": false, "reason": "unknown action" })),
    }
}

/// Emulates the agent application answering one RPC envelope.
fn agent(shared: &Arc<Shared>, state: &mut State, envelope: Value) {
    let message_id = envelope["messageId"].clone();
    let action = envelope["action"].as_str().unwrap_or_default().to_string();
    let payload = envelope["payload"].clone();
    let gw = state.gateway_id();
    let exec = format!("{gw}-exec");

    let reply = |state: &State, action: &str, body: Value| {
        let message = json!({ "messageId": message_id, "action": action, "payload": body });
        push(state, process_message(&gw, &gw, &exec, message));
    };
    let fail = |state: &State, error: String| {
        reply(state, "error", json!({ "error": error, "requestPayload": payload }));
    };

    let target = payload["proxyObjId"].as_str().map(str::to_string);
    if let Some(target) = &target {
        if matches!(action.as_str(), "invoke" | "add-listener" | "remove-listener")
            && !state.refs.contains(target)
        {
            fail(state, format!("{action} error, proxyObject removed already"));
            return;
        }
    }

    match action.as_str() {
        "ping" => reply(state, "pong", json!({})),
        "quit" => reply(state, "quit-received", json!({})),
        "delete" => {
            let id = payload.as_str().unwrap_or_default();
            if state.refs.remove(id) {
                reply(state, "delete-result", json!({}));
            } else {
                fail(state, "delete error, proxyObject removed already".into());
            }
        }
        "invoke" => {
            let method = payload["method"].as_str().unwrap_or_default().to_string();
            let args = payload.get("args").cloned().unwrap_or_else(|| json!([]));
            let result = match method.as_str() {
                "fin.System.getVersion" => Some(json!(RUNTIME_VERSION)),
                "echo" => Some(args),
                "fast" => Some(json!("fast")),
                "wrap" => Some(json!({ "identity": args[0] })),
                "getInfo" => Some(json!({ "name": "info", "target": target })),
                "fin.System.showDeveloperTools"
                | "fin.Application.start"
                | "fin.Application.startFromManifest" => None,
                "silent" => return,
                "slow" => {
                    let message = json!({
                        "messageId": message_id,
                        "action": "invoke-result",
                        "payload": { "result": "slow" },
                    });
                    let frame = process_message(&gw, &gw, &exec, message);
                    let shared = Arc::clone(shared);
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        push(&shared.state.lock().unwrap(), frame);
                    });
                    return;
                }
                "fail" => {
                    fail(state, "invoke error, boom".into());
                    return;
                }
                other => {
                    fail(state, format!("invoke error, invalid method: {other}"));
                    return;
                }
            };

            let mut body = json!({});
            if let Some(result) = result {
                body["result"] = result;
            }
            if payload["proxyResult"] == true {
                body["proxyObjId"] = json!(new_ref(state));
            }
            reply(state, "invoke-result", body);
        }
        "add-listener" => {
            if payload["method"] == "failListen" {
                fail(state, "add-listener error, cannot listen".into());
                return;
            }
            let topic = payload["iabTopic"].as_str().unwrap_or_default().to_string();
            state.listener_topics.push(topic);
            let mut body = json!({});
            if payload["proxyResult"] == true {
                body["proxyObjId"] = json!(new_ref(state));
            }
            reply(state, "add-listener-result", body);
        }
        "remove-listener" => {
            let listener = payload["proxyListenerId"].as_str().unwrap_or_default();
            if state.refs.contains(listener) {
                reply(state, "remove-listener-result", payload.clone());
            } else {
                fail(state, "remove-listener error, proxyListener removed already".into());
            }
        }
        other => fail(state, format!("unknown action {other}")),
    }
}

fn new_ref(state: &mut State) -> String {
    let id = format!("proxy-{}", state.next_ref);
    state.next_ref += 1;
    state.refs.insert(id.clone());
    id
}
