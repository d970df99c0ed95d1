//! Wire protocol shared by the connection, bus, and gateway layers.
//!
//! Every frame is a UTF-8 JSON text document:
//!
//! ```text
//! { "action": "<name>", "messageId": <int>?, "payload": <any> }
//! ```
//!
//! Acknowledgements additionally carry a top-level `correlationId` naming the
//! `messageId` they answer. Session-scoped RPC messages travel inside bus
//! messages and use the same envelope shape with their own id space.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Connection-level action names.
pub mod action {
    /// Client → runtime: open the handshake.
    pub const REQUEST_EXTERNAL_AUTHORIZATION: &str = "request-external-authorization";
    /// Runtime → client: write this token to this file.
    pub const EXTERNAL_AUTHORIZATION_RESPONSE: &str = "external-authorization-response";
    /// Client → runtime: token written, please verify.
    pub const REQUEST_AUTHORIZATION: &str = "request-authorization";
    /// Runtime → client: handshake result.
    pub const AUTHORIZATION_RESPONSE: &str = "authorization-response";
    /// Runtime → client: response to a `messageId`.
    pub const ACK: &str = "ack";
    /// Runtime → client: inter-application bus delivery.
    pub const PROCESS_MESSAGE: &str = "process-message";
    /// Create an application from an option document.
    pub const CREATE_APPLICATION: &str = "create-application";
    /// Run a previously created application.
    pub const RUN_APPLICATION: &str = "run-application";
    /// Register a bus subscription.
    pub const SUBSCRIBE: &str = "subscribe";
    /// Drop a bus subscription.
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Broadcast on a topic.
    pub const PUBLISH_MESSAGE: &str = "publish-message";
    /// Targeted send on a topic.
    pub const SEND_MESSAGE: &str = "send-message";
}

/// Session-scoped RPC action names (carried inside bus messages).
pub mod rpc {
    /// Call a static or instance method.
    pub const INVOKE: &str = "invoke";
    /// Register a callback with a remote method.
    pub const ADD_LISTENER: &str = "add-listener";
    /// Detach a callback from a remote method.
    pub const REMOVE_LISTENER: &str = "remove-listener";
    /// Release a remote reference.
    pub const DELETE: &str = "delete";
    /// Liveness check.
    pub const PING: &str = "ping";
    /// Stop the remote gateway application.
    pub const QUIT: &str = "quit";
    /// Remote failure response.
    pub const ERROR: &str = "error";
}

/// Payload field names used by the RPC layer.
pub mod field {
    /// Whether the remote should keep a reference to the result.
    pub const PROXY_RESULT: &str = "proxyResult";
    /// Remote reference id.
    pub const PROXY_OBJ_ID: &str = "proxyObjId";
    /// Remote listener reference id.
    pub const PROXY_LISTENER_ID: &str = "proxyListenerId";
    /// Dotted method path.
    pub const METHOD: &str = "method";
    /// Positional arguments.
    pub const ARGS: &str = "args";
    /// Decoded return value.
    pub const RESULT: &str = "result";
    /// Per-listener callback topic.
    pub const IAB_TOPIC: &str = "iabTopic";
    /// Position of the callback within `args`.
    pub const LISTENER_ARG_IDX: &str = "listenerArgIdx";
    /// Event name for listener removal.
    pub const EVENT: &str = "event";
}

/// Address of a remote window or application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Application uuid.
    pub uuid: String,
    /// Window name within the application.
    pub name: String,
}

impl Identity {
    /// Build an identity from its parts.
    pub fn new(uuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
        }
    }

    /// Identity whose name equals its uuid (an application's main window).
    pub fn application(uuid: impl Into<String>) -> Self {
        let uuid = uuid.into();
        Self {
            name: uuid.clone(),
            uuid,
        }
    }

    /// JSON form `{"uuid": .., "name": ..}`.
    pub fn to_json(&self) -> Value {
        serde_json::json!({ "uuid": self.uuid, "name": self.name })
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.uuid, self.name)
    }
}

/// Outbound frame.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingFrame<'a> {
    /// Action name.
    pub action: &'a str,
    /// Connection-scoped message id (absent for the opening handshake frame).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
    /// Action-specific payload.
    pub payload: &'a Value,
}

/// Inbound frame, parsed leniently: unknown fields are ignored and every
/// field but `action` is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingFrame {
    /// Action name.
    pub action: String,
    /// Id of the request an `ack` answers.
    #[serde(default)]
    pub correlation_id: Option<u64>,
    /// Action-specific payload.
    #[serde(default)]
    pub payload: Value,
}

/// Bus delivery carried by `process-message`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusDelivery {
    /// Sender application uuid.
    pub source_uuid: String,
    /// Sender window name.
    pub source_window_name: String,
    /// Topic the message was sent on.
    pub topic: String,
    /// Message body.
    #[serde(default)]
    pub message: Value,
}

impl BusDelivery {
    /// Identity of the sender.
    pub fn source(&self) -> Identity {
        Identity::new(self.source_uuid.clone(), self.source_window_name.clone())
    }
}

/// Session-scoped RPC envelope (request or response).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcEnvelope {
    /// Session-scoped message id.
    pub message_id: u64,
    /// RPC action (`invoke`, `invoke-result`, `error`, ...).
    pub action: String,
    /// Action-specific payload.
    #[serde(default)]
    pub payload: Value,
}

/// Whether an ack payload reports success. Missing `success` counts as failure.
pub fn ack_succeeded(ack: &Value) -> bool {
    ack.get("success").and_then(Value::as_bool).unwrap_or(false)
}
