//! Handles for objects living inside the runtime.
//!
//! A [`ProxyObject`] stands for a value the agent kept a reference to; its
//! methods forward to the owning [`Gateway`] with itself as the call target.
//! Handles are plain values: nothing is released on drop, callers dispose
//! explicitly.

use std::sync::{Arc, OnceLock};

use serde_json::{Map, Value};

use crate::bus::MessageListener;
use crate::error::Result;
use crate::gateway::{EventHandler, Gateway};
use crate::protocol::field;

struct ProxyObjectInner {
    id: Value,
    descriptor: Option<Value>,
    invoker: Option<ProxyObject>,
    gateway: Gateway,
}

/// Remote object reference.
#[derive(Clone)]
pub struct ProxyObject {
    inner: Arc<ProxyObjectInner>,
}

impl std::fmt::Debug for ProxyObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyObject")
            .field("id", &self.inner.id)
            .field("invoker", &self.inner.invoker.as_ref().map(ProxyObject::id))
            .finish_non_exhaustive()
    }
}

impl ProxyObject {
    pub(crate) fn new(
        id: Value,
        descriptor: Option<Value>,
        invoker: Option<ProxyObject>,
        gateway: Gateway,
    ) -> Self {
        Self {
            inner: Arc::new(ProxyObjectInner {
                id,
                descriptor,
                invoker,
                gateway,
            }),
        }
    }

    /// Agent-side reference id.
    pub fn id(&self) -> &Value {
        &self.inner.id
    }

    /// Decoded object returned alongside the reference, when it was an object.
    pub fn descriptor(&self) -> Option<&Value> {
        self.inner.descriptor.as_ref()
    }

    /// Proxy whose method produced this one.
    pub fn invoker(&self) -> Option<&ProxyObject> {
        self.inner.invoker.as_ref()
    }

    /// Session owning the reference.
    pub fn gateway(&self) -> &Gateway {
        &self.inner.gateway
    }

    /// Call an instance method.
    pub async fn invoke(&self, method: &str, args: &[Value]) -> Result<InvokeResult> {
        self.inner.gateway.call(false, Some(self), method, args).await
    }

    /// Call an instance method and keep a reference to its result.
    pub async fn invoke_for_proxy(&self, method: &str, args: &[Value]) -> Result<InvokeResult> {
        self.inner.gateway.call(true, Some(self), method, args).await
    }

    /// Call an instance method, choosing whether to keep a result reference.
    pub async fn call(
        &self,
        create_proxy: bool,
        method: &str,
        args: &[Value],
    ) -> Result<InvokeResult> {
        self.inner.gateway.call(create_proxy, Some(self), method, args).await
    }

    /// Attach `handler` to `method` for `event`, keeping a listener reference.
    pub async fn add_listener(
        &self,
        method: &str,
        event: Option<&str>,
        handler: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
    ) -> Result<Option<ProxyListener>> {
        self.inner
            .gateway
            .add_event_listener(true, Some(self), method, event, Arc::new(handler))
            .await
    }

    /// Register an action callback passed after `args` at index 1.
    pub async fn add_action_listener(
        &self,
        create_proxy_listener: bool,
        method: &str,
        handler: impl Fn(Value) -> Option<Value> + Send + Sync + 'static,
        args: &[Value],
    ) -> Result<Option<ProxyListener>> {
        let handler: EventHandler = Arc::new(handler);
        self.inner
            .gateway
            .add_listener_with(create_proxy_listener, Some(self), method, handler, 1, args)
            .await
    }

    /// Detach `listener` from this object's `method`/`event`.
    pub async fn remove_listener(
        &self,
        method: &str,
        event: &str,
        listener: &ProxyListener,
    ) -> Result<()> {
        self.inner
            .gateway
            .remove_listener(Some(self), method, event, listener)
            .await
    }

    /// Release the agent's reference. A second dispose fails remotely.
    pub async fn dispose(&self) -> Result<()> {
        self.inner.gateway.delete_proxy_object(&self.inner.id).await
    }
}

/// Remote listener reference returned by `add_listener` calls.
pub struct ProxyListener {
    id: Value,
    topic: String,
    listener: MessageListener,
    invoker: Option<ProxyObject>,
    gateway: Gateway,
}

impl std::fmt::Debug for ProxyListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyListener")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl ProxyListener {
    pub(crate) fn new(
        id: Value,
        topic: String,
        listener: MessageListener,
        invoker: Option<ProxyObject>,
        gateway: Gateway,
    ) -> Self {
        Self {
            id,
            topic,
            listener,
            invoker,
            gateway,
        }
    }

    /// Agent-side listener reference id.
    pub fn id(&self) -> &Value {
        &self.id
    }

    /// Bus topic the callback listens on.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Object the listener was attached to, if any.
    pub fn invoker(&self) -> Option<&ProxyObject> {
        self.invoker.as_ref()
    }

    /// Stop receiving callbacks and release the agent's reference.
    ///
    /// The callback stays attached to the remote event source; use
    /// `remove_listener` to detach it there as well.
    pub async fn dispose(self) -> Result<()> {
        self.unsubscribe().await?;
        self.gateway.delete_proxy_object(&self.id).await
    }

    pub(crate) async fn unsubscribe(&self) -> Result<()> {
        self.gateway
            .bus()
            .unsubscribe(Some(self.gateway.identity()), &self.topic, &self.listener)
            .await
    }
}

/// Decoded response of an `invoke`.
pub struct InvokeResult {
    result: Option<Value>,
    proxy_id: Option<Value>,
    invoker: Option<ProxyObject>,
    gateway: Gateway,
    proxy: OnceLock<Option<ProxyObject>>,
}

impl std::fmt::Debug for InvokeResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeResult")
            .field("result", &self.result)
            .field("proxy_id", &self.proxy_id)
            .finish_non_exhaustive()
    }
}

impl InvokeResult {
    pub(crate) fn new(response: Value, invoker: Option<ProxyObject>, gateway: Gateway) -> Self {
        let mut response = match response {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            result: response.remove(field::RESULT),
            proxy_id: response.remove(field::PROXY_OBJ_ID),
            invoker,
            gateway,
            proxy: OnceLock::new(),
        }
    }

    /// Raw result; `None` when the method returned nothing.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Agent-side reference id when one was requested.
    pub fn proxy_id(&self) -> Option<&Value> {
        self.proxy_id.as_ref()
    }

    /// Handle for the kept reference, built on first access.
    pub fn proxy_object(&self) -> Option<&ProxyObject> {
        self.proxy
            .get_or_init(|| {
                let id = self.proxy_id.clone()?;
                let descriptor = self.result.clone().filter(Value::is_object);
                Some(ProxyObject::new(id, descriptor, self.invoker.clone(), self.gateway.clone()))
            })
            .as_ref()
    }

    /// Result as a string.
    pub fn as_str(&self) -> Option<&str> {
        self.result.as_ref().and_then(Value::as_str)
    }

    /// Result as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        self.result.as_ref().and_then(Value::as_bool)
    }

    /// Result as a signed integer.
    pub fn as_i64(&self) -> Option<i64> {
        self.result.as_ref().and_then(Value::as_i64)
    }

    /// Result as a float.
    pub fn as_f64(&self) -> Option<f64> {
        self.result.as_ref().and_then(Value::as_f64)
    }

    /// Result as a JSON object.
    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.result.as_ref().and_then(Value::as_object)
    }

    /// Result as a JSON array.
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        self.result.as_ref().and_then(Value::as_array)
    }

    /// Deserialize the result into `T`.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.result.clone().unwrap_or(Value::Null))?)
    }
}
