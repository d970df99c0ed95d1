//! Inter-application bus.
//!
//! Topic-addressed publish/subscribe layered on the connection. Listeners
//! are registered under a [`SubscriptionKey`] of
//! `(sourceUuid | "*", sourceName | "*", topic)`; several local listeners may
//! share one key, and the wire-level `subscribe` / `unsubscribe` is only sent
//! when the first listener arrives or the last one leaves.
//!
//! # Delivery
//!
//! An inbound `process-message` from `uuid/name` on topic `T` is delivered
//! independently to three listener groups:
//!
//! ```text
//! (uuid, name, T)   exact source
//! (uuid, "*",  T)   any window of the application
//! ("*",  "*",  T)   any source
//! ```
//!
//! A panicking listener is logged and skipped; the others still run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;

use crate::error::{Error, Result};
use crate::protocol::{ack_succeeded, action, BusDelivery, Identity};

/// Wildcard used for an unspecified source uuid or window name.
pub const WILDCARD: &str = "*";

/// Request/ack transport the bus sends its wire actions through.
///
/// Implemented by the connection; tests substitute a recording fake.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `action` with `payload` and resolve with the ack payload.
    async fn send_message(&self, action: &str, payload: Value) -> Result<Value>;
}

/// Listener registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    /// Source application uuid or `*`.
    pub uuid: String,
    /// Source window name or `*`.
    pub name: String,
    /// Topic.
    pub topic: String,
}

impl SubscriptionKey {
    /// Key for `topic` from `source`; a missing source, or an empty uuid or
    /// name, becomes `*`.
    pub fn new(source: Option<&Identity>, topic: &str) -> Self {
        let wild = |s: &str| {
            if s.is_empty() {
                WILDCARD.to_string()
            } else {
                s.to_string()
            }
        };
        match source {
            Some(identity) => Self {
                uuid: wild(&identity.uuid),
                name: wild(&identity.name),
                topic: topic.to_string(),
            },
            None => Self {
                uuid: WILDCARD.to_string(),
                name: WILDCARD.to_string(),
                topic: topic.to_string(),
            },
        }
    }

    fn from_parts(uuid: &str, name: &str, topic: &str) -> Self {
        Self {
            uuid: uuid.to_string(),
            name: name.to_string(),
            topic: topic.to_string(),
        }
    }

    /// Payload of the wire `subscribe` / `unsubscribe` actions.
    fn wire_payload(&self) -> Value {
        serde_json::json!({
            "sourceUuid": self.uuid,
            "sourceWindowName": self.name,
            "topic": self.topic,
        })
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}::{}", self.uuid, self.name, self.topic)
    }
}

type Callback = dyn Fn(&Identity, &Value) + Send + Sync;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(0);

/// A bus listener.
///
/// Cloning shares the callback; clones compare equal, so the same handle
/// passed to `subscribe` must be passed to `unsubscribe`.
#[derive(Clone)]
pub struct MessageListener {
    id: u64,
    callback: Arc<Callback>,
}

impl MessageListener {
    /// Wrap a callback receiving `(source identity, message)`.
    pub fn new(callback: impl Fn(&Identity, &Value) + Send + Sync + 'static) -> Self {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(callback),
        }
    }

    fn call(&self, source: &Identity, message: &Value) {
        (self.callback)(source, message);
    }
}

impl PartialEq for MessageListener {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MessageListener {}

impl std::fmt::Debug for MessageListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageListener")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

struct BusInner {
    transport: Arc<dyn Transport>,
    listeners: DashMap<SubscriptionKey, Vec<MessageListener>>,
    transitions: DashMap<SubscriptionKey, Arc<tokio::sync::Mutex<()>>>,
}

/// Publish/subscribe bus bound to one transport.
#[derive(Clone)]
pub struct InterAppBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for InterAppBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterAppBus")
            .field("keys", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl InterAppBus {
    /// Create a bus sending its wire actions through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                transport,
                listeners: DashMap::new(),
                transitions: DashMap::new(),
            }),
        }
    }

    /// Broadcast `message` to every subscriber of `topic`.
    pub async fn publish(&self, topic: &str, message: Value) -> Result<()> {
        let payload = serde_json::json!({ "topic": topic, "message": message });
        self.request(action::PUBLISH_MESSAGE, payload).await
    }

    /// Send `message` on `topic` to one destination identity.
    pub async fn send(&self, destination: &Identity, topic: &str, message: Value) -> Result<()> {
        let payload = serde_json::json!({
            "destinationUuid": destination.uuid,
            "destinationWindowName": destination.name,
            "topic": topic,
            "message": message,
        });
        self.request(action::SEND_MESSAGE, payload).await
    }

    /// Register `listener` for messages on `topic` from `source`
    /// (`None` = any source).
    ///
    /// The first listener for a key sends the wire `subscribe` and is only
    /// registered once the runtime acknowledges it. Callers racing on the
    /// same key wait for that outcome: after a rejection each of them retries
    /// the wire `subscribe` itself, so no listener is ever registered on a
    /// key the runtime refused.
    pub async fn subscribe(
        &self,
        source: Option<&Identity>,
        topic: &str,
        listener: MessageListener,
    ) -> Result<()> {
        let key = SubscriptionKey::new(source, topic);
        let transition = self.lock_key(&key).await;
        let result = self.subscribe_locked(&key, listener).await;
        self.unlock_key(&key, transition);
        result
    }

    async fn subscribe_locked(
        &self,
        key: &SubscriptionKey,
        listener: MessageListener,
    ) -> Result<()> {
        let active = self
            .inner
            .listeners
            .get(key)
            .is_some_and(|list| !list.is_empty());

        if active {
            log::debug!("[Bus] Added listener to existing subscription {}", key);
        } else {
            log::debug!("[Bus] Subscribing {}", key);
            if let Err(e) = self.request(action::SUBSCRIBE, key.wire_payload()).await {
                log::warn!("[Bus] Subscribe {} failed: {}", key, e);
                return Err(e);
            }
        }

        self.inner.listeners.entry(key.clone()).or_default().push(listener);
        Ok(())
    }

    /// Remove `listener` registered for `topic` from `source`.
    ///
    /// Sends the wire `unsubscribe` only when it was the key's last listener.
    /// A `subscribe` for the same key issued meanwhile waits until the
    /// runtime has acknowledged the `unsubscribe`, then subscribes again.
    pub async fn unsubscribe(
        &self,
        source: Option<&Identity>,
        topic: &str,
        listener: &MessageListener,
    ) -> Result<()> {
        let key = SubscriptionKey::new(source, topic);
        let transition = self.lock_key(&key).await;
        let result = self.unsubscribe_locked(&key, listener).await;
        self.unlock_key(&key, transition);
        result
    }

    async fn unsubscribe_locked(
        &self,
        key: &SubscriptionKey,
        listener: &MessageListener,
    ) -> Result<()> {
        let now_empty = match self.inner.listeners.get_mut(key) {
            None => {
                log::debug!("[Bus] Unsubscribe for unknown key {}", key);
                return Ok(());
            }
            Some(mut list) => {
                let before = list.len();
                list.retain(|l| l != listener);
                if list.len() == before {
                    log::debug!("[Bus] Listener not registered under {}", key);
                    return Ok(());
                }
                list.is_empty()
            }
        };

        if !now_empty {
            return Ok(());
        }

        self.inner.listeners.remove_if(key, |_, list| list.is_empty());
        log::debug!("[Bus] Unsubscribing {}", key);
        self.request(action::UNSUBSCRIBE, key.wire_payload()).await
    }

    /// Number of local listeners registered under `(source, topic)`.
    pub fn listener_count(&self, source: Option<&Identity>, topic: &str) -> usize {
        let key = SubscriptionKey::new(source, topic);
        self.inner.listeners.get(&key).map_or(0, |list| list.len())
    }

    /// Deliver an inbound `process-message` payload to matching listeners.
    pub fn process_message(&self, payload: &Value) {
        let delivery: BusDelivery = match serde_json::from_value(payload.clone()) {
            Ok(d) => d,
            Err(e) => {
                log::warn!("[Bus] Malformed process-message payload: {}", e);
                return;
            }
        };
        let source = delivery.source();

        let keys = [
            SubscriptionKey::from_parts(
                &delivery.source_uuid,
                &delivery.source_window_name,
                &delivery.topic,
            ),
            SubscriptionKey::from_parts(&delivery.source_uuid, WILDCARD, &delivery.topic),
            SubscriptionKey::from_parts(WILDCARD, WILDCARD, &delivery.topic),
        ];

        for (i, key) in keys.iter().enumerate() {
            if keys[..i].contains(key) {
                continue;
            }
            self.deliver(key, &source, &delivery.message);
        }
    }

    fn deliver(&self, key: &SubscriptionKey, source: &Identity, message: &Value) {
        // Snapshot so listeners may (un)subscribe without holding the shard lock.
        let Some(listeners) = self.inner.listeners.get(key).map(|list| list.clone()) else {
            return;
        };

        log::trace!("[Bus] Delivering {} to {} listener(s)", key, listeners.len());
        for listener in &listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.call(source, message))).is_err() {
                log::error!("[Bus] Listener {:?} panicked handling {}", listener, key);
            }
        }
    }

    /// Hold the first-subscribe / last-unsubscribe transition of `key`
    /// across its wire round-trip.
    async fn lock_key(&self, key: &SubscriptionKey) -> OwnedMutexGuard<()> {
        let gate = Arc::clone(&*self.inner.transitions.entry(key.clone()).or_default());
        gate.lock_owned().await
    }

    fn unlock_key(&self, key: &SubscriptionKey, transition: OwnedMutexGuard<()>) {
        drop(transition);
        // Only the map still holds the gate once nobody waits on it.
        self.inner
            .transitions
            .remove_if(key, |_, gate| Arc::strong_count(gate) == 1);
    }

    async fn request(&self, action: &str, payload: Value) -> Result<()> {
        let ack = self.inner.transport.send_message(action, payload).await?;
        if ack_succeeded(&ack) {
            Ok(())
        } else {
            Err(Error::rejected(action, &ack))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Transport fake that records every wire action and acks it.
    ///
    /// Sends of the `gated` action park until [`RecordingTransport::release`].
    pub(crate) struct RecordingTransport {
        pub(crate) sent: Mutex<Vec<(String, Value)>>,
        pub(crate) reject: Mutex<Option<String>>,
        pub(crate) gated: Mutex<Option<String>>,
        permits: tokio::sync::Semaphore,
    }

    impl Default for RecordingTransport {
        fn default() -> Self {
            Self {
                sent: Mutex::default(),
                reject: Mutex::default(),
                gated: Mutex::default(),
                permits: tokio::sync::Semaphore::new(0),
            }
        }
    }

    impl RecordingTransport {
        pub(crate) fn actions(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(a, _)| a.clone()).collect()
        }

        pub(crate) fn count(&self, action: &str) -> usize {
            self.actions().iter().filter(|a| *a == action).count()
        }

        /// Let `n` parked sends complete.
        pub(crate) fn release(&self, n: usize) {
            self.permits.add_permits(n);
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_message(&self, action: &str, payload: Value) -> Result<Value> {
            self.sent.lock().unwrap().push((action.to_string(), payload));
            let gated = self.gated.lock().unwrap().as_deref() == Some(action);
            if gated {
                self.permits.acquire().await.unwrap().forget();
            }
            if self.reject.lock().unwrap().as_deref() == Some(action) {
                return Ok(serde_json::json!({ "success": false, "reason": "denied" }));
            }
            Ok(serde_json::json!({ "success": true }))
        }
    }

    async fn settle(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cond()
    }

    fn bus() -> (InterAppBus, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let bus = InterAppBus::new(Arc::clone(&transport) as Arc<dyn Transport>);
        (bus, transport)
    }

    fn counting_listener() -> (MessageListener, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let listener = MessageListener::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (listener, count)
    }

    fn delivery(uuid: &str, name: &str, topic: &str) -> Value {
        serde_json::json!({
            "sourceUuid": uuid,
            "sourceWindowName": name,
            "topic": topic,
            "message": { "hello": "world" },
        })
    }

    #[test]
    fn test_subscription_key_wildcards() {
        let key = SubscriptionKey::new(None, "news");
        assert_eq!(key.to_string(), "*::*::news");

        let app = Identity::new("app", "");
        let key = SubscriptionKey::new(Some(&app), "news");
        assert_eq!(key.to_string(), "app::*::news");
    }

    #[tokio::test]
    async fn test_shared_key_sends_one_subscribe_and_one_unsubscribe() {
        let (bus, transport) = bus();
        let (a, _) = counting_listener();
        let (b, _) = counting_listener();

        bus.subscribe(None, "news", a.clone()).await.unwrap();
        bus.subscribe(None, "news", b.clone()).await.unwrap();
        assert_eq!(transport.count("subscribe"), 1);
        assert_eq!(bus.listener_count(None, "news"), 2);

        bus.unsubscribe(None, "news", &a).await.unwrap();
        assert_eq!(transport.count("unsubscribe"), 0);

        bus.unsubscribe(None, "news", &b).await.unwrap();
        assert_eq!(transport.count("unsubscribe"), 1);
        assert_eq!(bus.listener_count(None, "news"), 0);
    }

    #[tokio::test]
    async fn test_subscribe_wire_payload() {
        let (bus, transport) = bus();
        let (a, _) = counting_listener();
        let source = Identity::new("app", "main");
        bus.subscribe(Some(&source), "news", a).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        let (action, payload) = &sent[0];
        assert_eq!(action, "subscribe");
        assert_eq!(payload["sourceUuid"], "app");
        assert_eq!(payload["sourceWindowName"], "main");
        assert_eq!(payload["topic"], "news");
    }

    #[tokio::test]
    async fn test_rejected_subscribe_rolls_back_listener() {
        let (bus, transport) = bus();
        *transport.reject.lock().unwrap() = Some("subscribe".to_string());
        let (a, _) = counting_listener();

        let err = bus.subscribe(None, "news", a).await.unwrap_err();
        assert_eq!(err.to_string(), "subscribe rejected: denied");
        assert_eq!(bus.listener_count(None, "news"), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_listener_is_noop() {
        let (bus, transport) = bus();
        let (a, _) = counting_listener();
        bus.unsubscribe(None, "news", &a).await.unwrap();
        assert!(transport.actions().is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_and_exact_listeners_both_receive() {
        let (bus, _) = bus();
        let (any, any_count) = counting_listener();
        let (exact, exact_count) = counting_listener();
        let (app_only, app_count) = counting_listener();
        let (other, other_count) = counting_listener();

        bus.subscribe(None, "news", any).await.unwrap();
        bus.subscribe(Some(&Identity::new("app", "main")), "news", exact).await.unwrap();
        bus.subscribe(Some(&Identity::new("app", "*")), "news", app_only).await.unwrap();
        bus.subscribe(Some(&Identity::new("other", "main")), "news", other).await.unwrap();

        bus.process_message(&delivery("app", "main", "news"));

        assert_eq!(any_count.load(Ordering::SeqCst), 1);
        assert_eq!(exact_count.load(Ordering::SeqCst), 1);
        assert_eq!(app_count.load(Ordering::SeqCst), 1);
        assert_eq!(other_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_other_topic_not_delivered() {
        let (bus, _) = bus();
        let (any, count) = counting_listener();
        bus.subscribe(None, "news", any).await.unwrap();
        bus.process_message(&delivery("app", "main", "weather"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_panicking_listener_does_not_block_others() {
        let (bus, _) = bus();
        let bad = MessageListener::new(|_, _| panic!("listener failure"));
        let (good, count) = counting_listener();

        bus.subscribe(None, "news", bad).await.unwrap();
        bus.subscribe(None, "news", good).await.unwrap();
        bus.process_message(&delivery("app", "main", "news"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_receives_source_and_message() {
        let (bus, _) = bus();
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        let listener = MessageListener::new(move |src, msg| {
            *s.lock().unwrap() = Some((src.clone(), msg.clone()));
        });
        bus.subscribe(None, "news", listener).await.unwrap();
        bus.process_message(&delivery("app", "main", "news"));

        let (src, msg) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(src, Identity::new("app", "main"));
        assert_eq!(msg["hello"], "world");
    }

    #[tokio::test]
    async fn test_publish_and_send_payloads() {
        let (bus, transport) = bus();
        bus.publish("news", serde_json::json!({ "n": 1 })).await.unwrap();
        bus.send(&Identity::new("app", "main"), "news", serde_json::json!("hi"))
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].0, "publish-message");
        assert_eq!(sent[0].1["topic"], "news");
        assert_eq!(sent[0].1["message"]["n"], 1);
        assert_eq!(sent[1].0, "send-message");
        assert_eq!(sent[1].1["destinationUuid"], "app");
        assert_eq!(sent[1].1["destinationWindowName"], "main");
        assert_eq!(sent[1].1["message"], "hi");
    }

    #[tokio::test]
    async fn test_rejected_publish_surfaces_reason() {
        let (bus, transport) = bus();
        *transport.reject.lock().unwrap() = Some("publish-message".to_string());
        let err = bus.publish("news", Value::Null).await.unwrap_err();
        assert!(matches!(err, Error::Subscription { .. }));
    }

    #[tokio::test]
    async fn test_subscribe_during_final_unsubscribe_resubscribes_after_it() {
        let (bus, transport) = bus();
        let (a, _) = counting_listener();
        let (c, c_count) = counting_listener();
        bus.subscribe(None, "news", a.clone()).await.unwrap();
        *transport.gated.lock().unwrap() = Some("unsubscribe".to_string());

        let leaving = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.unsubscribe(None, "news", &a).await })
        };
        assert!(settle(|| transport.count("unsubscribe") == 1).await);

        let joining = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.subscribe(None, "news", c).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(transport.count("subscribe"), 1, "joiner must wait for the unsubscribe");

        transport.release(1);
        leaving.await.unwrap().unwrap();
        joining.await.unwrap().unwrap();

        assert_eq!(transport.actions(), ["subscribe", "unsubscribe", "subscribe"]);
        assert_eq!(bus.listener_count(None, "news"), 1);
        bus.process_message(&delivery("app", "main", "news"));
        assert_eq!(c_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_joining_rejected_subscribe_is_not_registered() {
        let (bus, transport) = bus();
        *transport.gated.lock().unwrap() = Some("subscribe".to_string());
        *transport.reject.lock().unwrap() = Some("subscribe".to_string());
        let (a, _) = counting_listener();
        let (b, _) = counting_listener();

        let first = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.subscribe(None, "news", a).await })
        };
        assert!(settle(|| transport.count("subscribe") == 1).await);
        let second = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.subscribe(None, "news", b).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(bus.listener_count(None, "news"), 0);

        transport.release(2);
        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_err());
        assert_eq!(bus.listener_count(None, "news"), 0);
        assert_eq!(transport.actions(), ["subscribe", "subscribe"]);
    }

    #[tokio::test]
    async fn test_transition_gates_are_released() {
        let (bus, _) = bus();
        let (a, _) = counting_listener();
        bus.subscribe(None, "news", a.clone()).await.unwrap();
        bus.unsubscribe(None, "news", &a).await.unwrap();
        assert!(bus.inner.transitions.is_empty());
    }

    #[test]
    fn test_malformed_delivery_is_ignored() {
        let (bus, _) = bus();
        bus.process_message(&serde_json::json!({ "topic": 5 }));
    }
}
