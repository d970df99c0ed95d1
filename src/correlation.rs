//! Request/response multiplexer.
//!
//! Maps message ids to waiting callers. The same mechanism backs two
//! independent layers: the connection's `ack` table and each gateway
//! session's RPC table.
//!
//! # Flow
//!
//! 1. Caller calls [`Multiplexer::register`] and gets a [`PendingRequest`]
//!    carrying a fresh id.
//! 2. Caller writes its request tagged with that id.
//! 3. The inbound path calls [`Multiplexer::complete`] with the id echoed by
//!    the remote side.
//! 4. Caller awaits [`PendingRequest::wait`], which resolves with the
//!    response or fails once the deadline expires.
//!
//! An entry leaves the table exactly once: on completion, on deadline
//! expiry, when the `PendingRequest` is dropped, or on [`Multiplexer::fail_all`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// A waiter registered in the table.
struct Pending<T> {
    reply: oneshot::Sender<Result<T>>,
    created_at: Instant,
}

type Entries<T> = Arc<DashMap<u64, Pending<T>>>;

/// Correlation table with monotonic ids and per-entry deadlines.
pub struct Multiplexer<T> {
    label: &'static str,
    next_id: AtomicU64,
    entries: Entries<T>,
    default_timeout: Duration,
}

impl<T> std::fmt::Debug for Multiplexer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("label", &self.label)
            .field("pending", &self.entries.len())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl<T> Multiplexer<T> {
    /// Create an empty table. `label` names the table in logs and timeout
    /// errors (e.g. `"ack"`, `"rpc"`).
    #[must_use]
    pub fn new(label: &'static str, default_timeout: Duration) -> Self {
        Self {
            label,
            next_id: AtomicU64::new(0),
            entries: Arc::new(DashMap::new()),
            default_timeout,
        }
    }

    /// Allocate a fresh id and register a waiter for it.
    pub fn register(&self) -> PendingRequest<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.entries.insert(
            id,
            Pending {
                reply,
                created_at: Instant::now(),
            },
        );
        log::trace!("[{}] registered #{} ({} pending)", self.label, id, self.entries.len());

        PendingRequest {
            id,
            label: self.label,
            rx,
            entries: Arc::clone(&self.entries),
            default_timeout: self.default_timeout,
        }
    }

    /// Resolve the waiter registered under `id`.
    ///
    /// Returns `false` when no entry exists (unknown, expired, or abandoned).
    pub fn complete(&self, id: u64, result: Result<T>) -> bool {
        let Some((_, pending)) = self.entries.remove(&id) else {
            log::warn!("[{}] response for unknown or expired id #{}", self.label, id);
            return false;
        };

        let elapsed = pending.created_at.elapsed();
        if pending.reply.send(result).is_err() {
            log::debug!("[{}] waiter for #{} already gone", self.label, id);
            return false;
        }
        log::trace!("[{}] completed #{} in {:?}", self.label, id, elapsed);
        true
    }

    /// Fail every outstanding entry with [`Error::Closed`].
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, pending)) = self.entries.remove(&id) {
                let _ = pending.reply.send(Err(Error::Closed(reason.to_string())));
                failed += 1;
            }
        }
        if failed > 0 {
            log::debug!("[{}] failed {} pending entries: {}", self.label, failed, reason);
        }
        failed
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `id` is still waiting for a response.
    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Deadline applied by [`PendingRequest::wait`].
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }
}

/// Handle for one registered waiter.
///
/// Dropping it without awaiting removes the entry from its table.
pub struct PendingRequest<T> {
    id: u64,
    label: &'static str,
    rx: oneshot::Receiver<Result<T>>,
    entries: Entries<T>,
    default_timeout: Duration,
}

impl<T> std::fmt::Debug for PendingRequest<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("label", &self.label)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<T> PendingRequest<T> {
    /// Id to put on the outgoing request.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Await the response using the table's default deadline.
    pub async fn wait(self) -> Result<T> {
        let timeout = self.default_timeout;
        self.wait_for(timeout).await
    }

    /// Await the response, failing with [`Error::Timeout`] after `timeout`.
    pub async fn wait_for(mut self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed(format!(
                "{} #{} dropped without a response",
                self.label, self.id
            ))),
            Err(_) => {
                log::warn!("[{}] #{} timed out after {:?}", self.label, self.id, timeout);
                Err(Error::Timeout {
                    what: format!("{} #{}", self.label, self.id),
                    after: timeout,
                })
            }
        }
    }
}

impl<T> Drop for PendingRequest<T> {
    fn drop(&mut self) {
        // No-op when the entry was already completed or failed.
        self.entries.remove(&self.id);
    }
}
