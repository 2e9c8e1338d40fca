//! Per-call reply correlation.
//!
//! Every outstanding call registers a single-slot channel under a fresh
//! correlation id. Transports hand incoming replies to [`PendingCalls::complete`],
//! which routes each reply to exactly the call that produced the request.
//! Replies for ids that are no longer pending (timed out, dropped) are discarded.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::Reply;
use crate::error::{CourierError, Result};

/// Unique identifier of one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Table of calls waiting for a reply.
#[derive(Debug, Default)]
pub struct PendingCalls {
    slots: DashMap<CorrelationId, oneshot::Sender<Reply>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call and return its handle.
    pub fn register(self: &Arc<Self>) -> CallHandle {
        let id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id.clone(), tx);
        CallHandle {
            id,
            rx,
            pending: self.clone(),
        }
    }

    /// Deliver a reply to the call that owns `id`.
    ///
    /// Returns false when no call is waiting for it.
    pub fn complete(&self, id: &CorrelationId, reply: Reply) -> bool {
        match self.slots.remove(id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                debug!("Discarding reply for unknown or expired call {}", id);
                false
            }
        }
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop every waiting slot; their calls observe a closed channel.
    pub fn fail_all(&self) {
        self.slots.clear();
    }
}

/// The caller's side of one outstanding call.
///
/// Dropping the handle removes the call from the pending table.
#[derive(Debug)]
pub struct CallHandle {
    id: CorrelationId,
    rx: oneshot::Receiver<Reply>,
    pending: Arc<PendingCalls>,
}

impl CallHandle {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// Wait for the correlated reply, at most `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Reply> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CourierError::transport(
                "reply channel closed before a reply arrived",
            )),
            Err(_) => Err(CourierError::Timeout(timeout)),
        }
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        self.pending.slots.remove(&self.id);
    }
}
