//! In-process transport.
//!
//! All transports created from one [`MemoryBus`] share a single request
//! queue. Requests travel as JSON text with a correlation id and a reply slot
//! owned by the sending transport, so concurrent outstanding calls never see
//! each other's replies. A receiver that declines a request puts it back at
//! the head of the queue and is never offered that request again.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{RequestHandler, Transport};
use crate::config::RemotingConfig;
use crate::correlation::{CorrelationId, PendingCalls};
use crate::envelope::{Reply, Request};
use crate::error::{CourierError, Result};

struct Queued {
    correlation_id: CorrelationId,
    payload: String,
    reply_to: Arc<PendingCalls>,
    declined_by: HashSet<u64>,
}

#[derive(Default)]
struct BusInner {
    queue: Mutex<VecDeque<Queued>>,
    notify: Notify,
    next_receiver: AtomicU64,
}

/// Shared request queue for in-memory transports.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<BusInner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport attached to this bus.
    pub fn transport(&self) -> InMemoryTransport {
        InMemoryTransport::new(self.clone())
    }

    /// Number of requests waiting for a receiver.
    pub fn queued(&self) -> usize {
        self.lock_queue().len()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Queued>> {
        // A panic while holding the lock cannot leave the queue half-updated.
        self.inner
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, queued: Queued) {
        self.lock_queue().push_back(queued);
        self.inner.notify.notify_waiters();
    }

    fn requeue(&self, queued: Queued) {
        self.lock_queue().push_front(queued);
        self.inner.notify.notify_waiters();
    }

    fn try_take(&self, receiver: u64) -> Option<Queued> {
        let mut queue = self.lock_queue();
        let index = queue
            .iter()
            .position(|q| !q.declined_by.contains(&receiver))?;
        queue.remove(index)
    }

    async fn take(&self, receiver: u64) -> Queued {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(queued) = self.try_take(receiver) {
                return queued;
            }
            notified.await;
        }
    }
}

/// Transport over a [`MemoryBus`].
pub struct InMemoryTransport {
    bus: MemoryBus,
    id: u64,
    pending: Arc<PendingCalls>,
    concurrency: usize,
    processing: tokio::sync::Mutex<()>,
    shutdown_tx: watch::Sender<bool>,
    disposed: AtomicBool,
}

impl InMemoryTransport {
    pub fn new(bus: MemoryBus) -> Self {
        let id = bus.inner.next_receiver.fetch_add(1, Ordering::Relaxed);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            bus,
            id,
            pending: Arc::new(PendingCalls::new()),
            concurrency: RemotingConfig::DEFAULT_CONCURRENCY,
            processing: tokio::sync::Mutex::new(()),
            shutdown_tx,
            disposed: AtomicBool::new(false),
        }
    }

    /// Handle up to `concurrency` requests at once when processing.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Calls sent by this transport that are still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    async fn process(
        bus: MemoryBus,
        receiver: u64,
        handler: Arc<dyn RequestHandler>,
        mut queued: Queued,
        _permit: OwnedSemaphorePermit,
    ) {
        let request = match Request::from_json(&queued.payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping malformed request {}: {}", queued.correlation_id, e);
                return;
            }
        };

        match handler.handle(request).await {
            Some(reply) => {
                let delivered = reply
                    .to_json()
                    .and_then(|text| Reply::from_json(&text))
                    .map(|reply| queued.reply_to.complete(&queued.correlation_id, reply));
                match delivered {
                    Ok(true) => {}
                    Ok(false) => debug!("Caller of {} is gone", queued.correlation_id),
                    Err(e) => warn!("Failed to encode reply {}: {}", queued.correlation_id, e),
                }
            }
            None => {
                debug!(
                    "Receiver {} declined {}, requeueing",
                    receiver, queued.correlation_id
                );
                queued.declined_by.insert(receiver);
                bus.requeue(queued);
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for InMemoryTransport {
    async fn send_and_await_reply(&self, request: Request, timeout: Duration) -> Result<Reply> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(CourierError::Disposed);
        }

        let payload = request.to_json()?;
        let handle = self.pending.register();
        self.bus.publish(Queued {
            correlation_id: handle.id().clone(),
            payload,
            reply_to: self.pending.clone(),
            declined_by: HashSet::new(),
        });

        handle.wait(timeout).await
    }

    async fn start_processing(&self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        // One loop per transport; a second would share this receiver's id.
        let _processing = self.processing.try_lock().map_err(|_| CourierError::Config {
            message: "transport is already processing".to_string(),
        })?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();

        debug!(
            "In-memory receiver {} processing with concurrency {}",
            self.id, self.concurrency
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let permit = tokio::select! {
                _ = shutdown_rx.changed() => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|_| CourierError::transport("worker pool closed"))?,
            };

            let queued = tokio::select! {
                _ = shutdown_rx.changed() => break,
                queued = self.bus.take(self.id) => queued,
            };

            workers.spawn(Self::process(
                self.bus.clone(),
                self.id,
                handler.clone(),
                queued,
                permit,
            ));

            while workers.try_join_next().is_some() {}
        }

        // Let in-flight requests finish and publish their replies.
        while workers.join_next().await.is_some() {}

        debug!("In-memory receiver {} stopped", self.id);
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("In-memory transport {} already disposed", self.id);
            return Ok(());
        }

        self.shutdown_tx.send_replace(true);
        self.pending.fail_all();
        Ok(())
    }
}
