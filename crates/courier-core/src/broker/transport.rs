//! Transport over the courier queue broker.
//!
//! Each transport owns one TCP connection and a private reply queue named
//! `<replies>.<uuid>`. Requests are published to the shared requests queue
//! with the reply queue in `replyTo`; receivers publish their reply there
//! under the same correlation id.
//!
//! # Thread Safety
//!
//! A single writer task owns the socket's write half and drains a bounded
//! channel of outgoing frames. A single reader task routes deliveries: reply
//! deliveries complete pending calls, request deliveries go to the
//! processing loop. Callers never touch the socket directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::protocol::{
    decode_frame, encode_frame, read_frame, write_frame, BrokerMessage, ClientFrame, ServerFrame,
};
use crate::config::{BrokerConfig, BrokerOptions};
use crate::correlation::{CorrelationId, PendingCalls};
use crate::envelope::{Reply, Request};
use crate::error::{CourierError, Result};
use crate::transport::{RequestHandler, Transport};

/// A request handed to the processing loop.
#[derive(Debug)]
struct Delivery {
    delivery_tag: u64,
    message: BrokerMessage,
}

/// Transport connected to a [`super::BrokerServer`].
pub struct BrokerTransport {
    options: BrokerOptions,
    reply_queue: String,
    outbound: mpsc::Sender<ClientFrame>,
    pending: Arc<PendingCalls>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
    processing: tokio::sync::Mutex<()>,
    lost: Arc<AtomicBool>,
    disposed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    closing_tx: watch::Sender<bool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for BrokerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerTransport")
            .field("address", &self.options.address)
            .field("reply_queue", &self.reply_queue)
            .finish()
    }
}

impl BrokerTransport {
    /// Connect to the broker and start consuming this transport's reply queue.
    pub async fn connect(options: BrokerOptions) -> Result<Self> {
        options.validate()?;

        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(options.address))
            .await
            .map_err(|_| {
                CourierError::transport(format!(
                    "timed out connecting to broker at {}",
                    options.address
                ))
            })?
            .map_err(|e| {
                CourierError::transport(format!(
                    "failed to connect to broker at {}: {}",
                    options.address, e
                ))
            })?;
        let (reader, writer) = stream.into_split();

        let reply_queue = format!("{}.{}", options.replies_queue, uuid::Uuid::new_v4());
        let pending = Arc::new(PendingCalls::new());
        let lost = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::channel(BrokerConfig::OUTBOUND_BUFFER);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let (closing_tx, closing_rx) = watch::channel(false);

        let writer_task = tokio::spawn(Self::write_loop(writer, outbound_rx, closing_rx));
        let reader_task = tokio::spawn(Self::read_loop(
            reader,
            reply_queue.clone(),
            pending.clone(),
            outbound.clone(),
            requests_tx,
            lost.clone(),
        ));

        outbound
            .send(ClientFrame::Consume {
                queue: reply_queue.clone(),
                prefetch: BrokerConfig::REPLY_PREFETCH,
                exclusive: true,
            })
            .await
            .map_err(|_| CourierError::transport("broker connection closed"))?;

        info!("Connected to broker at {} (replies on {})", options.address, reply_queue);

        Ok(Self {
            options,
            reply_queue,
            outbound,
            pending,
            requests_rx: Mutex::new(Some(requests_rx)),
            processing: tokio::sync::Mutex::new(()),
            lost,
            disposed: AtomicBool::new(false),
            shutdown_tx,
            closing_tx,
            reader_task: Mutex::new(Some(reader_task)),
            writer_task: Mutex::new(Some(writer_task)),
        })
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Private queue this transport receives replies on.
    pub fn reply_queue(&self) -> &str {
        &self.reply_queue
    }

    /// Calls sent by this transport that are still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    async fn send_frame(&self, frame: ClientFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| CourierError::transport("connection to broker lost"))
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        reply_queue: String,
        pending: Arc<PendingCalls>,
        outbound: mpsc::Sender<ClientFrame>,
        requests_tx: mpsc::UnboundedSender<Delivery>,
        lost: Arc<AtomicBool>,
    ) {
        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    warn!("Broker closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Broker connection failed: {}", e);
                    break;
                }
            };

            match decode_frame::<ServerFrame>(&frame) {
                Ok(ServerFrame::Deliver {
                    queue,
                    delivery_tag,
                    message,
                }) if queue == reply_queue => {
                    let id = CorrelationId::from(message.correlation_id);
                    match Reply::from_json(&message.body) {
                        Ok(reply) => {
                            pending.complete(&id, reply);
                        }
                        Err(e) => warn!("Discarding undecodable reply {}: {}", id, e),
                    }
                    if outbound.send(ClientFrame::Ack { delivery_tag }).await.is_err() {
                        break;
                    }
                }
                Ok(ServerFrame::Deliver {
                    delivery_tag,
                    message,
                    ..
                }) => {
                    if requests_tx
                        .send(Delivery {
                            delivery_tag,
                            message,
                        })
                        .is_err()
                    {
                        // Not processing anymore; leave it for someone else.
                        let nack = ClientFrame::Nack {
                            delivery_tag,
                            requeue: true,
                        };
                        if outbound.send(nack).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(ServerFrame::Error { message }) => warn!("Broker reported: {}", message),
                Err(e) => warn!("Ignoring invalid frame from broker: {}", e),
            }
        }

        lost.store(true, Ordering::SeqCst);
        pending.fail_all();
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut outbound_rx: mpsc::Receiver<ClientFrame>,
        mut closing_rx: watch::Receiver<bool>,
    ) {
        loop {
            let frame = tokio::select! {
                biased;
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = closing_rx.changed() => {
                    // Flush what is already queued, then close.
                    while let Ok(frame) = outbound_rx.try_recv() {
                        if Self::write_one(&mut writer, &frame).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            };

            if let Err(e) = Self::write_one(&mut writer, &frame).await {
                debug!("Broker write failed: {}", e);
                break;
            }
        }
    }

    async fn write_one(writer: &mut OwnedWriteHalf, frame: &ClientFrame) -> Result<()> {
        let bytes = encode_frame(frame)?;
        write_frame(writer, &bytes).await
    }

    async fn process(
        outbound: mpsc::Sender<ClientFrame>,
        handler: Arc<dyn RequestHandler>,
        delivery: Delivery,
    ) {
        let Delivery {
            delivery_tag,
            message,
        } = delivery;

        let request = match Request::from_json(&message.body) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting malformed request {}: {}", message.correlation_id, e);
                let _ = outbound
                    .send(ClientFrame::Nack {
                        delivery_tag,
                        requeue: false,
                    })
                    .await;
                return;
            }
        };

        let Some(reply) = handler.handle(request).await else {
            debug!("Declined {}, requeueing", message.correlation_id);
            let _ = outbound
                .send(ClientFrame::Nack {
                    delivery_tag,
                    requeue: true,
                })
                .await;
            return;
        };

        match (&message.reply_to, reply.to_json()) {
            (Some(reply_to), Ok(body)) => {
                let publish = ClientFrame::Publish {
                    queue: reply_to.clone(),
                    message: BrokerMessage {
                        correlation_id: message.correlation_id.clone(),
                        reply_to: None,
                        body,
                    },
                    // The caller's reply queue goes away with its connection.
                    existing_only: true,
                };
                if outbound.send(publish).await.is_err() {
                    return;
                }
            }
            (None, _) => warn!("Request {} has no reply queue", message.correlation_id),
            (_, Err(e)) => warn!("Failed to encode reply {}: {}", message.correlation_id, e),
        }

        let _ = outbound.send(ClientFrame::Ack { delivery_tag }).await;
    }
}

#[async_trait::async_trait]
impl Transport for BrokerTransport {
    async fn send_and_await_reply(&self, request: Request, timeout: Duration) -> Result<Reply> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(CourierError::Disposed);
        }
        if self.lost.load(Ordering::SeqCst) {
            return Err(CourierError::transport("connection to broker lost"));
        }

        let body = request.to_json()?;
        let handle = self.pending.register();
        let publish = ClientFrame::Publish {
            queue: self.options.requests_queue.clone(),
            message: BrokerMessage {
                correlation_id: handle.id().to_string(),
                reply_to: Some(self.reply_queue.clone()),
                body,
            },
            existing_only: false,
        };

        // One deadline covers both a stalled outbound channel and the reply.
        let deadline = Instant::now() + timeout;
        tokio::time::timeout_at(deadline, self.send_frame(publish))
            .await
            .map_err(|_| CourierError::Timeout(timeout))??;

        let remaining = deadline.saturating_duration_since(Instant::now());
        handle
            .wait(remaining)
            .await
            .map_err(|e| match e {
                CourierError::Timeout(_) => CourierError::Timeout(timeout),
                other => other,
            })
    }

    async fn start_processing(&self, handler: Arc<dyn RequestHandler>) -> Result<()> {
        let _processing = self.processing.try_lock().map_err(|_| CourierError::Config {
            message: "transport is already processing".to_string(),
        })?;
        let mut requests_rx = self
            .requests_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| CourierError::Config {
                message: "transport has already processed requests".to_string(),
            })?;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        self.send_frame(ClientFrame::Consume {
            queue: self.options.requests_queue.clone(),
            prefetch: u32::try_from(self.options.concurrency).unwrap_or(u32::MAX),
            exclusive: false,
        })
        .await?;

        debug!(
            "Consuming {} with concurrency {}",
            self.options.requests_queue, self.options.concurrency
        );

        let mut workers = JoinSet::new();
        let ended = loop {
            let delivery = tokio::select! {
                _ = shutdown_rx.changed() => break Ok(()),
                delivery = requests_rx.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break Err(CourierError::transport("connection to broker lost")),
                },
            };

            workers.spawn(Self::process(self.outbound.clone(), handler.clone(), delivery));
            while workers.try_join_next().is_some() {}
        };

        // Let in-flight requests finish and publish their replies.
        while workers.join_next().await.is_some() {}

        debug!("Stopped consuming {}", self.options.requests_queue);
        ended
    }

    async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            debug!("Broker transport already disposed");
            return Ok(());
        }

        self.shutdown_tx.send_replace(true);
        // Wait for the processing loop to drain its workers.
        drop(self.processing.lock().await);

        self.pending.fail_all();
        self.closing_tx.send_replace(true);

        let reader = self
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        let writer = self
            .writer_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(writer) = writer {
            let _ = writer.await;
        }

        info!("Disconnected from broker at {}", self.options.address);
        Ok(())
    }
}

impl Drop for BrokerTransport {
    fn drop(&mut self) {
        for slot in [&self.reader_task, &self.writer_task] {
            if let Some(task) = slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take()
            {
                task.abort();
            }
        }
    }
}
