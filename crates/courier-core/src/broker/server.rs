//! TCP queue broker.
//!
//! Holds named queues in memory and delivers their messages to consumers.
//! Queues are created on first use. Each queue hands messages to its
//! consumers round-robin, never exceeding a consumer's prefetch of unacked
//! deliveries.
//!
//! A negatively acknowledged message is either dropped or put back at the
//! head of its queue. A requeued message is marked as declined by the
//! connection that rejected it and is never offered to that connection again.
//! When a connection closes, its consumers are removed and everything it had
//! not acknowledged goes back to the head of its queue. Queues it consumed
//! exclusively are deleted along with their messages.
//!
//! # Thread Safety
//!
//! Queue state lives behind one mutex that is never held across an await.
//! Each connection has a reader task and a writer task fed by a channel, so
//! routing never blocks on a slow socket.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::protocol::{
    decode_frame, encode_frame, read_frame, write_frame, BrokerMessage, ClientFrame, ServerFrame,
};
use crate::config::BrokerConfig;
use crate::error::Result;

type ConnectionId = u64;

struct Ready {
    message: BrokerMessage,
    declined_by: HashSet<ConnectionId>,
}

#[derive(Default)]
struct Queue {
    ready: VecDeque<Ready>,
    consumers: Vec<ConnectionId>,
    cursor: usize,
    /// Connection that declared this queue exclusive.
    owner: Option<ConnectionId>,
}

struct Unacked {
    queue: String,
    ready: Ready,
}

struct Subscription {
    prefetch: usize,
    in_flight: usize,
}

struct Connection {
    tx: mpsc::UnboundedSender<ServerFrame>,
    subscriptions: HashMap<String, Subscription>,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    connections: HashMap<ConnectionId, Connection>,
    next_tag: u64,
}

impl BrokerState {
    fn publish(&mut self, queue: String, message: BrokerMessage, existing_only: bool) {
        let ready = Ready {
            message,
            declined_by: HashSet::new(),
        };
        if existing_only {
            let Some(entry) = self.queues.get_mut(&queue) else {
                debug!(
                    "Dropping {} for missing queue {}",
                    ready.message.correlation_id, queue
                );
                return;
            };
            entry.ready.push_back(ready);
        } else {
            self.queues.entry(queue.clone()).or_default().ready.push_back(ready);
        }
        self.route(&queue);
    }

    fn consume(&mut self, conn: ConnectionId, queue: String, prefetch: u32, exclusive: bool) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        let owner = self.queues.get(&queue).and_then(|q| q.owner);
        if owner.is_some_and(|owner| owner != conn) {
            let _ = connection.tx.send(ServerFrame::Error {
                message: format!("queue {} is exclusive to another connection", queue),
            });
            return;
        }
        connection.subscriptions.insert(
            queue.clone(),
            Subscription {
                prefetch: prefetch.max(1) as usize,
                in_flight: 0,
            },
        );

        let entry = self.queues.entry(queue.clone()).or_default();
        if exclusive {
            entry.owner = Some(conn);
        }
        if !entry.consumers.contains(&conn) {
            entry.consumers.push(conn);
        }
        self.route(&queue);
    }

    fn settle(&mut self, conn: ConnectionId, tag: u64, requeue: Option<bool>) {
        let Some(connection) = self.connections.get_mut(&conn) else {
            return;
        };
        let Some(Unacked { queue, mut ready }) = connection.unacked.remove(&tag) else {
            let _ = connection.tx.send(ServerFrame::Error {
                message: format!("unknown delivery tag {}", tag),
            });
            return;
        };
        if let Some(subscription) = connection.subscriptions.get_mut(&queue) {
            subscription.in_flight = subscription.in_flight.saturating_sub(1);
        }

        match requeue {
            None => {}
            Some(true) => {
                ready.declined_by.insert(conn);
                self.queues.entry(queue.clone()).or_default().ready.push_front(ready);
            }
            Some(false) => debug!("Dropping rejected message {}", ready.message.correlation_id),
        }
        self.route(&queue);
    }

    fn disconnect(&mut self, conn: ConnectionId) {
        let Some(connection) = self.connections.remove(&conn) else {
            return;
        };

        self.queues.retain(|name, queue| {
            let owned = queue.owner == Some(conn);
            if owned {
                debug!(
                    "Deleting exclusive queue {} ({} messages)",
                    name,
                    queue.ready.len()
                );
            }
            !owned
        });
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| *c != conn);
            if queue.cursor >= queue.consumers.len() {
                queue.cursor = 0;
            }
        }

        let mut returned: Vec<(u64, Unacked)> = connection.unacked.into_iter().collect();
        // Oldest delivery ends up first.
        returned.sort_by(|a, b| b.0.cmp(&a.0));
        let mut touched = HashSet::new();
        for (_, Unacked { queue, ready }) in returned {
            // Deliveries from a deleted exclusive queue go with it.
            let Some(entry) = self.queues.get_mut(&queue) else {
                continue;
            };
            entry.ready.push_front(ready);
            touched.insert(queue);
        }
        for queue in touched {
            self.route(&queue);
        }
    }

    /// Deliver as many ready messages of `queue` as consumer capacity allows.
    fn route(&mut self, name: &str) {
        let BrokerState {
            queues,
            connections,
            next_tag,
        } = self;
        let Some(queue) = queues.get_mut(name) else {
            return;
        };

        loop {
            let consumer_count = queue.consumers.len();
            if queue.ready.is_empty() || consumer_count == 0 {
                return;
            }

            let mut chosen = None;
            'messages: for (index, ready) in queue.ready.iter().enumerate() {
                for step in 0..consumer_count {
                    let slot = (queue.cursor + step) % consumer_count;
                    let conn = queue.consumers[slot];
                    if ready.declined_by.contains(&conn) {
                        continue;
                    }
                    let has_capacity = connections
                        .get(&conn)
                        .and_then(|c| c.subscriptions.get(name))
                        .is_some_and(|s| s.in_flight < s.prefetch);
                    if has_capacity {
                        chosen = Some((index, slot, conn));
                        break 'messages;
                    }
                }
            }

            let Some((index, slot, conn)) = chosen else {
                return;
            };
            let Some(ready) = queue.ready.remove(index) else {
                return;
            };
            let Some(connection) = connections.get_mut(&conn) else {
                return;
            };

            queue.cursor = (slot + 1) % consumer_count;
            *next_tag += 1;
            let tag = *next_tag;

            if let Some(subscription) = connection.subscriptions.get_mut(name) {
                subscription.in_flight += 1;
            }
            let frame = ServerFrame::Deliver {
                queue: name.to_string(),
                delivery_tag: tag,
                message: ready.message.clone(),
            };
            connection.unacked.insert(
                tag,
                Unacked {
                    queue: name.to_string(),
                    ready,
                },
            );
            // A closed writer means the connection is going away; its
            // cleanup requeues the message.
            let _ = connection.tx.send(frame);
        }
    }
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    next_connection: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to a running broker. Dropping shuts down the broker.
pub struct BrokerHandle {
    pub addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerHandle {
    /// Get the address the broker is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Messages waiting in `queue` that have not been delivered.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Whether `queue` currently exists on the broker.
    pub fn has_queue(&self, queue: &str) -> bool {
        self.shared.lock().queues.contains_key(queue)
    }

    /// Consumers currently attached to `queue`.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Stop accepting connections and close the open ones.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Queue broker that listens for client connections.
pub struct BrokerServer;

impl BrokerServer {
    /// Start the broker on `addr`. Port 0 picks a free port.
    pub async fn start(addr: SocketAddr) -> Result<BrokerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("Broker listening on {}", addr);

        let shared = Arc::new(Shared::default());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            shared.clone(),
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(BrokerHandle {
            addr,
            shared,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        shared: Arc<Shared>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Broker shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= BrokerConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting broker connection from {}: at max capacity ({})",
                                    peer_addr,
                                    BrokerConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let shared = shared.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                let conn = shared.next_connection.fetch_add(1, Ordering::Relaxed);
                                debug!("Broker connection {} from {}", conn, peer_addr);
                                if let Err(e) =
                                    Self::handle_connection(stream, conn, &shared, &mut conn_shutdown).await
                                {
                                    debug!("Broker connection {} ended: {}", conn, e);
                                }
                                shared.lock().disconnect(conn);
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Broker accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        conn: ConnectionId,
        shared: &Shared,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        shared.lock().connections.insert(
            conn,
            Connection {
                tx,
                subscriptions: HashMap::new(),
                unacked: HashMap::new(),
            },
        );
        let writer_task = tokio::spawn(Self::write_loop(writer, rx, conn));

        let result = loop {
            let frame = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result {
                        Ok(Some(f)) => f,
                        Ok(None) => break Ok(()), // Clean disconnect
                        Err(e) => break Err(e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    break Ok(()); // Broker shutting down
                }
            };

            match decode_frame::<ClientFrame>(&frame) {
                Ok(frame) => Self::apply(shared, conn, frame),
                Err(e) => {
                    warn!("Broker connection {} sent an invalid frame: {}", conn, e);
                    if let Some(connection) = shared.lock().connections.get(&conn) {
                        let _ = connection.tx.send(ServerFrame::Error {
                            message: format!("invalid frame: {}", e),
                        });
                    }
                }
            }
        };

        // Removing the connection drops its sender and ends the writer.
        shared.lock().disconnect(conn);
        let _ = writer_task.await;
        result
    }

    fn apply(shared: &Shared, conn: ConnectionId, frame: ClientFrame) {
        let mut state = shared.lock();
        match frame {
            ClientFrame::Publish {
                queue,
                message,
                existing_only,
            } => {
                debug!("Connection {} published {} to {}", conn, message.correlation_id, queue);
                state.publish(queue, message, existing_only);
            }
            ClientFrame::Consume {
                queue,
                prefetch,
                exclusive,
            } => {
                debug!("Connection {} consuming {} (prefetch {})", conn, queue, prefetch);
                state.consume(conn, queue, prefetch, exclusive);
            }
            ClientFrame::Ack { delivery_tag } => state.settle(conn, delivery_tag, None),
            ClientFrame::Nack {
                delivery_tag,
                requeue,
            } => state.settle(conn, delivery_tag, Some(requeue)),
        }
    }

    async fn write_loop(
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<ServerFrame>,
        conn: ConnectionId,
    ) {
        while let Some(frame) = rx.recv().await {
            let written = match encode_frame(&frame) {
                Ok(bytes) => write_frame(&mut writer, &bytes).await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                debug!("Broker connection {} write failed: {}", conn, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> BrokerMessage {
        BrokerMessage {
            correlation_id: id.to_string(),
            reply_to: None,
            body: String::new(),
        }
    }

    fn connect(state: &mut BrokerState, conn: ConnectionId) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        state.connections.insert(
            conn,
            Connection {
                tx,
                subscriptions: HashMap::new(),
                unacked: HashMap::new(),
            },
        );
        rx
    }

    fn delivered(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Option<(u64, String)> {
        match rx.try_recv().ok()? {
            ServerFrame::Deliver {
                delivery_tag,
                message,
                ..
            } => Some((delivery_tag, message.correlation_id)),
            other => panic!("Expected deliver frame, got: {:?}", other),
        }
    }

    #[test]
    fn test_round_robin_respects_prefetch() {
        let mut state = BrokerState::default();
        let mut a = connect(&mut state, 1);
        let mut b = connect(&mut state, 2);
        state.consume(1, "q".into(), 1, false);
        state.consume(2, "q".into(), 1, false);

        for id in ["m1", "m2", "m3"] {
            state.publish("q".into(), message(id), false);
        }

        let (tag_a, first) = delivered(&mut a).unwrap();
        let (_, second) = delivered(&mut b).unwrap();
        assert_eq!((first.as_str(), second.as_str()), ("m1", "m2"));
        // Both consumers are at their prefetch limit.
        assert!(delivered(&mut a).is_none());
        assert_eq!(state.queues["q"].ready.len(), 1);

        state.settle(1, tag_a, None);
        assert_eq!(delivered(&mut a).unwrap().1, "m3");
    }

    #[test]
    fn test_requeued_message_skips_declining_connection() {
        let mut state = BrokerState::default();
        let mut a = connect(&mut state, 1);
        state.consume(1, "q".into(), 5, false);
        state.publish("q".into(), message("m1"), false);

        let (tag, _) = delivered(&mut a).unwrap();
        state.settle(1, tag, Some(true));
        assert!(delivered(&mut a).is_none());
        assert_eq!(state.queues["q"].ready.len(), 1);

        let mut b = connect(&mut state, 2);
        state.consume(2, "q".into(), 5, false);
        assert_eq!(delivered(&mut b).unwrap().1, "m1");
    }

    #[test]
    fn test_nack_without_requeue_drops() {
        let mut state = BrokerState::default();
        let mut a = connect(&mut state, 1);
        state.consume(1, "q".into(), 1, false);
        state.publish("q".into(), message("m1"), false);

        let (tag, _) = delivered(&mut a).unwrap();
        state.settle(1, tag, Some(false));
        assert!(state.queues["q"].ready.is_empty());
        assert!(delivered(&mut a).is_none());
    }

    #[test]
    fn test_disconnect_requeues_unacked_in_order() {
        let mut state = BrokerState::default();
        let mut a = connect(&mut state, 1);
        state.consume(1, "q".into(), 2, false);
        state.publish("q".into(), message("m1"), false);
        state.publish("q".into(), message("m2"), false);
        state.publish("q".into(), message("m3"), false);
        delivered(&mut a).unwrap();
        delivered(&mut a).unwrap();

        state.disconnect(1);
        let order: Vec<_> = state.queues["q"]
            .ready
            .iter()
            .map(|r| r.message.correlation_id.clone())
            .collect();
        assert_eq!(order, vec!["m1", "m2", "m3"]);
        assert!(state.queues["q"].consumers.is_empty());
    }

    #[test]
    fn test_exclusive_queue_is_deleted_with_its_connection() {
        let mut state = BrokerState::default();
        let mut owner = connect(&mut state, 1);
        state.consume(1, "replies".into(), 1, true);
        state.publish("replies".into(), message("r1"), true);
        state.publish("replies".into(), message("r2"), true);
        delivered(&mut owner).unwrap();

        state.disconnect(1);
        assert!(!state.queues.contains_key("replies"));

        // A late reply is dropped instead of recreating the queue.
        state.publish("replies".into(), message("r3"), true);
        assert!(!state.queues.contains_key("replies"));
    }

    #[test]
    fn test_exclusive_queue_rejects_other_consumers() {
        let mut state = BrokerState::default();
        let _owner = connect(&mut state, 1);
        let mut other = connect(&mut state, 2);
        state.consume(1, "replies".into(), 1, true);
        state.consume(2, "replies".into(), 1, false);

        assert_eq!(state.queues["replies"].consumers, vec![1]);
        match other.try_recv().unwrap() {
            ServerFrame::Error { message } => assert!(message.contains("exclusive")),
            other => panic!("Expected error frame, got: {:?}", other),
        }
    }

    #[test]
    fn test_existing_only_publish_needs_a_queue() {
        let mut state = BrokerState::default();
        state.publish("nowhere".into(), message("m1"), true);
        assert!(!state.queues.contains_key("nowhere"));

        state.publish("shared".into(), message("m1"), false);
        assert_eq!(state.queues["shared"].ready.len(), 1);
    }

    #[test]
    fn test_unknown_tag_reports_error() {
        let mut state = BrokerState::default();
        let mut a = connect(&mut state, 1);
        state.settle(1, 42, None);
        match a.try_recv().unwrap() {
            ServerFrame::Error { message } => assert!(message.contains("42")),
            other => panic!("Expected error frame, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_broker_delivers_over_tcp() {
        let mut handle = BrokerServer::start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let consume = encode_frame(&ClientFrame::Consume {
            queue: "q".into(),
            prefetch: 1,
            exclusive: false,
        })
        .unwrap();
        write_frame(&mut stream, &consume).await.unwrap();
        let publish = encode_frame(&ClientFrame::Publish {
            queue: "q".into(),
            message: message("m1"),
            existing_only: false,
        })
        .unwrap();
        write_frame(&mut stream, &publish).await.unwrap();

        let frame = read_frame(&mut stream).await.unwrap().unwrap();
        match decode_frame::<ServerFrame>(&frame).unwrap() {
            ServerFrame::Deliver { queue, message, .. } => {
                assert_eq!(queue, "q");
                assert_eq!(message.correlation_id, "m1");
            }
            other => panic!("Expected deliver frame, got: {:?}", other),
        }

        assert_eq!(handle.consumer_count("q"), 1);
        handle.shutdown();
    }
}
