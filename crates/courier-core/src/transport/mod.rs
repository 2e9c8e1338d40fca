//! The contract every transport implements.
//!
//! A transport moves requests to receivers and replies back to callers. It
//! owns correlation: `send_and_await_reply` must only ever return the reply
//! produced for the request it sent.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use crate::envelope::{Reply, Request};
use crate::error::Result;

pub use memory::{InMemoryTransport, MemoryBus};

/// Receiver-side callback invoked once per inbound request.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one request.
    ///
    /// `None` means the request does not belong to this receiver: the
    /// transport must not acknowledge it and must leave it for another
    /// recipient.
    async fn handle(&self, request: Request) -> Option<Reply>;
}

/// A message-oriented transport.
///
/// Implementations are shared across concurrent callers through
/// `Arc<dyn Transport>`.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one request and wait for its correlated reply.
    ///
    /// Fails with [`crate::CourierError::Timeout`] when no reply arrives
    /// within `timeout`.
    async fn send_and_await_reply(&self, request: Request, timeout: Duration) -> Result<Reply>;

    /// Receive requests and publish the handler's replies until disposed.
    async fn start_processing(&self, handler: Arc<dyn RequestHandler>) -> Result<()>;

    /// Stop processing and release transport resources. Calling it again is
    /// a no-op.
    async fn dispose(&self) -> Result<()>;
}
