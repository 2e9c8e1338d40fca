//! Networked queue broker and the transport that talks to it.
//!
//! The broker is a small TCP server with named queues, per-consumer
//! prefetch, acknowledgements and requeue-on-reject. [`BrokerTransport`]
//! implements [`crate::Transport`] on top of it so that callers and receivers
//! in different processes can reach each other.

pub mod protocol;
mod server;
mod transport;

pub use protocol::{BrokerMessage, ClientFrame, ServerFrame};
pub use server::{BrokerHandle, BrokerServer};
pub use transport::BrokerTransport;
