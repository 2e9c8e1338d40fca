//! Courier Core - call interface methods across a message transport.
//!
//! A caller holds a typed stand-in for an interface. Each method call becomes
//! a [`Request`] naming the interface, the method, the arguments with their
//! type identifiers and any generic type arguments. The request travels over
//! a [`Transport`]; a receiver that registered the interface resolves the
//! matching method, runs it and sends back a [`Reply`] under the same
//! correlation id. Failures on the receiver come back as
//! [`CourierError::Remote`] carrying the original error's type and message.
//!
//! Two transports ship with the crate: [`InMemoryTransport`] for in-process
//! wiring and tests, and [`broker::BrokerTransport`] over the bundled TCP
//! queue broker.
//!
//! # Example
//!
//! ```rust,ignore
//! use courier_core::{MemoryBus, Remoting, ServiceDescriptor, ServiceRegistry};
//!
//! #[tokio::main]
//! async fn main() -> courier_core::Result<()> {
//!     let bus = MemoryBus::new();
//!
//!     let registry = ServiceRegistry::builder()
//!         .register(
//!             ServiceDescriptor::shared("IGreeter", Arc::new(Greeter))
//!                 .method("Greet", |g: &Greeter, (name,): (String,)| g.greet(name))
//!                 .build(),
//!         )
//!         .build();
//!     let receiver = Remoting::builder().transport(bus.transport()).build()?;
//!     let serving = receiver.serve(registry);
//!
//!     let caller = Remoting::builder().transport(bus.transport()).build()?;
//!     let greeter: RemoteGreeter = caller.remoted();
//!     println!("{}", greeter.greet("ada".into()).await?);
//!
//!     serving.stop().await
//! }
//! ```

pub mod broker;
pub mod config;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod remoting;
pub mod transport;
pub mod wire;

// Re-export commonly used types
pub use config::{BrokerConfig, BrokerOptions, RemotingConfig, RemotingOptions};
pub use correlation::{CallHandle, CorrelationId, PendingCalls};
pub use dispatcher::Dispatcher;
pub use envelope::{Fault, Reply, Request};
pub use error::{fault_kind, CourierError, RemoteError, Result};
pub use proxy::{RemoteInterface, RemoteProxy};
pub use registry::{
    BoxError, DescriptorBuilder, MethodEntry, MethodSignature, ServiceDescriptor, ServiceRegistry,
    ServiceRegistryBuilder,
};
pub use remoting::{ReceiverHandle, Remoting, RemotingBuilder};
pub use transport::{InMemoryTransport, MemoryBus, RequestHandler, Transport};
pub use wire::{EncodedArgs, Wire, WireArgs};
