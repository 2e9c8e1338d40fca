//! Entry point tying a transport to caller proxies and a receiver.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RemotingOptions;
use crate::dispatcher::Dispatcher;
use crate::error::{CourierError, Result};
use crate::proxy::{RemoteInterface, RemoteProxy};
use crate::registry::ServiceRegistry;
use crate::transport::Transport;

/// Remoting bound to one transport.
///
/// ```rust,ignore
/// let bus = MemoryBus::new();
/// let receiver = Remoting::builder().transport(bus.transport()).build()?;
/// let _serving = receiver.serve(registry);
///
/// let caller = Remoting::builder().transport(bus.transport()).build()?;
/// let greeter: RemoteGreeter = caller.remoted();
/// ```
#[derive(Clone)]
pub struct Remoting {
    transport: Arc<dyn Transport>,
    options: RemotingOptions,
}

impl Remoting {
    pub fn builder() -> RemotingBuilder {
        RemotingBuilder::default()
    }

    pub fn options(&self) -> &RemotingOptions {
        &self.options
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Untyped proxy for `interface`.
    pub fn proxy(&self, interface: impl Into<String>) -> RemoteProxy {
        RemoteProxy::new(interface, self.transport.clone(), self.options.timeout)
    }

    /// Typed stand-in for a remote interface.
    pub fn remoted<P: RemoteInterface>(&self) -> P {
        P::from_proxy(self.proxy(P::NAME))
    }

    /// Start answering requests for the services in `registry`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn serve(&self, registry: ServiceRegistry) -> ReceiverHandle {
        let interfaces: Vec<String> = registry.interfaces().map(str::to_string).collect();
        info!("Serving {:?}", interfaces);
        ReceiverHandle::start(self.transport.clone(), Arc::new(Dispatcher::new(registry)))
    }
}

/// Builder for [`Remoting`].
#[derive(Default)]
pub struct RemotingBuilder {
    transport: Option<Arc<dyn Transport>>,
    options: RemotingOptions,
}

impl RemotingBuilder {
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a transport that is also held elsewhere.
    pub fn shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn options(mut self, options: RemotingOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Result<Remoting> {
        self.options.validate()?;
        let transport = self.transport.ok_or_else(|| CourierError::Config {
            message: "a transport is required".to_string(),
        })?;
        Ok(Remoting {
            transport,
            options: self.options,
        })
    }
}

/// A running receiver. Dropping it aborts processing without disposing the
/// transport; call [`ReceiverHandle::stop`] for an orderly shutdown.
pub struct ReceiverHandle {
    transport: Arc<dyn Transport>,
    task: Option<JoinHandle<Result<()>>>,
}

impl ReceiverHandle {
    fn start(transport: Arc<dyn Transport>, dispatcher: Arc<Dispatcher>) -> Self {
        let processing = transport.clone();
        let task = tokio::spawn(async move { processing.start_processing(dispatcher).await });
        Self {
            transport,
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Dispose the transport and wait for in-flight requests to finish.
    pub async fn stop(mut self) -> Result<()> {
        self.transport.dispose().await?;
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Receiver task ended abnormally: {}", e);
                    Err(CourierError::transport(format!("receiver task failed: {}", e)))
                }
            },
            None => Ok(()),
        }
    }
}

impl Drop for ReceiverHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServiceDescriptor;
    use crate::transport::MemoryBus;
    use std::convert::Infallible;

    struct Clock;

    fn clock_registry() -> ServiceRegistry {
        ServiceRegistry::builder()
            .register(
                ServiceDescriptor::shared("IClock", Arc::new(Clock))
                    .method("Now", |_: &Clock, (): ()| Ok::<_, Infallible>(1_700_000_000u64))
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_builder_requires_transport() {
        let result = Remoting::builder().build();
        assert!(matches!(result, Err(CourierError::Config { .. })));
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = Remoting::builder()
            .transport(MemoryBus::new().transport())
            .timeout(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(CourierError::Config { .. })));
    }

    #[tokio::test]
    async fn test_serve_and_call_through_proxy() {
        let bus = MemoryBus::new();
        let receiver = Remoting::builder().transport(bus.transport()).build().unwrap();
        let serving = receiver.serve(clock_registry());
        assert!(serving.is_running());

        let caller = Remoting::builder()
            .transport(bus.transport())
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let now: u64 = caller.proxy("IClock").invoke("Now", ()).await.unwrap();
        assert_eq!(now, 1_700_000_000);

        serving.stop().await.unwrap();
    }
}
