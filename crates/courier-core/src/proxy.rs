//! Caller-side proxy.
//!
//! A [`RemoteProxy`] turns a method name plus typed arguments into a
//! [`Request`], sends it through the transport and maps the correlated
//! [`Reply`] back to the declared return type. Interface adapters wrap one
//! proxy and forward each trait method to [`RemoteProxy::invoke`] (or the
//! blocking variants for synchronous methods):
//!
//! ```rust,ignore
//! struct RemoteGreeter(RemoteProxy);
//!
//! impl RemoteInterface for RemoteGreeter {
//!     const NAME: &'static str = "IGreeter";
//!     fn from_proxy(proxy: RemoteProxy) -> Self {
//!         Self(proxy)
//!     }
//! }
//!
//! #[async_trait]
//! impl Greeter for RemoteGreeter {
//!     async fn greet(&self, name: String) -> courier_core::Result<String> {
//!         self.0.invoke("Greet", (name,)).await
//!     }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use crate::envelope::{Reply, Request};
use crate::error::{CourierError, Result};
use crate::transport::Transport;
use crate::wire::{decode_value, Wire, WireArgs};

/// A typed stand-in for a remote interface.
pub trait RemoteInterface: Sized {
    /// Interface name carried in `targetType`.
    const NAME: &'static str;

    fn from_proxy(proxy: RemoteProxy) -> Self;
}

/// Sends invocations of one interface through a shared transport.
#[derive(Clone)]
pub struct RemoteProxy {
    interface: String,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    runtime: Option<Handle>,
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("interface", &self.interface)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteProxy {
    pub fn new(
        interface: impl Into<String>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Self {
        Self {
            interface: interface.into(),
            transport,
            timeout,
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke a non-generic method.
    pub async fn invoke<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: WireArgs,
        R: Wire,
    {
        self.invoke_generic(method, Vec::new(), args).await
    }

    /// Invoke a generic method instantiated with `generic_arguments`.
    pub async fn invoke_generic<A, R>(
        &self,
        method: &str,
        generic_arguments: Vec<String>,
        args: A,
    ) -> Result<R>
    where
        A: WireArgs,
        R: Wire,
    {
        let request = Request::new(&self.interface, method)
            .with_args(args.encode()?)
            .with_generic_arguments(generic_arguments);

        debug!(
            "Invoking {}.{} with {:?}",
            self.interface, method, request.parameter_types
        );

        let reply = match self
            .transport
            .send_and_await_reply(request, self.timeout)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_timeout() {
                    warn!("{}.{} timed out after {:?}", self.interface, method, self.timeout);
                }
                return Err(e);
            }
        };

        self.complete(method, reply)
    }

    /// Blocking form of [`RemoteProxy::invoke`] for synchronous interface
    /// methods.
    pub fn invoke_blocking<A, R>(&self, method: &str, args: A) -> Result<R>
    where
        A: WireArgs,
        R: Wire,
    {
        self.invoke_generic_blocking(method, Vec::new(), args)
    }

    /// Blocking form of [`RemoteProxy::invoke_generic`].
    ///
    /// Inside a multi-threaded runtime the calling worker is handed over to
    /// blocking work for the duration of the call. Outside any runtime the
    /// call is driven on the runtime the proxy was created in. A
    /// current-thread runtime cannot do either and is rejected.
    pub fn invoke_generic_blocking<A, R>(
        &self,
        method: &str,
        generic_arguments: Vec<String>,
        args: A,
    ) -> Result<R>
    where
        A: WireArgs,
        R: Wire,
    {
        let call = self.invoke_generic::<A, R>(method, generic_arguments, args);

        match Handle::try_current() {
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::CurrentThread => Err(CourierError::Config {
                    message: format!(
                        "blocking call to {}.{} inside a current-thread runtime",
                        self.interface, method
                    ),
                }),
                _ => tokio::task::block_in_place(|| handle.block_on(call)),
            },
            Err(_) => match &self.runtime {
                Some(handle) => handle.block_on(call),
                None => Err(CourierError::Config {
                    message: "no tokio runtime available for a blocking call".to_string(),
                }),
            },
        }
    }

    fn complete<R: Wire>(&self, method: &str, reply: Reply) -> Result<R> {
        match reply {
            Reply::Fault(fault) => {
                debug!(
                    "{}.{} raised {}: {}",
                    self.interface, method, fault.error_kind, fault.error_message
                );
                Err(CourierError::Remote(fault.into()))
            }
            Reply::Void => R::from_void().ok_or_else(|| {
                CourierError::serialization(format!(
                    "{}.{} returned no value but {} was expected",
                    self.interface,
                    method,
                    R::type_name()
                ))
            }),
            Reply::Value {
                return_type,
                return_value,
            } => {
                if let Some(unit) = R::from_void() {
                    return Ok(unit);
                }
                if return_type != R::type_name() {
                    debug!(
                        "{}.{} returned {} where {} was declared",
                        self.interface,
                        method,
                        return_type,
                        R::type_name()
                    );
                }
                decode_value(&return_value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Fault;
    use crate::transport::RequestHandler;
    use std::sync::Mutex;

    /// Records requests and answers each with a canned reply.
    struct StubTransport {
        reply: Option<Reply>,
        seen: Mutex<Vec<Request>>,
    }

    impl StubTransport {
        fn replying(reply: Option<Reply>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Transport for StubTransport {
        async fn send_and_await_reply(&self, request: Request, timeout: Duration) -> Result<Reply> {
            self.seen.lock().unwrap().push(request);
            match &self.reply {
                Some(reply) => Ok(reply.clone()),
                None => Err(CourierError::Timeout(timeout)),
            }
        }

        async fn start_processing(&self, _handler: Arc<dyn RequestHandler>) -> Result<()> {
            Ok(())
        }

        async fn dispose(&self) -> Result<()> {
            Ok(())
        }
    }

    fn proxy(transport: Arc<StubTransport>) -> RemoteProxy {
        RemoteProxy::new("IGreeter", transport, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_request_carries_interface_method_and_types() {
        let transport = StubTransport::replying(Some(Reply::from_value(&"ok".to_string()).unwrap()));
        let proxy = proxy(transport.clone());

        let result: String = proxy
            .invoke_generic("Greet", vec!["i32".to_string()], ("ada".to_string(), 3i32))
            .await
            .unwrap();
        assert_eq!(result, "ok");

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen[0].target_type, "IGreeter");
        assert_eq!(seen[0].target_method, "Greet");
        assert_eq!(seen[0].parameter_values, vec!["\"ada\"", "3"]);
        assert_eq!(seen[0].parameter_types, vec!["string", "i32"]);
        assert_eq!(seen[0].generic_arguments, vec!["i32"]);
    }

    #[tokio::test]
    async fn test_fault_becomes_remote_error() {
        let fault = Fault::new("app::NotAllowed", "greeting refused").with_detail("at greet");
        let proxy = proxy(StubTransport::replying(Some(Reply::Fault(fault))));

        let err = proxy.invoke::<_, String>("Greet", ()).await.unwrap_err();
        let remote = err.as_remote().unwrap();
        assert_eq!(remote.original_type(), "app::NotAllowed");
        assert_eq!(remote.message(), "greeting refused");
        assert_eq!(remote.detail(), Some("at greet"));
    }

    #[tokio::test]
    async fn test_timeout_propagates() {
        let proxy = proxy(StubTransport::replying(None));
        let err = proxy.invoke::<_, ()>("Greet", ()).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_void_reply_only_satisfies_unit() {
        let proxy = proxy(StubTransport::replying(Some(Reply::Void)));

        proxy.invoke::<_, ()>("Touch", ()).await.unwrap();
        let err = proxy.invoke::<_, String>("Touch", ()).await.unwrap_err();
        assert!(matches!(err, CourierError::Serialization { .. }));
    }

    #[tokio::test]
    async fn test_undecodable_value_is_serialization_error() {
        let reply = Reply::Value {
            return_type: "string".to_string(),
            return_value: "\"text\"".to_string(),
        };
        let proxy = proxy(StubTransport::replying(Some(reply)));

        let err = proxy.invoke::<_, i32>("Count", ()).await.unwrap_err();
        assert!(matches!(err, CourierError::Serialization { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_invoke_inside_multi_thread_runtime() {
        let proxy = proxy(StubTransport::replying(Some(Reply::from_value(&7i32).unwrap())));
        let value: i32 = proxy.invoke_blocking("Count", ()).unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_blocking_invoke_rejects_current_thread_runtime() {
        let proxy = proxy(StubTransport::replying(Some(Reply::Void)));
        let err = proxy.invoke_blocking::<_, ()>("Touch", ()).unwrap_err();
        assert!(matches!(err, CourierError::Config { .. }));
    }

    #[test]
    fn test_blocking_invoke_outside_runtime_uses_captured_handle() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let proxy = runtime.block_on(async {
            proxy(StubTransport::replying(Some(Reply::from_value(&1u8).unwrap())))
        });

        let value: u8 = proxy.invoke_blocking("Tick", ()).unwrap();
        assert_eq!(value, 1);
    }
}
