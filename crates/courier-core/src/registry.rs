//! Receivable services and their method tables.
//!
//! A [`ServiceDescriptor`] is built once at startup for each interface a
//! receiver serves. It pairs an instance provider with one entry per callable
//! method: the method's signature (name, generic bindings, parameter types)
//! and a typed binder that decodes arguments into a ready-to-run invocation.
//! The [`ServiceRegistry`] maps interface names to descriptors and never
//! changes after it is built.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use crate::envelope::{Fault, Reply};
use crate::error::{fault_kind, Result};
use crate::wire::{Wire, WireArgs};

/// A resolved implementation instance, scoped to one request.
pub type ServiceInstance = Arc<dyn Any + Send + Sync>;

/// A bound method call waiting for its instance.
pub type Invocation = Box<dyn FnOnce(ServiceInstance) -> BoxFuture<'static, Reply> + Send>;

/// Error type every implementation error converts into.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type Binder = Arc<dyn Fn(&[String]) -> Result<Invocation> + Send + Sync>;
type Provider = Arc<dyn Fn() -> Option<ServiceInstance> + Send + Sync>;
type TypedCall<S, A> = Arc<dyn Fn(Arc<S>, A) -> BoxFuture<'static, Reply> + Send + Sync>;

/// Name, generic bindings and declared parameter types of one method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: String,
    /// Type identifiers this entry is bound to; empty for non-generic methods.
    pub generic_arguments: Vec<String>,
    pub parameter_types: Vec<String>,
}

impl MethodSignature {
    pub fn is_generic(&self) -> bool {
        !self.generic_arguments.is_empty()
    }

    pub fn arity(&self) -> usize {
        self.parameter_types.len()
    }
}

/// One callable method of a service.
pub struct MethodEntry {
    signature: MethodSignature,
    binder: Binder,
}

impl MethodEntry {
    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    /// Decode the positional values against this method's parameter types.
    pub fn bind(&self, values: &[String]) -> Result<Invocation> {
        (self.binder)(values)
    }
}

/// A receivable interface: instance provider plus method table.
pub struct ServiceDescriptor {
    interface: String,
    provider: Provider,
    methods: Vec<MethodEntry>,
}

impl ServiceDescriptor {
    /// Start describing `interface`, resolving a fresh instance per request
    /// through `provider`.
    pub fn builder<S, P>(interface: impl Into<String>, provider: P) -> DescriptorBuilder<S>
    where
        S: Send + Sync + 'static,
        P: Fn() -> Option<Arc<S>> + Send + Sync + 'static,
    {
        DescriptorBuilder::new(interface, provider)
    }

    /// Start describing `interface`, serving every request from one instance.
    pub fn shared<S>(interface: impl Into<String>, instance: Arc<S>) -> DescriptorBuilder<S>
    where
        S: Send + Sync + 'static,
    {
        DescriptorBuilder::new(interface, move || Some(instance.clone()))
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn methods(&self) -> &[MethodEntry] {
        &self.methods
    }

    /// Resolve an instance for one request.
    pub fn resolve(&self) -> Option<ServiceInstance> {
        (self.provider)()
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("interface", &self.interface)
            .field(
                "methods",
                &self.methods.iter().map(|m| &m.signature).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Typed builder for a [`ServiceDescriptor`].
pub struct DescriptorBuilder<S> {
    interface: String,
    provider: Provider,
    methods: Vec<MethodEntry>,
    _service: std::marker::PhantomData<fn() -> S>,
}

impl<S: Send + Sync + 'static> DescriptorBuilder<S> {
    pub fn new<P>(interface: impl Into<String>, provider: P) -> Self
    where
        P: Fn() -> Option<Arc<S>> + Send + Sync + 'static,
    {
        Self {
            interface: interface.into(),
            provider: Arc::new(move || provider().map(|s| s as ServiceInstance)),
            methods: Vec::new(),
            _service: std::marker::PhantomData,
        }
    }

    /// Register a synchronous method.
    pub fn method<A, R, E, F>(self, name: &str, f: F) -> Self
    where
        A: WireArgs,
        R: Wire,
        E: Into<BoxError> + 'static,
        F: Fn(&S, A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        self.generic_method(name, Vec::new(), f)
    }

    /// Register one instantiation of a synchronous generic method.
    pub fn generic_method<A, R, E, F>(
        self,
        name: &str,
        generic_arguments: Vec<String>,
        f: F,
    ) -> Self
    where
        A: WireArgs,
        R: Wire,
        E: Into<BoxError> + 'static,
        F: Fn(&S, A) -> std::result::Result<R, E> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let call: TypedCall<S, A> =
            Arc::new(move |service: Arc<S>, args: A| -> BoxFuture<'static, Reply> {
                let f = f.clone();
                Box::pin(async move { into_reply(f(&*service, args)) })
            });
        self.push(name, generic_arguments, call)
    }

    /// Register a method that returns a future.
    pub fn async_method<A, R, E, F, Fut>(self, name: &str, f: F) -> Self
    where
        A: WireArgs,
        R: Wire,
        E: Into<BoxError> + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        self.generic_async_method(name, Vec::new(), f)
    }

    /// Register one instantiation of a generic method that returns a future.
    pub fn generic_async_method<A, R, E, F, Fut>(
        self,
        name: &str,
        generic_arguments: Vec<String>,
        f: F,
    ) -> Self
    where
        A: WireArgs,
        R: Wire,
        E: Into<BoxError> + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, E>> + Send + 'static,
    {
        let f = Arc::new(f);
        let call: TypedCall<S, A> =
            Arc::new(move |service: Arc<S>, args: A| -> BoxFuture<'static, Reply> {
                let f = f.clone();
                Box::pin(async move { into_reply(f(service, args).await) })
            });
        self.push(name, generic_arguments, call)
    }

    fn push<A: WireArgs>(
        mut self,
        name: &str,
        generic_arguments: Vec<String>,
        call: TypedCall<S, A>,
    ) -> Self {
        let signature = MethodSignature {
            name: name.to_string(),
            generic_arguments,
            parameter_types: A::param_types(),
        };

        let binder: Binder = Arc::new(move |values: &[String]| {
            let args = A::decode(values)?;
            let call = call.clone();
            let invocation: Invocation =
                Box::new(move |instance: ServiceInstance| -> BoxFuture<'static, Reply> {
                    match instance.downcast::<S>() {
                        Ok(service) => call(service, args),
                        Err(_) => Box::pin(async {
                            Reply::fault(
                                fault_kind::SERVICE_UNAVAILABLE,
                                "resolved instance has an unexpected type",
                            )
                        }),
                    }
                });
            Ok(invocation)
        });

        self.methods.push(MethodEntry { signature, binder });
        self
    }

    pub fn build(self) -> ServiceDescriptor {
        ServiceDescriptor {
            interface: self.interface,
            provider: self.provider,
            methods: self.methods,
        }
    }
}

fn into_reply<R, E>(result: std::result::Result<R, E>) -> Reply
where
    R: Wire,
    E: Into<BoxError> + 'static,
{
    match result {
        Ok(value) => Reply::from_value(&value).unwrap_or_else(|e| {
            Reply::Fault(Fault::new(fault_kind::SERIALIZATION, e.to_string()))
        }),
        Err(err) => {
            let kind = error_kind::<E>();
            let err: BoxError = err.into();
            Reply::Fault(Fault::from_error_as(kind, &*err))
        }
    }
}

/// Type name of an implementation error, unless the type erases the real
/// error, in which case the kind is [`fault_kind::IMPLEMENTATION`].
fn error_kind<E: 'static>() -> &'static str {
    let erased = [
        TypeId::of::<BoxError>(),
        TypeId::of::<anyhow::Error>(),
        TypeId::of::<String>(),
        TypeId::of::<&'static str>(),
    ];
    if erased.contains(&TypeId::of::<E>()) {
        fault_kind::IMPLEMENTATION
    } else {
        std::any::type_name::<E>()
    }
}

/// Interface name → receivable service. Immutable once built.
#[derive(Debug, Default, Clone)]
pub struct ServiceRegistry {
    services: HashMap<String, Arc<ServiceDescriptor>>,
}

impl ServiceRegistry {
    pub fn builder() -> ServiceRegistryBuilder {
        ServiceRegistryBuilder::default()
    }

    pub fn get(&self, interface: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.services.get(interface)
    }

    pub fn contains(&self, interface: &str) -> bool {
        self.services.contains_key(interface)
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Collects descriptors before the registry is frozen.
#[derive(Debug, Default)]
pub struct ServiceRegistryBuilder {
    services: HashMap<String, Arc<ServiceDescriptor>>,
}

impl ServiceRegistryBuilder {
    /// Register a receivable service. The first registration of an
    /// interface wins.
    pub fn register(mut self, descriptor: ServiceDescriptor) -> Self {
        let interface = descriptor.interface().to_string();
        if self.services.contains_key(&interface) {
            warn!("Service {} is already registered, ignoring duplicate", interface);
            return self;
        }
        self.services.insert(interface, Arc::new(descriptor));
        self
    }

    pub fn build(self) -> ServiceRegistry {
        ServiceRegistry {
            services: self.services,
        }
    }
}
