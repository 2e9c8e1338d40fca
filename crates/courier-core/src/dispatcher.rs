//! Receiver-side request dispatch.
//!
//! For each inbound request the dispatcher either declines it (the target
//! interface is not registered here) or produces exactly one [`Reply`]:
//!
//! 1. look up the interface; unknown interfaces are declined with `None`
//! 2. resolve an instance; failure yields a service-unavailable fault
//! 3. pick the first method entry whose name and generic arity match, whose
//!    generic bindings equal the request's generic arguments, whose parameter
//!    count and types equal the request's, and whose values decode
//! 4. run it; a returned error or a panic becomes a fault
//!
//! Nothing is shared between requests except the immutable registry.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, warn};

use crate::envelope::{Fault, Reply, Request};
use crate::error::fault_kind;
use crate::registry::{Invocation, ServiceDescriptor, ServiceInstance, ServiceRegistry};
use crate::transport::RequestHandler;

/// Routes requests to registered services.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ServiceRegistry,
}

impl Dispatcher {
    pub fn new(registry: ServiceRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Handle one request. `None` means the target interface is not served
    /// here and the request belongs to someone else.
    pub async fn dispatch(&self, request: &Request) -> Option<Reply> {
        let descriptor = match self.registry.get(&request.target_type) {
            Some(descriptor) => descriptor,
            None => {
                debug!("Declining request for unregistered {}", request.target_type);
                return None;
            }
        };

        debug!(
            "Dispatching {}.{} ({} args, {} generic)",
            request.target_type,
            request.target_method,
            request.parameter_values.len(),
            request.generic_arguments.len()
        );

        Some(self.dispatch_to(descriptor, request).await)
    }

    async fn dispatch_to(&self, descriptor: &ServiceDescriptor, request: &Request) -> Reply {
        if let Err(e) = request.validate() {
            warn!(
                "Rejecting malformed request for {}.{}: {}",
                request.target_type, request.target_method, e
            );
            return Reply::fault(fault_kind::INVALID_REQUEST, e.to_string());
        }

        let instance = match descriptor.resolve() {
            Some(instance) => instance,
            None => {
                warn!("No instance available for {}", request.target_type);
                return Reply::fault(
                    fault_kind::SERVICE_UNAVAILABLE,
                    format!("A service for type {} is not registered", request.target_type),
                );
            }
        };

        let invocation = match Self::select_method(descriptor, request) {
            Some(invocation) => invocation,
            None => {
                warn!(
                    "No method {}.{} matches {:?}",
                    request.target_type, request.target_method, request.parameter_types
                );
                return Reply::fault(
                    fault_kind::METHOD_NOT_FOUND,
                    format!(
                        "The method {} is not found in the type {}",
                        request.target_method, request.target_type
                    ),
                );
            }
        };

        Self::invoke(invocation, instance, request).await
    }

    /// First candidate, in registration order, that fully accepts the request.
    fn select_method(descriptor: &ServiceDescriptor, request: &Request) -> Option<Invocation> {
        let candidates = descriptor.methods().iter().filter(|entry| {
            let signature = entry.signature();
            signature.name == request.target_method
                && signature.generic_arguments.len() == request.generic_arguments.len()
        });

        for entry in candidates {
            let signature = entry.signature();

            if signature.is_generic() && signature.generic_arguments != request.generic_arguments {
                continue;
            }
            if signature.arity() != request.parameter_values.len() {
                continue;
            }
            if signature.parameter_types != request.parameter_types {
                continue;
            }

            match entry.bind(&request.parameter_values) {
                Ok(invocation) => return Some(invocation),
                Err(e) => {
                    debug!(
                        "Candidate {}{:?} rejected arguments: {}",
                        signature.name, signature.parameter_types, e
                    );
                }
            }
        }

        None
    }

    async fn invoke(invocation: Invocation, instance: ServiceInstance, request: &Request) -> Reply {
        let outcome = AssertUnwindSafe(async move { invocation(instance).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(reply) => {
                if let Reply::Fault(fault) = &reply {
                    debug!(
                        "{}.{} failed with {}: {}",
                        request.target_type,
                        request.target_method,
                        fault.error_kind,
                        fault.error_message
                    );
                }
                reply
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(
                    "{}.{} panicked: {}",
                    request.target_type, request.target_method, message
                );
                Reply::Fault(Fault::new(fault_kind::PANIC, message).with_detail(format!(
                    "panicked in {}.{}",
                    request.target_type, request.target_method
                )))
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for Dispatcher {
    async fn handle(&self, request: Request) -> Option<Reply> {
        self.dispatch(&request).await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "implementation panicked".to_string()
    }
}
