use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use mesh_core::RoutingGranularity;

use crate::load_balance::Server;
use crate::retry::RetryContext;

/// Granularity at which a load balancer and its rule state are cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    Service,
    Operation { schema: String, operation: String },
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingKey::Service => f.write_str("*"),
            RoutingKey::Operation { schema, operation } => write!(f, "{}.{}", schema, operation),
        }
    }
}

#[derive(Default)]
struct ContextState {
    retry: Option<RetryContext>,
    server: Option<Server>,
    supplied_endpoint: Option<String>,
    attributes: HashMap<String, String>,
}

/// Per call state shared by every attempt of one invocation.
#[derive(Default)]
pub struct InvocationContext {
    state: Mutex<ContextState>,
    finished: AtomicBool,
}

impl InvocationContext {
    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One outbound call as seen by the routing layer.
///
/// Clones share the same context, so a retried clone observes the server and
/// retry budget left behind by the previous attempt.
#[derive(Clone)]
pub struct Invocation {
    service: String,
    schema: String,
    operation: String,
    transport: Option<String>,
    context: Arc<InvocationContext>,
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("service", &self.service)
            .field("schema", &self.schema)
            .field("operation", &self.operation)
            .field("transport", &self.transport)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Invocation {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            schema: String::new(),
            operation: String::new(),
            transport: None,
            context: Arc::new(InvocationContext::default()),
        }
    }

    pub fn with_operation(mut self, schema: impl Into<String>, operation: impl Into<String>) -> Self {
        self.schema = schema.into();
        self.operation = operation.into();
        self
    }

    /// Only endpoints of this transport (URI scheme) are considered.
    pub fn with_transport(mut self, transport: impl Into<String>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn transport(&self) -> Option<&str> {
        self.transport.as_deref()
    }

    pub fn routing_key(&self, granularity: RoutingGranularity) -> RoutingKey {
        match granularity {
            RoutingGranularity::Service => RoutingKey::Service,
            RoutingGranularity::Operation => RoutingKey::Operation {
                schema: self.schema.clone(),
                operation: self.operation.clone(),
            },
        }
    }

    pub fn server(&self) -> Option<Server> {
        self.context.state().server.clone()
    }

    pub fn set_server(&self, server: Server) {
        self.context.state().server = Some(server);
    }

    /// An endpoint chosen by the caller, the load balancer is bypassed.
    pub fn supplied_endpoint(&self) -> Option<String> {
        self.context.state().supplied_endpoint.clone()
    }

    pub fn set_supplied_endpoint(&self, endpoint: impl Into<String>) {
        self.context.state().supplied_endpoint = Some(endpoint.into());
    }

    pub fn attribute(&self, key: &str) -> Option<String> {
        self.context.state().attributes.get(key).cloned()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<String>) {
        self.context.state().attributes.insert(key.into(), value.into());
    }

    pub fn has_retry_context(&self) -> bool {
        self.context.state().retry.is_some()
    }

    pub fn set_retry_context(&self, retry: RetryContext) {
        self.context.state().retry = Some(retry);
    }

    pub fn retry_context(&self) -> Option<RetryContext> {
        self.context.state().retry.clone()
    }

    /// Runs `f` on the retry context, if one was installed.
    pub fn with_retry_context<R>(&self, f: impl FnOnce(&mut RetryContext) -> R) -> Option<R> {
        self.context.state().retry.as_mut().map(f)
    }

    /// The caller gave up on this invocation, no further attempt may start.
    pub fn finish(&self) {
        self.context.finished.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.context.finished.load(Ordering::Acquire)
    }
}
