//! Middleware chain — continuation-passing wrappers around call execution.
//!
//! A middleware receives the invocation and a `next` continuation that
//! performs (or further wraps) execution. Composition is associative with
//! left-outermost layering; the identity middleware forwards unchanged. The
//! fully composed handler is built once per executor, not per call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use orp_protocol::{CallError, InstanceId, RequestId, RouteId};
use serde_json::{Map, Value};
use tracing::debug;

use crate::service::{CallOutcome, ResolvedService};

/// One call flowing through the chain.
pub struct Invocation {
    /// Route the call originated from.
    pub route: RouteId,
    pub request_id: RequestId,
    pub service_id: InstanceId,
    pub method: String,
    /// Decoded, named arguments.
    pub args: Map<String, Value>,
    /// The resolved target the terminal handler dispatches to.
    pub target: ResolvedService,
}

pub type CallFuture = Pin<Box<dyn Future<Output = Result<CallOutcome, CallError>> + Send>>;

/// A ready-to-call handler: either the terminal executor or a composed
/// middleware stack ending in it.
#[derive(Clone)]
pub struct CallHandler {
    inner: Arc<dyn Fn(Invocation) -> CallFuture + Send + Sync>,
}

impl CallHandler {
    pub fn new(f: impl Fn(Invocation) -> CallFuture + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn call(&self, invocation: Invocation) -> CallFuture {
        (self.inner)(invocation)
    }
}

/// Composable wrapper around call execution.
pub trait Middleware: Send + Sync {
    /// Handle one call. `next` is the continuation that performs (or
    /// further wraps) execution; not calling it short-circuits the call.
    fn execute(&self, invocation: Invocation, next: CallHandler) -> CallFuture;
}

/// Forwards every call unchanged. The unit of composition.
pub struct Identity;

impl Middleware for Identity {
    fn execute(&self, invocation: Invocation, next: CallHandler) -> CallFuture {
        next.call(invocation)
    }
}

/// `first` layered outside `second`:
/// `(A + B).execute(inv, terminal) = A.execute(inv, |i| B.execute(i, terminal))`.
pub struct Composed {
    first: Arc<dyn Middleware>,
    second: Arc<dyn Middleware>,
}

impl Composed {
    pub fn new(first: Arc<dyn Middleware>, second: Arc<dyn Middleware>) -> Self {
        Self { first, second }
    }
}

impl Middleware for Composed {
    fn execute(&self, invocation: Invocation, next: CallHandler) -> CallFuture {
        let second = self.second.clone();
        self.first.execute(
            invocation,
            CallHandler::new(move |inv| second.execute(inv, next.clone())),
        )
    }
}

/// Fold a middleware list into one handler over `terminal`. The first
/// middleware in the list is the outermost layer. Called once per executor.
pub fn compose(middlewares: &[Arc<dyn Middleware>], terminal: CallHandler) -> CallHandler {
    middlewares.iter().rev().fold(terminal, |next, middleware| {
        let middleware = middleware.clone();
        CallHandler::new(move |invocation| middleware.execute(invocation, next.clone()))
    })
}

/// Logs every call entering and leaving the chain.
pub struct CallLogger;

impl Middleware for CallLogger {
    fn execute(&self, invocation: Invocation, next: CallHandler) -> CallFuture {
        Box::pin(async move {
            let request_id = invocation.request_id;
            let service = invocation.service_id.clone();
            let method = invocation.method.clone();
            debug!("call {request_id}: {service}.{method}");
            let result = next.call(invocation).await;
            match &result {
                Ok(_) => debug!("call {request_id}: completed"),
                Err(e) => debug!("call {request_id}: failed: {e}"),
            }
            result
        })
    }
}
