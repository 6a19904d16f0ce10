//! Service model — descriptors, dispatch traits, and task scopes.
//!
//! A `RemoteService` is a local implementation invokable by method name with
//! named JSON arguments. The trait uses `impl Future` returns; the
//! object-safe `RemoteServiceDyn` wrapper is what registries and locators
//! store.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use orp_protocol::{CallError, InstanceId};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

/// One declared parameter of a method. The codec receives this when decoding
/// the corresponding argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One callable method of a service.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub params: Vec<ParamSpec>,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>, params: Vec<ParamSpec>) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Declared shape of a service: its presentable name and method table.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<MethodSpec>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, methods: Vec<MethodSpec>) -> Self {
        Self {
            name: name.into(),
            methods,
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// What a dispatched call produced, classified for the executor.
pub enum CallOutcome {
    /// A plain value, encoded and returned in the `CallResult`.
    Value(Value),
    /// A new remote object; the caller receives only its minted instance id.
    RemoteObject(NewRemoteObject),
    /// A resource to acquire asynchronously; the caller receives its minted
    /// instance id once acquisition completes.
    Resource(NewResource),
}

pub struct NewRemoteObject {
    pub descriptor: Arc<ServiceDescriptor>,
    pub instance: Arc<dyn RemoteServiceDyn>,
}

pub struct NewResource {
    pub descriptor: Arc<ServiceDescriptor>,
    pub acquire: AcquireFuture,
}

pub type AcquireFuture =
    Pin<Box<dyn Future<Output = Result<ResourceLease, CallError>> + Send + 'static>>;

/// An acquired resource: the instance callers dispatch to, plus release
/// glue that runs on every exit path — including cancellation of the job
/// holding the lease.
pub struct ResourceLease {
    pub instance: Arc<dyn RemoteServiceDyn>,
    releaser: Option<Box<dyn FnOnce() + Send>>,
}

impl ResourceLease {
    pub fn new(instance: Arc<dyn RemoteServiceDyn>) -> Self {
        Self {
            instance,
            releaser: None,
        }
    }

    pub fn with_releaser(
        instance: Arc<dyn RemoteServiceDyn>,
        releaser: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            instance,
            releaser: Some(Box::new(releaser)),
        }
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if let Some(release) = self.releaser.take() {
            release();
        }
    }
}

/// Trait implemented by local service and remote-object implementations.
pub trait RemoteService: Send + Sync {
    /// The declared shape of this service.
    fn descriptor(&self) -> Arc<ServiceDescriptor>;

    /// Invoke a method with decoded, named arguments.
    fn dispatch(
        &self,
        method: &str,
        args: Map<String, Value>,
    ) -> impl Future<Output = Result<CallOutcome, CallError>> + Send;

    /// The execution scope call jobs should be parented to. `None` means the
    /// executor's fallback scope.
    fn scope(&self) -> Option<TaskScope> {
        None
    }
}

/// Object-safe wrapper for the `RemoteService` trait.
pub trait RemoteServiceDyn: Send + Sync {
    fn descriptor_dyn(&self) -> Arc<ServiceDescriptor>;
    fn dispatch_dyn<'a>(
        &'a self,
        method: &'a str,
        args: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<CallOutcome, CallError>> + Send + 'a>>;
    fn scope_dyn(&self) -> Option<TaskScope>;
}

impl<T: RemoteService> RemoteServiceDyn for T {
    fn descriptor_dyn(&self) -> Arc<ServiceDescriptor> {
        self.descriptor()
    }
    fn dispatch_dyn<'a>(
        &'a self,
        method: &'a str,
        args: Map<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<CallOutcome, CallError>> + Send + 'a>> {
        Box::pin(self.dispatch(method, args))
    }
    fn scope_dyn(&self) -> Option<TaskScope> {
        self.scope()
    }
}

/// A resolved target: descriptor plus implementation.
#[derive(Clone)]
pub struct ResolvedService {
    pub descriptor: Arc<ServiceDescriptor>,
    pub instance: Arc<dyn RemoteServiceDyn>,
}

/// Resolves a service id when it is not found in the local remote-object
/// registry. External collaborator.
pub trait ServiceLocator: Send + Sync {
    fn resolve(&self, service: &InstanceId) -> Option<ResolvedService>;
}

/// Locator over a fixed service table. Sufficient for hosts that register
/// their root services up front.
pub struct StaticLocator {
    services: parking_lot::RwLock<std::collections::HashMap<InstanceId, ResolvedService>>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self {
            services: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    /// Register a root service under a well-known id.
    pub fn register<S: RemoteService + 'static>(&self, id: InstanceId, service: S) {
        let instance: Arc<dyn RemoteServiceDyn> = Arc::new(service);
        let descriptor = instance.descriptor_dyn();
        self.services.write().insert(
            id,
            ResolvedService {
                descriptor,
                instance,
            },
        );
    }
}

impl Default for StaticLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceLocator for StaticLocator {
    fn resolve(&self, service: &InstanceId) -> Option<ResolvedService> {
        self.services.read().get(service).cloned()
    }
}

/// A group of cancelable tasks. Cancelling the scope aborts everything
/// spawned through it; one task's cancellation never touches its siblings.
#[derive(Clone)]
pub struct TaskScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    name: String,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl TaskScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                name: name.into(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle.abort_handle());
        handle
    }

    /// Abort every live task in this scope.
    pub fn cancel_all(&self) {
        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
        let live = tasks.iter().filter(|h| !h.is_finished()).count();
        if live > 0 {
            debug!("scope {}: aborting {live} tasks", self.inner.name);
        }
        for handle in tasks {
            handle.abort();
        }
    }
}
