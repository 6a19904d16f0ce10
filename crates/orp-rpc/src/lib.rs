//! ORP RPC runtime — call execution, ownership tracking, and streams.
//!
//! The executor is the protocol state machine for one route: it dispatches
//! incoming calls through a composed middleware chain to local service
//! implementations, mints and tracks remote objects and resources in an
//! ownership forest, and multiplexes credit-gated data streams. Transport
//! and serialization stay external — the executor consumes an envelope
//! channel pair and a `Codec` that reports embedded stream descriptors.

pub mod codec;
pub mod executor;
pub mod middleware;
pub mod objects;
pub mod service;
pub mod streams;

use orp_protocol::InstanceId;

pub use codec::{Codec, Decoded, EmbeddedStream, Encoded, JsonCodec, StreamEndpoint};
pub use executor::{DISPOSE_METHOD, ExecutorError, RpcExecutor};
pub use middleware::{
    CallFuture, CallHandler, CallLogger, Composed, Identity, Invocation, Middleware, compose,
};
pub use objects::ObjectRegistry;
pub use service::{
    CallOutcome, MethodSpec, NewRemoteObject, NewResource, ParamSpec, RemoteService,
    RemoteServiceDyn, ResolvedService, ResourceLease, ServiceDescriptor, ServiceLocator,
    StaticLocator, TaskScope,
};
pub use streams::{BudgetClosed, StreamBudget, inbound_stream, outbound_stream};

/// Ownership registry invariant violations. These indicate correlation
/// bugs, so they are hard failures rather than logged-and-swallowed.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("remote object path must be unique: {0}")]
    DuplicatePath(InstanceId),

    #[error("resource already registered: {0}")]
    DuplicateResource(InstanceId),
}
