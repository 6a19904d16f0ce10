//! ORP (Object Relay Protocol) - Protocol Types
//!
//! Wire-level types for the Object Relay Protocol: routes, endpoint keys,
//! envelopes, the closed RPC message set, instance paths, and error codes.
//! This crate is the single source of truth for the structural contract a
//! compatible implementation must match.

pub mod envelope;
pub mod error;
pub mod instance;
pub mod message;
pub mod routes;

pub use envelope::Envelope;
pub use error::{CallError, CallErrorCode};
pub use instance::InstanceId;
pub use message::{RequestId, RpcMessage, StreamId};
pub use routes::{EndpointInfo, EndpointKey, EndpointKind, RouteId, SocketId};
