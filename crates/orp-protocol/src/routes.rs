//! Route and endpoint identity types.
//!
//! A `RouteId` is the logical address of a connected party; a `SocketId` is
//! minted fresh for every physical connection. Together with the endpoint
//! kind they form the `EndpointKey` that is unique among simultaneously
//! active connections — a reconnect of the same route always carries a new
//! socket id, so its key never collides with the previous incarnation.

use serde::{Deserialize, Serialize};

/// Logical endpoint identifier used to address a connected party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteId(String);

impl RouteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RouteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RouteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one physical connection, fresh per connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(String);

impl SocketId {
    /// Mint a fresh socket id.
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side of the protocol an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndpointKind {
    Client,
    Backend,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Backend => f.write_str("backend"),
        }
    }
}

/// Unique key of one active connection: (socket id, endpoint kind).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointKey {
    pub socket: SocketId,
    pub kind: EndpointKind,
}

impl EndpointKey {
    pub fn new(socket: SocketId, kind: EndpointKind) -> Self {
        Self { socket, kind }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.socket)
    }
}

/// What an endpoint key maps to: the route it serves and a presentable name.
/// Values are never mutated in place — a changed endpoint is a remove plus
/// an insert under a new key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInfo {
    pub route: RouteId,
    pub name: String,
}

impl EndpointInfo {
    pub fn new(route: RouteId, name: impl Into<String>) -> Self {
        Self {
            route,
            name: name.into(),
        }
    }
}
