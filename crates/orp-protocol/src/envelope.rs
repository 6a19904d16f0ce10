//! Transport envelopes.
//!
//! An envelope either carries an RPC message between two routes or signals
//! route lifecycle. Control variants travel on the same channel as
//! application traffic.

use serde::{Deserialize, Serialize};

use crate::message::RpcMessage;
use crate::routes::RouteId;

/// Transport message carrying origin/destination routes and an RPC payload,
/// or a route lifecycle signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    #[serde(rename_all = "camelCase")]
    Message {
        origin: RouteId,
        destination: RouteId,
        payload: RpcMessage,
    },
    #[serde(rename_all = "camelCase")]
    RouteOpened { route: RouteId },
    #[serde(rename_all = "camelCase")]
    RouteClosed { route: RouteId },
}

impl Envelope {
    pub fn message(origin: RouteId, destination: RouteId, payload: RpcMessage) -> Self {
        Self::Message {
            origin,
            destination,
            payload,
        }
    }

    /// Short variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::RouteOpened { .. } => "routeOpened",
            Self::RouteClosed { .. } => "routeClosed",
        }
    }
}
