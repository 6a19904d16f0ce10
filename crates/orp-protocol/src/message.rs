//! The closed set of RPC messages carried inside envelopes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CallError;
use crate::instance::InstanceId;

/// Identifier correlating a call request with its single terminal response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of one multiplexed data stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh stream id.
    pub fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// RPC message variants. Every `CallRequest` yields exactly one `CallResult`
/// or `CallFailure`; stream and resource traffic is fire-and-forget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RpcMessage {
    #[serde(rename_all = "camelCase")]
    CallRequest {
        request_id: RequestId,
        service_id: InstanceId,
        method: String,
        args: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    CallResult {
        request_id: RequestId,
        result: Value,
    },
    #[serde(rename_all = "camelCase")]
    CallFailure {
        request_id: RequestId,
        error: CallError,
    },
    #[serde(rename_all = "camelCase")]
    CancelCall { request_id: RequestId },
    #[serde(rename_all = "camelCase")]
    StreamInit { stream_id: StreamId },
    #[serde(rename_all = "camelCase")]
    StreamData {
        stream_id: StreamId,
        payload: Value,
    },
    #[serde(rename_all = "camelCase")]
    StreamNext {
        stream_id: StreamId,
        count: u32,
    },
    #[serde(rename_all = "camelCase")]
    StreamClosed {
        stream_id: StreamId,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<CallError>,
    },
    #[serde(rename_all = "camelCase")]
    ResourceConsumed { resource_path: InstanceId },
}

impl RpcMessage {
    /// Short variant name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CallRequest { .. } => "callRequest",
            Self::CallResult { .. } => "callResult",
            Self::CallFailure { .. } => "callFailure",
            Self::CancelCall { .. } => "cancelCall",
            Self::StreamInit { .. } => "streamInit",
            Self::StreamData { .. } => "streamData",
            Self::StreamNext { .. } => "streamNext",
            Self::StreamClosed { .. } => "streamClosed",
            Self::ResourceConsumed { .. } => "resourceConsumed",
        }
    }
}
