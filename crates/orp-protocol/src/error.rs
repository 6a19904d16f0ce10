//! Call failure taxonomy and wire-level error object.

use serde::{Deserialize, Serialize};

/// Failure categories a call can terminate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorCode {
    /// The target service id resolved to nothing, locally or via the locator.
    UnresolvedService,
    /// An argument failed to decode; the call never executed.
    RequestError,
    /// The implementation failed while executing the call.
    ExecutionError,
    /// The call was canceled before completing.
    Canceled,
    /// A stream message violated the stream protocol.
    StreamError,

    Custom(i32),
}

impl CallErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::UnresolvedService => 100,
            Self::RequestError => 101,
            Self::ExecutionError => 102,
            Self::Canceled => 103,
            Self::StreamError => 104,
            Self::Custom(c) => *c,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            100 => Self::UnresolvedService,
            101 => Self::RequestError,
            102 => Self::ExecutionError,
            103 => Self::Canceled,
            104 => Self::StreamError,
            c => Self::Custom(c),
        }
    }
}

/// Wire-level error object attached to `CallFailure` and `StreamClosed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl CallError {
    pub fn new(code: CallErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn unresolved_service(service: impl std::fmt::Display) -> Self {
        Self::new(
            CallErrorCode::UnresolvedService,
            format!("Unresolved service: {service}"),
        )
    }

    pub fn request_error(message: impl Into<String>) -> Self {
        Self::new(CallErrorCode::RequestError, message)
    }

    pub fn execution_error(message: impl Into<String>) -> Self {
        Self::new(CallErrorCode::ExecutionError, message)
    }

    pub fn canceled() -> Self {
        Self::new(CallErrorCode::Canceled, "Call canceled")
    }

    pub fn stream_error(message: impl Into<String>) -> Self {
        Self::new(CallErrorCode::StreamError, message)
    }

    pub fn error_code(&self) -> CallErrorCode {
        CallErrorCode::from_code(self.code)
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Call error [{}]: {}", self.code, self.message)
    }
}

impl std::error::Error for CallError {}
