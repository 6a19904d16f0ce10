//! Codec seam — the external serializer the executor consumes.
//!
//! The codec owns the actual value encoding; the executor only cares about
//! the side channel: stream descriptors discovered while walking a value
//! graph. An argument or result may carry live streams, and the codec
//! reports each one together with the channel endpoint the runtime should
//! serve.

use orp_protocol::{CallError, StreamId};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::service::ParamSpec;

/// The runtime-facing end of a stream embedded in a value.
pub enum StreamEndpoint {
    /// Data flows remote→local: the executor pushes decoded elements into
    /// this buffered sink.
    Inbound(mpsc::UnboundedSender<Value>),
    /// Data flows local→remote: the executor drains this source under the
    /// stream's credit budget.
    Outbound(mpsc::UnboundedReceiver<Value>),
}

/// A stream descriptor surfaced while decoding or encoding a value.
pub struct EmbeddedStream {
    pub id: StreamId,
    /// Element spec handed back to the codec for per-element decode.
    pub element: ParamSpec,
    pub endpoint: StreamEndpoint,
}

/// Result of decoding one argument (or one stream element).
pub struct Decoded {
    pub value: Value,
    pub streams: Vec<EmbeddedStream>,
}

impl Decoded {
    pub fn plain(value: Value) -> Self {
        Self {
            value,
            streams: Vec::new(),
        }
    }
}

/// Result of encoding one value.
pub struct Encoded {
    pub value: Value,
    pub streams: Vec<EmbeddedStream>,
}

impl Encoded {
    pub fn plain(value: Value) -> Self {
        Self {
            value,
            streams: Vec::new(),
        }
    }
}

/// Encodes and decodes values, reporting embedded stream descriptors.
pub trait Codec: Send + Sync {
    fn decode(&self, param: &ParamSpec, raw: &Value) -> Result<Decoded, CallError>;
    fn encode(&self, value: &Value) -> Result<Encoded, CallError>;
}

/// Pass-through codec: values are already JSON, nothing carries streams.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, _param: &ParamSpec, raw: &Value) -> Result<Decoded, CallError> {
        Ok(Decoded::plain(raw.clone()))
    }

    fn encode(&self, value: &Value) -> Result<Encoded, CallError> {
        Ok(Encoded::plain(value.clone()))
    }
}
