//! Stream channels and credit accounting.
//!
//! A stream is one direction of a bidirectional data channel multiplexed
//! over a route. The from-remote side is a buffered sink; the to-remote
//! side is gated by a credit budget that only grows through explicit
//! `StreamNext` grants from the consumer.

use orp_protocol::StreamId;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::sync::mpsc;

use crate::codec::{EmbeddedStream, StreamEndpoint};
use crate::service::ParamSpec;

/// The budget was closed because the stream was torn down.
#[derive(Debug, thiserror::Error)]
#[error("stream budget closed")]
pub struct BudgetClosed;

/// Non-negative credit counter for one outbound stream.
///
/// Grants are additive; acquiring one unit suspends while the budget is
/// zero. Closing wakes every waiter with an error.
pub struct StreamBudget {
    permits: Semaphore,
}

impl StreamBudget {
    /// A new budget starts at zero — nothing may be sent before the first
    /// grant.
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
        }
    }

    /// Add `count` credits.
    pub fn grant(&self, count: u32) {
        self.permits.add_permits(count as usize);
    }

    /// Consume one credit, waiting for a grant if none is available.
    pub async fn acquire(&self) -> Result<(), BudgetClosed> {
        match self.permits.acquire().await {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(BudgetClosed),
        }
    }

    pub fn close(&self) {
        self.permits.close();
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for StreamBudget {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a from-remote stream channel: the descriptor a codec reports, and
/// the receiver the local consumer reads decoded elements from.
pub fn inbound_stream(
    id: StreamId,
    element: ParamSpec,
) -> (EmbeddedStream, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EmbeddedStream {
            id,
            element,
            endpoint: StreamEndpoint::Inbound(tx),
        },
        rx,
    )
}

/// Build a to-remote stream channel: the descriptor a codec reports, and
/// the sender the local producer writes elements into. The runtime drains
/// the other end under the stream's credit budget.
pub fn outbound_stream(
    id: StreamId,
    element: ParamSpec,
) -> (EmbeddedStream, mpsc::UnboundedSender<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        EmbeddedStream {
            id,
            element,
            endpoint: StreamEndpoint::Outbound(rx),
        },
        tx,
    )
}
