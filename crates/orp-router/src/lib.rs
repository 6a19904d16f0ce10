//! ORP Router — relays envelopes between connected routes.
//!
//! The router owns one outbound sink per route, forwards envelopes to their
//! destination, broadcasts route lifecycle to peers, and enforces the ban
//! list. The connection registry tracks active endpoints and derives a
//! Connected/Disconnected event feed for presentation layers.
//!
//! Transport is external: a connection is handed to the router as a
//! sink/source channel pair bound to whatever socket machinery produced it.

pub mod registry;
pub mod router;

use orp_protocol::EndpointKey;

pub use registry::{ConnectionEvent, ConnectionFeed, ConnectionRegistry};
pub use router::{ConnectionListener, EnvelopeSink, RequestRouter};

/// Router-level hard failures. Per-recipient send problems are logged, not
/// surfaced here; this indicates a correlation bug.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("endpoint key already registered: {0}")]
    DuplicateEndpoint(EndpointKey),
}
