//! Connection registry — tracks active endpoints and derives transition events.
//!
//! The registry holds an immutable-per-revision snapshot map. Every mutation
//! publishes a fresh `Arc` snapshot to each subscriber's queue; subscribers
//! diff successive snapshots into Connected/Disconnected events, finishing
//! one revision before moving to the next — no revision is ever skipped.
//! Because endpoint keys are unique per physical connection and values are
//! never mutated in place, a key can never go Connected→Connected without
//! an intervening Disconnected.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use orp_protocol::{EndpointInfo, EndpointKey};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use crate::RouterError;

type Snapshot = Arc<HashMap<EndpointKey, EndpointInfo>>;

/// Endpoint transition event emitted by the registry feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected {
        key: EndpointKey,
        info: EndpointInfo,
    },
    Disconnected {
        key: EndpointKey,
        info: EndpointInfo,
    },
}

struct RegistryInner {
    current: Snapshot,
    subscribers: Vec<UnboundedSender<Snapshot>>,
}

/// Tracks active endpoints. One revision per connect/disconnect.
pub struct ConnectionRegistry {
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                current: Snapshot::default(),
                subscribers: Vec::new(),
            }),
        }
    }

    /// Register an endpoint. Fails if the key is already present — endpoint
    /// keys carry a fresh socket id per connection, so a collision indicates
    /// a correlation bug, not a reconnect.
    pub fn on_connect(&self, key: EndpointKey, info: EndpointInfo) -> Result<(), RouterError> {
        let mut inner = self.inner.lock();
        if inner.current.contains_key(&key) {
            return Err(RouterError::DuplicateEndpoint(key));
        }
        let mut next = HashMap::clone(&inner.current);
        next.insert(key.clone(), info);
        Self::publish(&mut inner, Arc::new(next));
        debug!("endpoint connected: {key}");
        Ok(())
    }

    /// Remove an endpoint. Unknown keys are logged and ignored.
    pub fn on_disconnect(&self, key: &EndpointKey) {
        let mut inner = self.inner.lock();
        if !inner.current.contains_key(key) {
            warn!("disconnect for unknown endpoint: {key}");
            return;
        }
        let mut next = HashMap::clone(&inner.current);
        next.remove(key);
        Self::publish(&mut inner, Arc::new(next));
        debug!("endpoint disconnected: {key}");
    }

    fn publish(inner: &mut RegistryInner, next: Snapshot) {
        inner.current = next.clone();
        inner.subscribers.retain(|tx| tx.send(next.clone()).is_ok());
    }

    /// Current revision snapshot.
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().current.clone()
    }

    /// Subscribe to the update feed. The feed starts from an empty baseline,
    /// so endpoints already connected at subscription time are delivered as
    /// Connected events first.
    pub fn subscribe(&self) -> ConnectionFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        if !inner.current.is_empty() {
            let _ = tx.send(inner.current.clone());
        }
        inner.subscribers.push(tx);
        ConnectionFeed {
            rx,
            seen: Snapshot::default(),
            pending: VecDeque::new(),
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Derived subscription over registry revisions.
///
/// For each revision the feed emits one Connected event per newly-present
/// key and one Disconnected event per newly-absent key, in that order,
/// before moving to the next revision. Events are never duplicated or
/// reordered within a revision step.
pub struct ConnectionFeed {
    rx: UnboundedReceiver<Snapshot>,
    seen: Snapshot,
    pending: VecDeque<ConnectionEvent>,
}

impl ConnectionFeed {
    /// Next transition event. Returns `None` once the registry is gone and
    /// all buffered events are drained.
    pub async fn recv(&mut self) -> Option<ConnectionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match self.rx.recv().await {
                Some(snapshot) => {
                    self.diff(&snapshot);
                    self.seen = snapshot;
                }
                None => return self.pending.pop_front(),
            }
        }
    }

    fn diff(&mut self, current: &Snapshot) {
        let mut connected: Vec<_> = current
            .iter()
            .filter(|(key, _)| !self.seen.contains_key(*key))
            .collect();
        connected.sort_by(|a, b| a.0.cmp(b.0));
        for (key, info) in connected {
            self.pending.push_back(ConnectionEvent::Connected {
                key: key.clone(),
                info: info.clone(),
            });
        }

        let mut disconnected: Vec<_> = self
            .seen
            .iter()
            .filter(|(key, _)| !current.contains_key(*key))
            .collect();
        disconnected.sort_by(|a, b| a.0.cmp(b.0));
        for (key, info) in disconnected {
            self.pending.push_back(ConnectionEvent::Disconnected {
                key: key.clone(),
                info: info.clone(),
            });
        }
    }
}
