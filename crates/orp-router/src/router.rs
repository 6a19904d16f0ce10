//! Request router — per-route sinks, envelope relay, ban control plane.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use orp_protocol::{EndpointInfo, EndpointKey, EndpointKind, Envelope, RouteId, SocketId};
use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::RouterError;
use crate::registry::ConnectionRegistry;

/// Outbound half of a connection, owned by the router while the connection
/// is registered.
pub type EnvelopeSink = UnboundedSender<Envelope>;

/// External hook notified of endpoint lifecycle. Implementations must not
/// block: they run inline on the connection task.
pub trait ConnectionListener: Send + Sync {
    fn on_connect(&self, _key: &EndpointKey, _info: &EndpointInfo) {}
    fn on_disconnect(&self, _key: &EndpointKey, _info: &EndpointInfo) {}
}

struct RouteEntry {
    socket: SocketId,
    sink: EnvelopeSink,
    /// Wake used to force-close this connection when a newer one takes the
    /// route. Carries a permit, so a replacement that fires before the old
    /// connection reaches its select loop is not lost.
    force_close: Arc<Notify>,
}

/// Routes envelopes between connected endpoints.
///
/// One `handle_connection` call per physical connection; the router relays
/// inbound envelopes to their destination's sink, broadcasts route lifecycle
/// to peers, and tears a connection down when its route is banned or its
/// registration is replaced.
pub struct RequestRouter {
    routes: DashMap<RouteId, RouteEntry>,
    banned: Mutex<HashSet<RouteId>>,
    ban_rev: watch::Sender<u64>,
    registry: ConnectionRegistry,
    listener: Option<Arc<dyn ConnectionListener>>,
}

impl RequestRouter {
    pub fn new() -> Self {
        let (ban_rev, _) = watch::channel(0);
        Self {
            routes: DashMap::new(),
            banned: Mutex::new(HashSet::new()),
            ban_rev,
            registry: ConnectionRegistry::new(),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// The endpoint registry and its Connected/Disconnected feed.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    // ── Ban control plane ─────────────────────────────────────────────────

    /// Ban a route. An active connection on it is torn down; a connection
    /// waiting to register stays blocked until `unban`.
    pub fn ban(&self, route: RouteId) {
        let changed = self.banned.lock().insert(route.clone());
        if changed {
            info!("route banned: {route}");
            self.bump_ban_rev();
        }
    }

    pub fn unban(&self, route: &RouteId) {
        let changed = self.banned.lock().remove(route);
        if changed {
            info!("route unbanned: {route}");
            self.bump_ban_rev();
        }
    }

    pub fn is_banned(&self, route: &RouteId) -> bool {
        self.banned.lock().contains(route)
    }

    /// Current ban list.
    pub fn banned(&self) -> Vec<RouteId> {
        let mut list: Vec<_> = self.banned.lock().iter().cloned().collect();
        list.sort();
        list
    }

    fn bump_ban_rev(&self) {
        self.ban_rev.send_modify(|rev| *rev += 1);
    }

    async fn wait_until_unbanned(&self, route: &RouteId) {
        let mut rx = self.ban_rev.subscribe();
        loop {
            if !self.is_banned(route) {
                return;
            }
            debug!("route {route} is banned — holding connection until unbanned");
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn wait_until_banned(&self, route: &RouteId) {
        let mut rx = self.ban_rev.subscribe();
        loop {
            if self.is_banned(route) {
                return;
            }
            if rx.changed().await.is_err() {
                // Ban sender lives as long as the router; pend rather than
                // spuriously tearing the connection down.
                std::future::pending::<()>().await;
            }
        }
    }

    // ── Connection lifecycle ──────────────────────────────────────────────

    /// Serve one connection for its whole lifetime.
    ///
    /// `outbound_sink` receives envelopes destined for this connection;
    /// `inbound` yields envelopes the connection sends. Returns when the
    /// inbound channel closes, the route is banned, or a newer connection
    /// takes the route.
    pub async fn handle_connection(
        &self,
        route: RouteId,
        kind: EndpointKind,
        name: impl Into<String>,
        outbound_sink: EnvelopeSink,
        mut inbound: UnboundedReceiver<Envelope>,
    ) -> Result<(), RouterError> {
        let socket = SocketId::fresh();
        let name = name.into();

        self.wait_until_unbanned(&route).await;

        let force_close = Arc::new(Notify::new());
        let entry = RouteEntry {
            socket: socket.clone(),
            sink: outbound_sink.clone(),
            force_close: force_close.clone(),
        };
        if let Some(previous) = self.routes.insert(route.clone(), entry) {
            warn!(
                "route {route} reconnected (socket {} replaces {}) — closing previous connection",
                socket, previous.socket
            );
            previous.force_close.notify_one();
        }

        self.broadcast_except(
            &route,
            &Envelope::RouteOpened {
                route: route.clone(),
            },
        );

        let key = EndpointKey::new(socket.clone(), kind);
        let info = EndpointInfo::new(route.clone(), name);
        if let Err(e) = self.registry.on_connect(key.clone(), info.clone()) {
            error!("endpoint registration failed for route {route}: {e}");
            if self.remove_registration(&route, &socket) {
                self.broadcast_except(
                    &route,
                    &Envelope::RouteClosed {
                        route: route.clone(),
                    },
                );
            }
            return Err(e);
        }
        if let Some(listener) = &self.listener {
            listener.on_connect(&key, &info);
        }
        info!("connection open: route {route} ({key})");

        // Race relay against ban and replacement; whichever finishes first
        // cancels the others.
        tokio::select! {
            _ = self.relay(&route, &outbound_sink, &mut inbound) => {
                debug!("inbound channel closed for route {route}");
            }
            _ = self.wait_until_banned(&route) => {
                info!("route {route} banned — tearing down connection");
            }
            _ = force_close.notified() => {
                debug!("connection on route {route} superseded");
            }
        }

        let removed = self.remove_registration(&route, &socket);
        self.registry.on_disconnect(&key);
        if let Some(listener) = &self.listener {
            listener.on_disconnect(&key, &info);
        }
        if removed {
            self.broadcast_except(
                &route,
                &Envelope::RouteClosed {
                    route: route.clone(),
                },
            );
        }
        info!("connection closed: route {route} (removed: {removed})");
        Ok(())
    }

    /// Relay inbound envelopes until the channel closes.
    async fn relay(
        &self,
        route: &RouteId,
        sink: &EnvelopeSink,
        inbound: &mut UnboundedReceiver<Envelope>,
    ) {
        while let Some(envelope) = inbound.recv().await {
            match envelope {
                Envelope::Message {
                    origin,
                    destination,
                    payload,
                } => {
                    let dest = destination.clone();
                    let envelope = Envelope::Message {
                        origin,
                        destination,
                        payload,
                    };
                    match self.routes.get(&dest) {
                        Some(entry) => {
                            if entry.sink.send(envelope).is_err() {
                                warn!("relay to route {dest} failed: sink closed");
                            }
                        }
                        None => {
                            debug!("no route {dest} — informing sender {route}");
                            let _ = sink.send(Envelope::RouteClosed { route: dest });
                        }
                    }
                }
                other => {
                    debug!("dropping inbound {} envelope from route {route}", other.kind());
                }
            }
        }
    }

    /// Remove this connection's registration, but only if it still holds
    /// this connection's sink — a newer reconnection's entry is left alone.
    fn remove_registration(&self, route: &RouteId, socket: &SocketId) -> bool {
        self.routes
            .remove_if(route, |_, entry| entry.socket == *socket)
            .is_some()
    }

    /// Best-effort broadcast to every registered route except `skip`. A
    /// failed send to one peer does not affect the others.
    fn broadcast_except(&self, skip: &RouteId, envelope: &Envelope) {
        for entry in self.routes.iter() {
            if entry.key() == skip {
                continue;
            }
            if entry.value().sink.send(envelope.clone()).is_err() {
                warn!(
                    "broadcast of {} to route {} failed: sink closed",
                    envelope.kind(),
                    entry.key()
                );
            }
        }
    }
}

impl Default for RequestRouter {
    fn default() -> Self {
        Self::new()
    }
}
