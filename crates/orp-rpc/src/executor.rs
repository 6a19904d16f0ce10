//! RPC executor — the per-route protocol state machine.
//!
//! One executor serves one connection's envelope channel pair. It dispatches
//! incoming calls to local implementations through the composed middleware
//! handler, tracks remote-object/resource lifetime in the ownership
//! registry, serves embedded streams under credit, and serializes all
//! responses through a single unbounded queue drained by one sender task —
//! responses for concurrently executing calls never interleave mid-message.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use orp_protocol::{CallError, Envelope, InstanceId, RequestId, RouteId, RpcMessage, StreamId};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, EmbeddedStream, StreamEndpoint};
use crate::middleware::{CallHandler, Invocation, Middleware, compose};
use crate::objects::ObjectRegistry;
use crate::service::{
    CallOutcome, NewRemoteObject, NewResource, ParamSpec, ResolvedService, ServiceLocator,
    TaskScope,
};
use crate::streams::StreamBudget;

/// Invoking this method on a remote object disposes it (and all of its
/// descendants) once the call completes.
pub const DISPOSE_METHOD: &str = "clientDispose";

/// Credit window granted when an inbound stream starts serving; replenished
/// one credit per delivered element.
const INBOUND_STREAM_WINDOW: u32 = 64;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("executor is already serving")]
    AlreadyServing,
}

enum Outbound {
    Message {
        destination: RouteId,
        message: RpcMessage,
        flushed: Option<oneshot::Sender<()>>,
    },
    Shutdown,
}

struct RequestEntry {
    route: RouteId,
    job: AbortHandle,
}

enum StreamEntry {
    /// From-remote: data arriving as `StreamData` is decoded and pushed
    /// into the buffered sink.
    Inbound {
        element: ParamSpec,
        sink: UnboundedSender<Value>,
        route: RouteId,
    },
    /// To-remote: a producer task drains the local source under budget.
    Outbound {
        budget: Arc<StreamBudget>,
        route: RouteId,
        producer: Mutex<Option<AbortHandle>>,
    },
}

impl StreamEntry {
    fn route(&self) -> &RouteId {
        match self {
            Self::Inbound { route, .. } => route,
            Self::Outbound { route, .. } => route,
        }
    }

    fn close(self) {
        match self {
            Self::Inbound { sink, .. } => drop(sink),
            Self::Outbound {
                budget, producer, ..
            } => {
                budget.close();
                if let Some(task) = producer.lock().take() {
                    task.abort();
                }
            }
        }
    }
}

/// Deferred serve-start for a registered stream. Argument streams start
/// immediately; result streams start only after the `CallResult` flushes.
enum StartServing {
    /// Grant the initial window so the remote producer may begin.
    Grant { id: StreamId, route: RouteId },
    /// Spawn the producer task draining the local source.
    Produce {
        id: StreamId,
        route: RouteId,
        source: UnboundedReceiver<Value>,
    },
}

impl StartServing {
    fn id(&self) -> &StreamId {
        match self {
            Self::Grant { id, .. } => id,
            Self::Produce { id, .. } => id,
        }
    }
}

/// The per-route protocol state machine. Construct with `new`, add
/// middleware, then drive it with [`RpcExecutor::serve`].
pub struct RpcExecutor {
    state: Arc<ExecutorState>,
    middlewares: Vec<Arc<dyn Middleware>>,
}

struct ExecutorState {
    /// Self-handle for spawning tasks that outlive the current call frame.
    /// Always upgradable while any method of this state is running.
    me: Weak<ExecutorState>,
    route: RouteId,
    locator: Arc<dyn ServiceLocator>,
    codec: Arc<dyn Codec>,
    handler: OnceLock<CallHandler>,
    objects: ObjectRegistry,
    requests: DashMap<RequestId, RequestEntry>,
    requests_by_route: DashMap<RouteId, HashSet<RequestId>>,
    streams: DashMap<StreamId, StreamEntry>,
    streams_by_route: DashMap<RouteId, HashSet<StreamId>>,
    outbound: UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<UnboundedReceiver<Outbound>>>,
    fallback_scope: TaskScope,
}

impl RpcExecutor {
    pub fn new(route: RouteId, locator: Arc<dyn ServiceLocator>, codec: Arc<dyn Codec>) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let fallback_scope = TaskScope::new(format!("executor:{route}"));
        Self {
            state: Arc::new_cyclic(|me| ExecutorState {
                me: me.clone(),
                route,
                locator,
                codec,
                handler: OnceLock::new(),
                objects: ObjectRegistry::new(),
                requests: DashMap::new(),
                requests_by_route: DashMap::new(),
                streams: DashMap::new(),
                streams_by_route: DashMap::new(),
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                fallback_scope,
            }),
            middlewares: Vec::new(),
        }
    }

    /// Add a middleware layer. Layers execute in registration order,
    /// first-registered outermost.
    pub fn with_middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn route(&self) -> &RouteId {
        &self.state.route
    }

    /// The remote-object/resource registry, for introspection and for hosts
    /// that pre-register objects.
    pub fn objects(&self) -> &ObjectRegistry {
        &self.state.objects
    }

    /// Serve one connection: consume `incoming` envelopes and emit responses
    /// through `outgoing` until the incoming channel closes. On shutdown,
    /// every route still tracked is cleaned up exactly as if it had closed.
    pub async fn serve(
        &self,
        mut incoming: UnboundedReceiver<Envelope>,
        outgoing: UnboundedSender<Envelope>,
    ) -> Result<(), ExecutorError> {
        let Some(mut outbound_rx) = self.state.outbound_rx.lock().take() else {
            return Err(ExecutorError::AlreadyServing);
        };

        // Compose the middleware handler once for this executor.
        let terminal = CallHandler::new(|invocation: Invocation| {
            Box::pin(async move {
                let Invocation {
                    method,
                    args,
                    target,
                    ..
                } = invocation;
                target.instance.dispatch_dyn(&method, args).await
            })
        });
        let _ = self.state.handler.set(compose(&self.middlewares, terminal));

        // Single sender task: drains the unbounded queue in FIFO order and
        // acknowledges flushes.
        let own_route = self.state.route.clone();
        let sender = tokio::spawn(async move {
            while let Some(item) = outbound_rx.recv().await {
                match item {
                    Outbound::Message {
                        destination,
                        message,
                        flushed,
                    } => {
                        let envelope = Envelope::Message {
                            origin: own_route.clone(),
                            destination,
                            payload: message,
                        };
                        if outgoing.send(envelope).is_err() {
                            error!("transport sink closed for route {own_route}");
                            break;
                        }
                        if let Some(ack) = flushed {
                            let _ = ack.send(());
                        }
                    }
                    Outbound::Shutdown => break,
                }
            }
        });

        info!("executor serving route {}", self.state.route);
        while let Some(envelope) = incoming.recv().await {
            match envelope {
                Envelope::Message {
                    origin, payload, ..
                } => self.state.dispatch(origin, payload),
                Envelope::RouteClosed { route } => self.state.cleanup_route(&route),
                Envelope::RouteOpened { route } => debug!("route opened: {route}"),
            }
        }

        debug!("incoming channel closed — shutting down executor for {}", self.state.route);
        let mut routes: Vec<RouteId> = self
            .state
            .requests_by_route
            .iter()
            .map(|e| e.key().clone())
            .collect();
        routes.extend(self.state.streams_by_route.iter().map(|e| e.key().clone()));
        routes.sort();
        routes.dedup();
        for route in routes {
            self.state.cleanup_route(&route);
        }
        self.state.fallback_scope.cancel_all();

        let _ = self.state.outbound.send(Outbound::Shutdown);
        let _ = sender.await;
        Ok(())
    }
}

impl ExecutorState {
    fn dispatch(&self, origin: RouteId, message: RpcMessage) {
        match message {
            RpcMessage::CallRequest {
                request_id,
                service_id,
                method,
                args,
            } => self.handle_call(origin, request_id, service_id, method, args),
            RpcMessage::CancelCall { request_id } => self.handle_cancel(request_id),
            RpcMessage::StreamInit { stream_id } => self.handle_stream_init(origin, stream_id),
            RpcMessage::StreamData { stream_id, payload } => {
                self.handle_stream_data(stream_id, payload)
            }
            RpcMessage::StreamNext { stream_id, count } => {
                self.handle_stream_next(stream_id, count)
            }
            RpcMessage::StreamClosed { stream_id, error } => {
                self.handle_stream_closed(stream_id, error)
            }
            RpcMessage::ResourceConsumed { resource_path } => {
                debug!("resource consumed by peer: {resource_path}");
                self.objects.unregister_resource(&resource_path);
            }
            RpcMessage::CallResult { request_id, .. }
            | RpcMessage::CallFailure { request_id, .. } => {
                debug!("unexpected response for {request_id} on serving route — dropped");
            }
        }
    }

    // ── Calls ─────────────────────────────────────────────────────────────

    fn handle_call(
        &self,
        origin: RouteId,
        request_id: RequestId,
        service_id: InstanceId,
        method: String,
        args: Map<String, Value>,
    ) {
        let resolved_locally = self.objects.lookup(&service_id);
        let local = resolved_locally.is_some();
        let Some(target) = resolved_locally.or_else(|| self.locator.resolve(&service_id)) else {
            warn!("call {request_id}: unresolved service {service_id}");
            self.send(
                &origin,
                RpcMessage::CallFailure {
                    request_id,
                    error: CallError::unresolved_service(&service_id),
                },
            );
            return;
        };

        let Some(method_spec) = target.descriptor.method(&method).cloned() else {
            self.send(
                &origin,
                RpcMessage::CallFailure {
                    request_id,
                    error: CallError::request_error(format!(
                        "Unknown method '{method}' on {service_id}"
                    )),
                },
            );
            return;
        };

        // Decode arguments; streams embedded in them serve immediately.
        let mut decoded_args = Map::new();
        let mut starts = Vec::new();
        for param in &method_spec.params {
            let raw = args.get(&param.name).cloned().unwrap_or(Value::Null);
            match self.codec.decode(param, &raw) {
                Ok(decoded) => {
                    starts.extend(self.register_streams(&origin, decoded.streams));
                    decoded_args.insert(param.name.clone(), decoded.value);
                }
                Err(error) => {
                    debug!("call {request_id}: argument '{}' failed to decode: {error}", param.name);
                    // Streams surfaced by earlier arguments never started
                    // serving; drop their registrations too.
                    for start in &starts {
                        self.remove_stream(start.id());
                    }
                    self.send(
                        &origin,
                        RpcMessage::CallFailure {
                            request_id,
                            error: CallError::request_error(format!(
                                "Argument '{}' failed to decode: {}",
                                param.name, error.message
                            )),
                        },
                    );
                    return;
                }
            }
        }
        self.start_serving(starts);

        // Register the job before execution starts: the spawned task waits
        // for the go signal, which is sent only after both tables hold the
        // entry, so a CancelCall can never race a not-yet-registered job.
        let scope = target
            .instance
            .scope_dyn()
            .unwrap_or_else(|| self.fallback_scope.clone());
        let (go_tx, go_rx) = oneshot::channel::<()>();
        let Some(state) = self.me.upgrade() else {
            return;
        };
        let job_origin = origin.clone();
        let job_service = service_id.clone();
        let job = scope.spawn(async move {
            if go_rx.await.is_err() {
                return;
            }
            state
                .run_call(job_origin, request_id, job_service, method, decoded_args, target, local)
                .await;
        });
        if let Some(previous) = self.requests.insert(
            request_id,
            RequestEntry {
                route: origin.clone(),
                job: job.abort_handle(),
            },
        ) {
            warn!("request id {request_id} reused — aborting previous job");
            previous.job.abort();
        }
        self.requests_by_route
            .entry(origin)
            .or_default()
            .insert(request_id);
        let _ = go_tx.send(());
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_call(
        self: Arc<Self>,
        origin: RouteId,
        request_id: RequestId,
        service_id: InstanceId,
        method: String,
        args: Map<String, Value>,
        target: ResolvedService,
        local: bool,
    ) {
        let Some(handler) = self.handler.get() else {
            return;
        };
        let scope = target
            .instance
            .scope_dyn()
            .unwrap_or_else(|| self.fallback_scope.clone());
        let invocation = Invocation {
            route: origin.clone(),
            request_id,
            service_id: service_id.clone(),
            method: method.clone(),
            args,
            target,
        };

        let outcome = handler.call(invocation).await;

        // Disposal: invoking the canonical disposal method on a remote
        // object unregisters it — and every descendant — once execution is
        // done, before the reply can reach the caller.
        if local && method == DISPOSE_METHOD {
            debug!("disposing remote object {service_id}");
            self.objects.unregister_remote_object(&service_id);
        }

        let finished_inline = match outcome {
            Err(error) => {
                debug!("call {request_id} failed: {error}");
                self.send(&origin, RpcMessage::CallFailure { request_id, error });
                true
            }
            Ok(CallOutcome::Value(value)) => {
                self.finish_with_value(&origin, request_id, value).await;
                true
            }
            Ok(CallOutcome::RemoteObject(object)) => {
                self.finish_with_object(&origin, request_id, &service_id, &method, object);
                true
            }
            Ok(CallOutcome::Resource(resource)) => {
                self.hand_off_to_resource(&origin, request_id, &service_id, &method, resource, &scope);
                false
            }
        };

        if finished_inline {
            self.finish_request(request_id);
        }
    }

    async fn finish_with_value(&self, origin: &RouteId, request_id: RequestId, value: Value) {
        match self.codec.encode(&value) {
            Ok(encoded) => {
                // Result-embedded streams must not race ahead of the result
                // envelope: register now, serve after the flush ack.
                let starts = self.register_streams(origin, encoded.streams);
                let (ack_tx, ack_rx) = oneshot::channel();
                self.send_flushed(
                    origin,
                    RpcMessage::CallResult {
                        request_id,
                        result: encoded.value,
                    },
                    ack_tx,
                );
                if ack_rx.await.is_ok() {
                    self.start_serving(starts);
                } else {
                    warn!("result for {request_id} never reached the transport — discarding its streams");
                    for start in &starts {
                        self.remove_stream(start.id());
                    }
                }
            }
            Err(error) => {
                self.send(
                    origin,
                    RpcMessage::CallFailure {
                        request_id,
                        error: CallError::execution_error(format!(
                            "Result failed to encode: {}",
                            error.message
                        )),
                    },
                );
            }
        }
    }

    fn finish_with_object(
        &self,
        origin: &RouteId,
        request_id: RequestId,
        service_id: &InstanceId,
        method: &str,
        object: NewRemoteObject,
    ) {
        let path = mint_instance_id(service_id, method);
        match self.objects.register_remote_object(
            path.clone(),
            object.descriptor,
            object.instance,
            Some(service_id),
        ) {
            Ok(()) => {
                debug!("call {request_id}: minted remote object {path}");
                self.send(
                    origin,
                    RpcMessage::CallResult {
                        request_id,
                        result: Value::String(path.to_string()),
                    },
                );
            }
            Err(error) => {
                error!("call {request_id}: {error}");
                self.send(
                    origin,
                    RpcMessage::CallFailure {
                        request_id,
                        error: CallError::execution_error(error.to_string()),
                    },
                );
            }
        }
    }

    /// Continue a resource-typed call in its own job: acquisition may be
    /// slow, and cancelling the request must cancel it. The request's job
    /// entry is re-pointed at the acquisition task, which removes the
    /// bookkeeping itself once it has replied.
    fn hand_off_to_resource(
        &self,
        origin: &RouteId,
        request_id: RequestId,
        service_id: &InstanceId,
        method: &str,
        resource: NewResource,
        scope: &TaskScope,
    ) {
        let path = mint_instance_id(service_id, method);
        let Some(state) = self.me.upgrade() else {
            return;
        };
        let origin = origin.clone();
        let parent = service_id.clone();
        let NewResource {
            descriptor,
            acquire,
        } = resource;
        let (job_tx, job_rx) = oneshot::channel::<AbortHandle>();
        let handle = scope.spawn(async move {
            let Ok(own_job) = job_rx.await else {
                return;
            };
            match acquire.await {
                Ok(lease) => {
                    let instance = lease.instance.clone();
                    match state.objects.register_resource(
                        path.clone(),
                        descriptor,
                        instance,
                        Some(&parent),
                        own_job,
                    ) {
                        Ok(()) => {
                            debug!("call {request_id}: acquired resource {path}");
                            state.send(
                                &origin,
                                RpcMessage::CallResult {
                                    request_id,
                                    result: Value::String(path.to_string()),
                                },
                            );
                            state.finish_request(request_id);
                            // Hold the lease until this job is canceled;
                            // dropping it releases the resource.
                            let _lease = lease;
                            std::future::pending::<()>().await;
                        }
                        Err(error) => {
                            error!("call {request_id}: {error}");
                            state.send(
                                &origin,
                                RpcMessage::CallFailure {
                                    request_id,
                                    error: CallError::execution_error(error.to_string()),
                                },
                            );
                            state.finish_request(request_id);
                        }
                    }
                }
                Err(error) => {
                    debug!("call {request_id}: resource acquisition failed: {error}");
                    state.send(&origin, RpcMessage::CallFailure { request_id, error });
                    state.finish_request(request_id);
                }
            }
        });
        match self.requests.get_mut(&request_id) {
            Some(mut entry) => entry.job = handle.abort_handle(),
            None => {
                debug!("call {request_id} canceled during resource hand-off");
                handle.abort();
            }
        }
        let _ = job_tx.send(handle.abort_handle());
    }

    fn handle_cancel(&self, request_id: RequestId) {
        match self.requests.remove(&request_id) {
            Some((_, entry)) => {
                entry.job.abort();
                self.detach_request(&entry.route, request_id);
                debug!("call {request_id} canceled");
            }
            None => debug!("cancel for unknown call {request_id}"),
        }
    }

    fn finish_request(&self, request_id: RequestId) {
        if let Some((_, entry)) = self.requests.remove(&request_id) {
            self.detach_request(&entry.route, request_id);
        }
    }

    fn detach_request(&self, route: &RouteId, request_id: RequestId) {
        let now_empty = match self.requests_by_route.get_mut(route) {
            Some(mut set) => {
                set.remove(&request_id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.requests_by_route.remove_if(route, |_, set| set.is_empty());
        }
    }

    // ── Streams ───────────────────────────────────────────────────────────

    fn handle_stream_init(&self, origin: RouteId, stream_id: StreamId) {
        if self.streams.contains_key(&stream_id) {
            debug!("stream {stream_id} already live — init acknowledged implicitly");
        } else {
            debug!("stream init for unknown {stream_id} — closing");
            self.send(
                &origin,
                RpcMessage::StreamClosed {
                    stream_id,
                    error: None,
                },
            );
        }
    }

    fn handle_stream_data(&self, stream_id: StreamId, payload: Value) {
        let (element, sink, route) = {
            let Some(entry) = self.streams.get(&stream_id) else {
                debug!("data for unknown stream {stream_id} — dropped");
                return;
            };
            match entry.value() {
                StreamEntry::Inbound {
                    element,
                    sink,
                    route,
                } => (element.clone(), sink.clone(), route.clone()),
                StreamEntry::Outbound { .. } => {
                    warn!("data for outbound stream {stream_id} — dropped");
                    return;
                }
            }
        };
        match self.codec.decode(&element, &payload) {
            Ok(decoded) => {
                let starts = self.register_streams(&route, decoded.streams);
                self.start_serving(starts);
                if sink.send(decoded.value).is_err() {
                    debug!("stream {stream_id} consumer gone — element dropped");
                } else {
                    // Replenish the credit this element consumed.
                    self.send(
                        &route,
                        RpcMessage::StreamNext {
                            stream_id,
                            count: 1,
                        },
                    );
                }
            }
            Err(error) => warn!("stream {stream_id} element failed to decode: {error}"),
        }
    }

    fn handle_stream_next(&self, stream_id: StreamId, count: u32) {
        let Some(entry) = self.streams.get(&stream_id) else {
            debug!("credit for unknown stream {stream_id} — ignored");
            return;
        };
        match entry.value() {
            StreamEntry::Outbound { budget, .. } => {
                budget.grant(count);
                debug!("stream {stream_id}: +{count} credit ({} available)", budget.available());
            }
            StreamEntry::Inbound { .. } => {
                debug!("credit for inbound stream {stream_id} — ignored");
            }
        }
    }

    fn handle_stream_closed(&self, stream_id: StreamId, error: Option<CallError>) {
        let Some((_, entry)) = self.streams.remove(&stream_id) else {
            debug!("close for unknown stream {stream_id} — ignored");
            return;
        };
        if let Some(cause) = &error {
            debug!("stream {stream_id} closed by peer: {cause}");
        } else {
            debug!("stream {stream_id} closed by peer");
        }
        self.detach_stream(&entry.route().clone(), &stream_id);
        entry.close();
    }

    /// Insert table entries for streams surfaced by the codec. Serving —
    /// the initial credit grant for inbound streams, the producer task for
    /// outbound ones — is deferred to [`Self::start_serving`].
    fn register_streams(
        &self,
        route: &RouteId,
        streams: Vec<EmbeddedStream>,
    ) -> Vec<StartServing> {
        let mut starts = Vec::new();
        for stream in streams {
            let EmbeddedStream {
                id,
                element,
                endpoint,
            } = stream;
            match self.streams.entry(id.clone()) {
                Entry::Occupied(_) => {
                    warn!("stream {id} already registered — descriptor ignored");
                    continue;
                }
                Entry::Vacant(slot) => match endpoint {
                    StreamEndpoint::Inbound(sink) => {
                        slot.insert(StreamEntry::Inbound {
                            element,
                            sink,
                            route: route.clone(),
                        });
                        starts.push(StartServing::Grant {
                            id: id.clone(),
                            route: route.clone(),
                        });
                    }
                    StreamEndpoint::Outbound(source) => {
                        slot.insert(StreamEntry::Outbound {
                            budget: Arc::new(StreamBudget::new()),
                            route: route.clone(),
                            producer: Mutex::new(None),
                        });
                        starts.push(StartServing::Produce {
                            id: id.clone(),
                            route: route.clone(),
                            source,
                        });
                    }
                },
            }
            self.streams_by_route
                .entry(route.clone())
                .or_default()
                .insert(id);
        }
        starts
    }

    fn start_serving(&self, starts: Vec<StartServing>) {
        for start in starts {
            match start {
                StartServing::Grant { id, route } => {
                    debug!("stream {id}: serving inbound (window {INBOUND_STREAM_WINDOW})");
                    self.send(
                        &route,
                        RpcMessage::StreamNext {
                            stream_id: id,
                            count: INBOUND_STREAM_WINDOW,
                        },
                    );
                }
                StartServing::Produce { id, route, source } => {
                    let Some(budget) = self.streams.get(&id).and_then(|e| match e.value() {
                        StreamEntry::Outbound { budget, .. } => Some(budget.clone()),
                        StreamEntry::Inbound { .. } => None,
                    }) else {
                        debug!("stream {id} gone before serving started");
                        continue;
                    };
                    debug!("stream {id}: serving outbound");
                    let Some(state) = self.me.upgrade() else {
                        continue;
                    };
                    let task_id = id.clone();
                    let handle = self.fallback_scope.spawn(async move {
                        state.run_producer(route, task_id, budget, source).await;
                    });
                    let stored = match self.streams.get(&id) {
                        Some(entry) => match entry.value() {
                            StreamEntry::Outbound { producer, .. } => {
                                *producer.lock() = Some(handle.abort_handle());
                                true
                            }
                            StreamEntry::Inbound { .. } => false,
                        },
                        None => false,
                    };
                    if !stored {
                        // Stream was torn down between registration and
                        // start; don't leak the producer.
                        handle.abort();
                    }
                }
            }
        }
    }

    /// Drain a local source into `StreamData` messages, one credit per
    /// element. Ends when the source finishes or the budget closes.
    async fn run_producer(
        self: Arc<Self>,
        route: RouteId,
        stream_id: StreamId,
        budget: Arc<StreamBudget>,
        mut source: UnboundedReceiver<Value>,
    ) {
        loop {
            match source.recv().await {
                Some(item) => {
                    if budget.acquire().await.is_err() {
                        debug!("stream {stream_id} budget closed — producer stopping");
                        return;
                    }
                    match self.codec.encode(&item) {
                        Ok(encoded) => {
                            let starts = self.register_streams(&route, encoded.streams);
                            self.start_serving(starts);
                            self.send(
                                &route,
                                RpcMessage::StreamData {
                                    stream_id: stream_id.clone(),
                                    payload: encoded.value,
                                },
                            );
                        }
                        Err(error) => {
                            warn!("stream {stream_id} element failed to encode: {error}");
                        }
                    }
                }
                None => {
                    debug!("stream {stream_id} source finished");
                    self.send(
                        &route,
                        RpcMessage::StreamClosed {
                            stream_id: stream_id.clone(),
                            error: None,
                        },
                    );
                    self.remove_stream(&stream_id);
                    return;
                }
            }
        }
    }

    fn remove_stream(&self, stream_id: &StreamId) {
        if let Some((_, entry)) = self.streams.remove(stream_id) {
            self.detach_stream(&entry.route().clone(), stream_id);
            entry.close();
        }
    }

    fn detach_stream(&self, route: &RouteId, stream_id: &StreamId) {
        let now_empty = match self.streams_by_route.get_mut(route) {
            Some(mut set) => {
                set.remove(stream_id);
                set.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.streams_by_route.remove_if(route, |_, set| set.is_empty());
        }
    }

    // ── Route teardown ────────────────────────────────────────────────────

    /// Cancel every request and close every stream attributed to a route.
    /// The authoritative cleanup path: idempotent, presence-checked, no
    /// secondary collection exists.
    fn cleanup_route(&self, route: &RouteId) {
        if let Some((_, request_ids)) = self.requests_by_route.remove(route) {
            let count = request_ids.len();
            for request_id in request_ids {
                if let Some((_, entry)) = self.requests.remove(&request_id) {
                    entry.job.abort();
                }
            }
            info!("route {route} closed — canceled {count} requests");
        }
        if let Some((_, stream_ids)) = self.streams_by_route.remove(route) {
            let count = stream_ids.len();
            for stream_id in stream_ids {
                if let Some((_, entry)) = self.streams.remove(&stream_id) {
                    entry.close();
                }
            }
            info!("route {route} closed — closed {count} streams");
        }
    }

    // ── Outbound queue ────────────────────────────────────────────────────

    fn send(&self, destination: &RouteId, message: RpcMessage) {
        self.enqueue(destination, message, None);
    }

    fn send_flushed(
        &self,
        destination: &RouteId,
        message: RpcMessage,
        flushed: oneshot::Sender<()>,
    ) {
        self.enqueue(destination, message, Some(flushed));
    }

    fn enqueue(
        &self,
        destination: &RouteId,
        message: RpcMessage,
        flushed: Option<oneshot::Sender<()>>,
    ) {
        let item = Outbound::Message {
            destination: destination.clone(),
            message,
            flushed,
        };
        if self.outbound.send(item).is_err() {
            // The queue is unbounded with a single consumer; it only closes
            // when the executor is gone, which no caller can recover from.
            error!("outbound queue closed — dropping message for {destination}");
        }
    }
}

fn mint_instance_id(service: &InstanceId, method: &str) -> InstanceId {
    service.child(&format!("{method}-{}", uuid::Uuid::new_v4()))
}
