//! End-to-end tests — router relay plus executor over in-memory channel
//! pairs (the transport stand-in), with a hand-rolled client route.

use std::sync::Arc;
use std::time::Duration;

use orp_protocol::{
    CallError, CallErrorCode, EndpointKind, Envelope, InstanceId, RequestId, RouteId, RpcMessage,
};
use orp_router::{ConnectionEvent, ConnectionFeed, RequestRouter};
use orp_rpc::{
    CallOutcome, DISPOSE_METHOD, JsonCodec, MethodSpec, NewRemoteObject, ParamSpec, RemoteService,
    RpcExecutor, ServiceDescriptor, StaticLocator,
};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

// ─────────────────────────────────────────────────────────────────────────
// Backend services
// ─────────────────────────────────────────────────────────────────────────

struct EchoSvc {
    descriptor: Arc<ServiceDescriptor>,
}

impl EchoSvc {
    fn new() -> Self {
        Self {
            descriptor: Arc::new(ServiceDescriptor::new(
                "echo",
                vec![MethodSpec::new("ping", vec![ParamSpec::new("message")])],
            )),
        }
    }
}

impl RemoteService for EchoSvc {
    fn descriptor(&self) -> Arc<ServiceDescriptor> {
        self.descriptor.clone()
    }

    async fn dispatch(
        &self,
        _method: &str,
        args: Map<String, Value>,
    ) -> Result<CallOutcome, CallError> {
        Ok(CallOutcome::Value(
            json!({ "echo": args.get("message").cloned().unwrap_or(Value::Null) }),
        ))
    }
}

struct Widget {
    descriptor: Arc<ServiceDescriptor>,
}

impl Widget {
    fn new() -> Self {
        Self {
            descriptor: Arc::new(ServiceDescriptor::new(
                "widget",
                vec![
                    MethodSpec::new("touch", vec![]),
                    MethodSpec::new("spawn", vec![]),
                    MethodSpec::new(DISPOSE_METHOD, vec![]),
                ],
            )),
        }
    }
}

impl RemoteService for Widget {
    fn descriptor(&self) -> Arc<ServiceDescriptor> {
        self.descriptor.clone()
    }

    async fn dispatch(
        &self,
        method: &str,
        _args: Map<String, Value>,
    ) -> Result<CallOutcome, CallError> {
        match method {
            "touch" => Ok(CallOutcome::Value(json!("touched"))),
            "spawn" => {
                let child = Widget::new();
                Ok(CallOutcome::RemoteObject(NewRemoteObject {
                    descriptor: child.descriptor(),
                    instance: Arc::new(child),
                }))
            }
            DISPOSE_METHOD => Ok(CallOutcome::Value(Value::Null)),
            other => Err(CallError::request_error(format!("Unknown method '{other}'"))),
        }
    }
}

struct FactorySvc {
    descriptor: Arc<ServiceDescriptor>,
}

impl FactorySvc {
    fn new() -> Self {
        Self {
            descriptor: Arc::new(ServiceDescriptor::new(
                "factory",
                vec![MethodSpec::new("create", vec![])],
            )),
        }
    }
}

impl RemoteService for FactorySvc {
    fn descriptor(&self) -> Arc<ServiceDescriptor> {
        self.descriptor.clone()
    }

    async fn dispatch(
        &self,
        _method: &str,
        _args: Map<String, Value>,
    ) -> Result<CallOutcome, CallError> {
        let widget = Widget::new();
        Ok(CallOutcome::RemoteObject(NewRemoteObject {
            descriptor: widget.descriptor(),
            instance: Arc::new(widget),
        }))
    }
}

struct SlowSvc {
    descriptor: Arc<ServiceDescriptor>,
}

impl SlowSvc {
    fn new() -> Self {
        Self {
            descriptor: Arc::new(ServiceDescriptor::new(
                "slow",
                vec![MethodSpec::new("wait", vec![])],
            )),
        }
    }
}

impl RemoteService for SlowSvc {
    fn descriptor(&self) -> Arc<ServiceDescriptor> {
        self.descriptor.clone()
    }

    async fn dispatch(
        &self,
        _method: &str,
        _args: Map<String, Value>,
    ) -> Result<CallOutcome, CallError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(CallOutcome::Value(Value::Null))
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────────────────────

struct Hub {
    router: Arc<RequestRouter>,
    feed: ConnectionFeed,
    backend: RouteId,
}

/// Start a router with one backend route serving echo/factory/slow.
async fn start_hub() -> Hub {
    let locator = Arc::new(StaticLocator::new());
    locator.register(InstanceId::new("svc/echo"), EchoSvc::new());
    locator.register(InstanceId::new("svc/factory"), FactorySvc::new());
    locator.register(InstanceId::new("svc/slow"), SlowSvc::new());

    let router = Arc::new(RequestRouter::new());
    let mut feed = router.registry().subscribe();
    let backend = RouteId::new("backend");

    let (to_backend_tx, to_backend_rx) = mpsc::unbounded_channel();
    let (from_backend_tx, from_backend_rx) = mpsc::unbounded_channel();
    let executor = Arc::new(RpcExecutor::new(
        backend.clone(),
        locator,
        Arc::new(JsonCodec),
    ));
    tokio::spawn(async move {
        let _ = executor.serve(to_backend_rx, from_backend_tx).await;
    });
    {
        let router = router.clone();
        let backend = backend.clone();
        tokio::spawn(async move {
            let _ = router
                .handle_connection(
                    backend,
                    EndpointKind::Backend,
                    "backend",
                    to_backend_tx,
                    from_backend_rx,
                )
                .await;
        });
    }
    wait_connected(&mut feed, &backend).await;

    Hub {
        router,
        feed,
        backend,
    }
}

async fn next_event(feed: &mut ConnectionFeed) -> ConnectionEvent {
    timeout(Duration::from_secs(5), feed.recv())
        .await
        .expect("timeout waiting for registry event")
        .expect("registry feed ended")
}

async fn wait_connected(feed: &mut ConnectionFeed, route: &RouteId) {
    loop {
        if let ConnectionEvent::Connected { info, .. } = next_event(feed).await {
            if info.route == *route {
                return;
            }
        }
    }
}

struct Client {
    route: RouteId,
    backend: RouteId,
    to_router: UnboundedSender<Envelope>,
    from_router: UnboundedReceiver<Envelope>,
    next_request: u64,
}

impl Hub {
    async fn connect_client(&mut self, route: &str) -> Client {
        let route = RouteId::new(route);
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        {
            let router = self.router.clone();
            let route = route.clone();
            tokio::spawn(async move {
                let _ = router
                    .handle_connection(route, EndpointKind::Client, "client", sink_tx, inbound_rx)
                    .await;
            });
        }
        wait_connected(&mut self.feed, &route).await;
        Client {
            route,
            backend: self.backend.clone(),
            to_router: inbound_tx,
            from_router: sink_rx,
            next_request: 0,
        }
    }
}

impl Client {
    fn send_request(&mut self, service: &InstanceId, method: &str, args: Map<String, Value>) -> RequestId {
        self.next_request += 1;
        let request_id = RequestId(self.next_request);
        let _ = self.to_router.send(Envelope::message(
            self.route.clone(),
            self.backend.clone(),
            RpcMessage::CallRequest {
                request_id,
                service_id: service.clone(),
                method: method.to_string(),
                args,
            },
        ));
        request_id
    }

    async fn call(
        &mut self,
        service: &InstanceId,
        method: &str,
        args: Map<String, Value>,
    ) -> Result<Value, CallError> {
        let request_id = self.send_request(service, method, args);
        loop {
            let envelope = timeout(Duration::from_secs(5), self.from_router.recv())
                .await
                .expect("timeout waiting for response")
                .ok_or_else(|| CallError::execution_error("connection closed"))?;
            match envelope {
                Envelope::Message {
                    payload: RpcMessage::CallResult { request_id: id, result },
                    ..
                } if id == request_id => return Ok(result),
                Envelope::Message {
                    payload: RpcMessage::CallFailure { request_id: id, error },
                    ..
                } if id == request_id => return Err(error),
                _ => continue,
            }
        }
    }
}

fn args(key: &str, value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.into(), value);
    map
}

// ─────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn call_roundtrip_through_the_router() {
    let mut hub = start_hub().await;
    let mut client = hub.connect_client("R1").await;

    let result = client
        .call(&InstanceId::new("svc/echo"), "ping", args("message", json!("hello")))
        .await
        .unwrap();
    assert_eq!(result, json!({ "echo": "hello" }));
}

#[tokio::test]
async fn unresolved_service_yields_failure() {
    let mut hub = start_hub().await;
    let mut client = hub.connect_client("R1").await;

    // CallRequest{id=42, service="svcA", method="ping"} with svcA unknown.
    client.next_request = 41;
    let error = client
        .call(&InstanceId::new("svcA"), "ping", Map::new())
        .await
        .unwrap_err();
    assert_eq!(error.error_code(), CallErrorCode::UnresolvedService);
}

#[tokio::test]
async fn remote_object_disposal_cascades() {
    let mut hub = start_hub().await;
    let mut client = hub.connect_client("R1").await;

    let factory = InstanceId::new("svc/factory");
    let parent = client.call(&factory, "create", Map::new()).await.unwrap();
    let parent = InstanceId::new(parent.as_str().unwrap());
    let child = client.call(&parent, "spawn", Map::new()).await.unwrap();
    let child = InstanceId::new(child.as_str().unwrap());

    client.call(&parent, DISPOSE_METHOD, Map::new()).await.unwrap();

    let error = client.call(&child, "touch", Map::new()).await.unwrap_err();
    assert_eq!(error.error_code(), CallErrorCode::UnresolvedService);
}

#[tokio::test]
async fn ban_tears_down_and_unban_allows_reconnect() {
    let mut hub = start_hub().await;
    let mut client = hub.connect_client("R1").await;
    client
        .call(&InstanceId::new("svc/echo"), "ping", args("message", json!(1)))
        .await
        .unwrap();

    hub.router.ban(client.route.clone());
    loop {
        if let ConnectionEvent::Disconnected { info, .. } = next_event(&mut hub.feed).await {
            if info.route == client.route {
                break;
            }
        }
    }

    // While banned, a reconnect attempt stays parked at the ban gate.
    hub.router.unban(&client.route);
    let mut reconnected = hub.connect_client("R1").await;
    let result = reconnected
        .call(&InstanceId::new("svc/echo"), "ping", args("message", json!(2)))
        .await
        .unwrap();
    assert_eq!(result, json!({ "echo": 2 }));
}

#[tokio::test]
async fn reconnect_emits_fresh_connected_event() {
    let mut hub = start_hub().await;
    let client = hub.connect_client("R1").await;

    // Closing the client's inbound channel ends its connection.
    drop(client.to_router);
    let first_key = loop {
        if let ConnectionEvent::Disconnected { key, info } = next_event(&mut hub.feed).await {
            assert_eq!(info.route, client.route);
            break key;
        }
    };

    let reconnected = hub.connect_client("R1").await;
    assert_eq!(reconnected.route, client.route);

    // The reconnect carried a fresh socket id, so its endpoint key differs.
    let snapshot = hub.router.registry().snapshot();
    assert!(!snapshot.contains_key(&first_key));
    assert_eq!(
        snapshot
            .values()
            .filter(|info| info.route == client.route)
            .count(),
        1
    );
}

#[tokio::test]
async fn peer_disconnect_cancels_outstanding_calls() {
    let mut hub = start_hub().await;
    let mut client = hub.connect_client("R1").await;

    // Start a call that would never finish, then vanish.
    client.send_request(&InstanceId::new("svc/slow"), "wait", Map::new());
    drop(client.to_router);
    loop {
        if let ConnectionEvent::Disconnected { info, .. } = next_event(&mut hub.feed).await {
            if info.route == client.route {
                break;
            }
        }
    }

    // The backend saw RouteClosed(R1) and cleaned up; a fresh connection on
    // the same route serves normally.
    let mut reconnected = hub.connect_client("R1").await;
    let result = reconnected
        .call(&InstanceId::new("svc/echo"), "ping", args("message", json!("ok")))
        .await
        .unwrap();
    assert_eq!(result, json!({ "echo": "ok" }));
}
