//! ORP Hub — routed bidirectional RPC demo.
//!
//! Wires a request router and two in-process endpoints over envelope
//! channel pairs (the transport stand-in): a backend route serving an echo
//! service and a counter factory, and a client route driving a scripted
//! exchange — plain call, remote-object minting, disposal, and a ban.
//!
//! Usage:
//!   orp-hub              # Run the scripted exchange
//!   orp-hub --verbose    # Debug-level protocol logging

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Context;
use clap::Parser;
use orp_protocol::{CallError, EndpointKind, Envelope, InstanceId, RequestId, RouteId, RpcMessage};
use orp_router::{ConnectionEvent, RequestRouter};
use orp_rpc::{
    CallLogger, CallOutcome, DISPOSE_METHOD, JsonCodec, MethodSpec, NewRemoteObject, ParamSpec,
    RemoteService, RpcExecutor, ServiceDescriptor, StaticLocator,
};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "orp-hub", about = "ORP Hub — routed bidirectional RPC demo")]
struct Cli {
    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Demo services
// ─────────────────────────────────────────────────────────────────────────────

struct EchoService {
    descriptor: Arc<ServiceDescriptor>,
}

impl EchoService {
    fn new() -> Self {
        Self {
            descriptor: Arc::new(ServiceDescriptor::new(
                "echo",
                vec![MethodSpec::new("ping", vec![ParamSpec::new("message")])],
            )),
        }
    }
}

impl RemoteService for EchoService {
    fn descriptor(&self) -> Arc<ServiceDescriptor> {
        self.descriptor.clone()
    }

    async fn dispatch(
        &self,
        method: &str,
        args: Map<String, Value>,
    ) -> Result<CallOutcome, CallError> {
        match method {
            "ping" => {
                let message = args.get("message").cloned().unwrap_or(Value::Null);
                Ok(CallOutcome::Value(json!({ "pong": message })))
            }
            other => Err(CallError::request_error(format!("Unknown method '{other}'"))),
        }
    }
}

struct Counter {
    descriptor: Arc<ServiceDescriptor>,
    count: AtomicI64,
}

impl Counter {
    fn new() -> Self {
        Self {
            descriptor: Arc::new(ServiceDescriptor::new(
                "counter",
                vec![
                    MethodSpec::new("increment", vec![]),
                    MethodSpec::new("value", vec![]),
                    MethodSpec::new(DISPOSE_METHOD, vec![]),
                ],
            )),
            count: AtomicI64::new(0),
        }
    }
}

impl RemoteService for Counter {
    fn descriptor(&self) -> Arc<ServiceDescriptor> {
        self.descriptor.clone()
    }

    async fn dispatch(
        &self,
        method: &str,
        _args: Map<String, Value>,
    ) -> Result<CallOutcome, CallError> {
        match method {
            "increment" => Ok(CallOutcome::Value(json!(
                self.count.fetch_add(1, Ordering::SeqCst) + 1
            ))),
            "value" => Ok(CallOutcome::Value(json!(self.count.load(Ordering::SeqCst)))),
            DISPOSE_METHOD => Ok(CallOutcome::Value(Value::Null)),
            other => Err(CallError::request_error(format!("Unknown method '{other}'"))),
        }
    }
}

struct CounterFactory {
    descriptor: Arc<ServiceDescriptor>,
}

impl CounterFactory {
    fn new() -> Self {
        Self {
            descriptor: Arc::new(ServiceDescriptor::new(
                "counters",
                vec![MethodSpec::new("create", vec![])],
            )),
        }
    }
}

impl RemoteService for CounterFactory {
    fn descriptor(&self) -> Arc<ServiceDescriptor> {
        self.descriptor.clone()
    }

    async fn dispatch(
        &self,
        method: &str,
        _args: Map<String, Value>,
    ) -> Result<CallOutcome, CallError> {
        match method {
            "create" => {
                let counter = Counter::new();
                Ok(CallOutcome::RemoteObject(NewRemoteObject {
                    descriptor: counter.descriptor(),
                    instance: Arc::new(counter),
                }))
            }
            other => Err(CallError::request_error(format!("Unknown method '{other}'"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Demo client
// ─────────────────────────────────────────────────────────────────────────────

/// Minimal caller: sends a request envelope and waits for its terminal
/// response, logging unrelated traffic it sees along the way.
struct DemoClient {
    route: RouteId,
    backend: RouteId,
    to_router: UnboundedSender<Envelope>,
    from_router: UnboundedReceiver<Envelope>,
    next_request: u64,
}

impl DemoClient {
    async fn call(
        &mut self,
        service: &InstanceId,
        method: &str,
        args: Map<String, Value>,
    ) -> Result<Value, CallError> {
        self.next_request += 1;
        let request_id = RequestId(self.next_request);
        let payload = RpcMessage::CallRequest {
            request_id,
            service_id: service.clone(),
            method: method.to_string(),
            args,
        };
        self.to_router
            .send(Envelope::message(
                self.route.clone(),
                self.backend.clone(),
                payload,
            ))
            .map_err(|_| CallError::execution_error("router connection gone"))?;

        loop {
            let Some(envelope) = self.from_router.recv().await else {
                return Err(CallError::execution_error("connection closed"));
            };
            match envelope {
                Envelope::Message {
                    payload: RpcMessage::CallResult { request_id: id, result },
                    ..
                } if id == request_id => return Ok(result),
                Envelope::Message {
                    payload: RpcMessage::CallFailure { request_id: id, error },
                    ..
                } if id == request_id => return Err(error),
                Envelope::RouteOpened { route } => debug!("client: peer route opened: {route}"),
                Envelope::RouteClosed { route } => debug!("client: peer route closed: {route}"),
                other => debug!("client: ignoring {}", other.kind()),
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let backend_route = RouteId::new("backend");
    let client_route = RouteId::new("client");

    // Backend services behind the locator.
    let locator = Arc::new(StaticLocator::new());
    locator.register(InstanceId::new("svc/echo"), EchoService::new());
    locator.register(InstanceId::new("svc/counters"), CounterFactory::new());

    let router = Arc::new(RequestRouter::new());
    let mut feed = router.registry().subscribe();

    // Backend endpoint: executor on one end of the channel pair, router on
    // the other.
    let (to_backend_tx, to_backend_rx) = mpsc::unbounded_channel();
    let (from_backend_tx, from_backend_rx) = mpsc::unbounded_channel();
    let executor = Arc::new(
        RpcExecutor::new(backend_route.clone(), locator, Arc::new(JsonCodec))
            .with_middleware(CallLogger),
    );
    {
        let executor = executor.clone();
        tokio::spawn(async move {
            let _ = executor.serve(to_backend_rx, from_backend_tx).await;
        });
    }
    {
        let router = router.clone();
        let route = backend_route.clone();
        tokio::spawn(async move {
            let _ = router
                .handle_connection(
                    route,
                    EndpointKind::Backend,
                    "Demo backend",
                    to_backend_tx,
                    from_backend_rx,
                )
                .await;
        });
    }

    // Client endpoint: a plain caller on the channel pair.
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (from_client_tx, from_client_rx) = mpsc::unbounded_channel();
    {
        let router = router.clone();
        let route = client_route.clone();
        tokio::spawn(async move {
            let _ = router
                .handle_connection(
                    route,
                    EndpointKind::Client,
                    "Demo client",
                    to_client_tx,
                    from_client_rx,
                )
                .await;
        });
    }

    // Both routes must be up before the script starts.
    let mut connected = 0;
    while connected < 2 {
        match feed.recv().await {
            Some(ConnectionEvent::Connected { info, .. }) => {
                info!("endpoint connected: {} on route {}", info.name, info.route);
                connected += 1;
            }
            Some(other) => debug!("feed: {other:?}"),
            None => anyhow::bail!("registry feed ended early"),
        }
    }

    let mut client = DemoClient {
        route: client_route.clone(),
        backend: backend_route,
        to_router: from_client_tx,
        from_router: to_client_rx,
        next_request: 0,
    };

    // 1. Plain call.
    let mut args = Map::new();
    args.insert("message".into(), json!("hello"));
    let pong = client
        .call(&InstanceId::new("svc/echo"), "ping", args)
        .await
        .context("echo ping failed")?;
    info!("echo replied: {pong}");

    // 2. Mint a remote object and drive it by instance id.
    let minted = client
        .call(&InstanceId::new("svc/counters"), "create", Map::new())
        .await
        .context("counter creation failed")?;
    let counter_id = InstanceId::new(minted.as_str().context("expected an instance id")?);
    info!("counter minted: {counter_id}");

    for _ in 0..3 {
        client.call(&counter_id, "increment", Map::new()).await?;
    }
    let value = client.call(&counter_id, "value", Map::new()).await?;
    info!("counter value after three increments: {value}");

    // 3. Dispose the object; the path must stop resolving.
    client.call(&counter_id, DISPOSE_METHOD, Map::new()).await?;
    match client.call(&counter_id, "value", Map::new()).await {
        Err(error) => info!("counter disposed as expected: {error}"),
        Ok(value) => anyhow::bail!("disposed counter still answered: {value}"),
    }

    // 4. Ban the client route and watch its connection fall out of the feed.
    router.ban(client.route.clone());
    info!("banned routes: {:?}", router.banned());
    loop {
        match feed.recv().await {
            Some(ConnectionEvent::Disconnected { info, .. }) if info.route == client.route => {
                info!("client connection torn down by ban");
                break;
            }
            Some(other) => debug!("feed: {other:?}"),
            None => break,
        }
    }
    router.unban(&client.route);

    info!("demo complete");
    Ok(())
}
