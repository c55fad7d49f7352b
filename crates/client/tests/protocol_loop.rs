//! Integration test: boots a real [`tb_server::Server`] on an ephemeral
//! TCP port, connects a real [`ClientSession`], and exercises the full
//! protocol loop end to end:
//!
//! - handshake, discovery, and a plain echo round-trip
//! - unknown tool → typed `unknown_tool` failure
//! - server-side timeout fires within the budget, not the handler's will
//! - client-side timeout resolves locally and sends a cancel notice
//! - two concurrent faults stay independent, dispatcher stays usable
//! - sandbox admits at most N handlers; the N+1th queues
//! - server shutdown mid-call resolves pending calls to ConnectionClosed

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use tb_client::{ClientBuilder, ClientError, ClientSession};
use tb_protocol::ErrorKind;
use tb_server::{Server, ServerConfig, ToolContext, ToolDescriptor, ToolHandler, ToolRegistry};

// ── Test tools ──────────────────────────────────────────────────────────

struct EchoTool;

#[async_trait::async_trait]
impl ToolHandler for EchoTool {
    async fn call(&self, _ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
        Ok(args)
    }
}

/// Sleeps without ever checking its cancellation token — exercises the
/// sandbox's grace-then-abandon path.
struct StubbornSleeper(Duration);

#[async_trait::async_trait]
impl ToolHandler for StubbornSleeper {
    async fn call(&self, _ctx: ToolContext, _args: Value) -> anyhow::Result<Value> {
        tokio::time::sleep(self.0).await;
        Ok(Value::Null)
    }
}

struct BrokenTool;

#[async_trait::async_trait]
impl ToolHandler for BrokenTool {
    async fn call(&self, _ctx: ToolContext, _args: Value) -> anyhow::Result<Value> {
        anyhow::bail!("permission denied: /etc/shadow")
    }
}

/// Marks itself started, then blocks until the test hands out a permit.
struct GateTool {
    state: Arc<GateState>,
}

struct GateState {
    started: AtomicUsize,
    release: Semaphore,
}

impl Default for GateState {
    fn default() -> Self {
        Self {
            started: AtomicUsize::new(0),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ToolHandler for GateTool {
    async fn call(&self, ctx: ToolContext, _args: Value) -> anyhow::Result<Value> {
        let seq = self.state.started.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::select! {
            permit = self.state.release.acquire() => {
                permit.expect("gate semaphore closed").forget();
                Ok(serde_json::json!({ "seq": seq }))
            }
            _ = ctx.cancel.cancelled() => anyhow::bail!("interrupted"),
        }
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

fn any_schema() -> Value {
    serde_json::json!(true)
}

fn tool(name: &str, handler: impl ToolHandler) -> ToolDescriptor {
    ToolDescriptor::new(name, format!("{name} test tool"), any_schema(), any_schema(), handler)
        .unwrap()
}

fn base_registry(gate: Arc<GateState>) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    reg.register(tool("echo", EchoTool)).unwrap();
    reg.register(tool("slow", StubbornSleeper(Duration::from_secs(10))))
        .unwrap();
    reg.register(tool("broken", BrokenTool)).unwrap();
    reg.register(tool("gate", GateTool { state: gate })).unwrap();
    reg
}

async fn start_server(
    registry: ToolRegistry,
    config: ServerConfig,
) -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = Server::new(registry, config);
    let token = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.serve_tcp(listener, token).await;
    });
    (addr, shutdown)
}

async fn connect(addr: SocketAddr) -> ClientSession {
    ClientBuilder::new()
        .client_name("protocol-loop-test")
        .default_timeout(Duration::from_secs(5))
        .connect_tcp(addr.to_string())
        .await
        .expect("failed to connect")
}

fn tool_error(err: ClientError) -> tb_protocol::WireError {
    match err {
        ClientError::Tool(e) => e,
        other => panic!("expected tool error, got {other:?}"),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn discovery_and_echo_roundtrip() {
    let gate = Arc::new(GateState::default());
    let (addr, shutdown) = start_server(base_registry(gate), ServerConfig::default()).await;
    let session = connect(addr).await;

    let tools = session.list_tools().await.unwrap();
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["echo", "slow", "broken", "gate"]);

    let result = session
        .call("echo", serde_json::json!({ "x": 1 }))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({ "x": 1 }));

    session.shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn unknown_tool_fails_with_typed_error() {
    let gate = Arc::new(GateState::default());
    let (addr, shutdown) = start_server(base_registry(gate), ServerConfig::default()).await;
    let session = connect(addr).await;

    let err = session
        .call("ghost", serde_json::json!({}))
        .await
        .unwrap_err();
    let err = tool_error(err);
    assert_eq!(err.kind, ErrorKind::UnknownTool);
    assert!(err.message.contains("ghost"));

    session.shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn server_side_timeout_fires_within_budget() {
    let gate = Arc::new(GateState::default());
    let config = ServerConfig {
        call_timeout_ms: 1_000,
        cancel_grace_ms: 200,
        ..Default::default()
    };
    let (addr, shutdown) = start_server(base_registry(gate), config).await;
    let session = connect(addr).await;

    let started = Instant::now();
    let err = session
        .call_with_timeout("slow", serde_json::json!({}), Duration::from_secs(8))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    let err = tool_error(err);
    assert_eq!(err.kind, ErrorKind::Timeout);
    assert!(
        elapsed < Duration::from_secs(4),
        "timeout took {elapsed:?}, expected ~1s"
    );

    session.shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn client_side_timeout_resolves_locally() {
    let gate = Arc::new(GateState::default());
    let (addr, shutdown) = start_server(base_registry(gate), ServerConfig::default()).await;
    let session = connect(addr).await;

    let err = session
        .call_with_timeout("slow", serde_json::json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));

    // The session stays healthy after the abandoned call.
    let result = session
        .call("echo", serde_json::json!({ "after": "timeout" }))
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!({ "after": "timeout" }));

    session.shutdown().await;
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_faults_stay_independent() {
    let gate = Arc::new(GateState::default());
    let (addr, shutdown) = start_server(base_registry(gate), ServerConfig::default()).await;
    let session = Arc::new(connect(addr).await);

    let a = {
        let session = session.clone();
        tokio::spawn(async move { session.call("broken", serde_json::json!({})).await })
    };
    let b = {
        let session = session.clone();
        tokio::spawn(async move { session.call("broken", serde_json::json!({})).await })
    };

    for handle in [a, b] {
        let err = tool_error(handle.await.unwrap().unwrap_err());
        assert_eq!(err.kind, ErrorKind::Handler);
        assert!(err.message.contains("permission denied"));
    }

    // Dispatcher remains usable afterwards.
    let result = session.call("echo", serde_json::json!(42)).await.unwrap();
    assert_eq!(result, serde_json::json!(42));

    Arc::try_unwrap(session).ok().unwrap().shutdown().await;
    shutdown.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sandbox_admission_is_bounded() {
    let gate = Arc::new(GateState::default());
    let config = ServerConfig {
        max_concurrent_handlers: 2,
        ..Default::default()
    };
    let (addr, shutdown) = start_server(base_registry(gate.clone()), config).await;
    let session = Arc::new(connect(addr).await);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let session = session.clone();
        handles.push(tokio::spawn(async move {
            session.call("gate", serde_json::json!({})).await
        }));
    }

    // Two handlers start; the third queues behind the semaphore.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(gate.started.load(Ordering::SeqCst), 2);

    // Releasing one lets the queued call start.
    gate.release.add_permits(1);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(gate.started.load(Ordering::SeqCst), 3);

    gate.release.add_permits(2);
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    Arc::try_unwrap(session).ok().unwrap().shutdown().await;
    shutdown.cancel();
}

#[tokio::test]
async fn server_shutdown_resolves_pending_calls() {
    let gate = Arc::new(GateState::default());
    let (addr, shutdown) = start_server(base_registry(gate), ServerConfig::default()).await;
    let session = Arc::new(connect(addr).await);

    let pending = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .call_with_timeout("slow", serde_json::json!({}), Duration::from_secs(30))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, ClientError::ConnectionClosed), "got {err:?}");

    // New calls on the dead session fail fast.
    let err = session.call("echo", serde_json::json!({})).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::ConnectionClosed | ClientError::Timeout(_)
    ));
}
