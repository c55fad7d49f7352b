//! Client session — correlated calls over the async transport.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tb_protocol::{
    read_frame, write_frame, ErrorKind, ToolSummary, WireError, WireMessage, PROTOCOL_VERSION,
};

use crate::builder::ClientBuilder;
use crate::transport::{BoxedReader, BoxedWriter};

/// Errors surfaced to callers of [`ClientSession`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),

    #[error("handshake: {0}")]
    Handshake(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with a typed failure.
    #[error(transparent)]
    Tool(#[from] WireError),
}

struct CallReply {
    ok: bool,
    result: Option<Value>,
    error: Option<WireError>,
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<CallReply>>>>;
type DiscoveryQueue = Arc<Mutex<VecDeque<oneshot::Sender<Vec<ToolSummary>>>>>;

/// An established session. Cheap to share behind an `Arc`; all methods
/// take `&self` so calls from many tasks can be in flight at once.
pub struct ClientSession {
    outbound: mpsc::Sender<WireMessage>,
    pending: PendingMap,
    discovery: DiscoveryQueue,
    /// Cancelled once the connection is gone, either way.
    closed: CancellationToken,
    cached_tools: Mutex<Option<Vec<ToolSummary>>>,
    default_timeout: Duration,
    session_id: String,
    server_version: String,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    child: Option<tokio::process::Child>,
}

impl ClientSession {
    /// Handshake over the given halves and start the background tasks.
    pub(crate) async fn start(
        reader: BoxedReader,
        writer: BoxedWriter,
        child: Option<tokio::process::Child>,
        opts: &ClientBuilder,
    ) -> Result<Self, ClientError> {
        let mut reader = BufReader::new(reader);
        let mut writer = writer;
        let max_bytes = opts.max_frame_bytes;

        // ── Handshake ────────────────────────────────────────────────
        let hello = WireMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: opts.client_name.clone(),
            client_version: opts.client_version.clone(),
        };
        write_frame(&mut writer, &hello, max_bytes)
            .await
            .map_err(|e| ClientError::Handshake(e.to_string()))?;

        let welcome = tokio::time::timeout(
            opts.handshake_timeout,
            read_frame(&mut reader, max_bytes),
        )
        .await
        .map_err(|_| ClientError::Handshake("timeout waiting for welcome".into()))?
        .map_err(|e| ClientError::Handshake(e.to_string()))?;

        let (session_id, server_version) = match welcome {
            WireMessage::Welcome {
                protocol_version,
                server_version,
                session_id,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    return Err(ClientError::Handshake(format!(
                        "protocol version mismatch: server speaks {protocol_version}, client speaks {PROTOCOL_VERSION}"
                    )));
                }
                (session_id, server_version)
            }
            other => {
                return Err(ClientError::Handshake(format!(
                    "expected welcome, got {other:?}"
                )))
            }
        };

        tracing::info!(
            session_id = %session_id,
            server_version = %server_version,
            "session established"
        );

        // ── Background tasks ─────────────────────────────────────────
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WireMessage>(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let discovery: DiscoveryQueue = Arc::new(Mutex::new(VecDeque::new()));
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if write_frame(&mut writer, &msg, max_bytes).await.is_err() {
                    writer_closed.cancel();
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_discovery = discovery.clone();
        let reader_closed = closed.clone();
        let reader_outbound = outbound_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match read_frame(&mut reader, max_bytes).await {
                    Ok(WireMessage::Response {
                        id,
                        ok,
                        result,
                        error,
                    }) => {
                        match reader_pending.lock().remove(&id) {
                            Some(tx) => {
                                let _ = tx.send(CallReply { ok, result, error });
                            }
                            None => {
                                // Late response after a local timeout, or
                                // a server bug. Either way: drop it.
                                tracing::debug!(request_id = %id, "response for unknown call");
                            }
                        }
                    }
                    Ok(WireMessage::DiscoveryResponse { tools }) => {
                        match reader_discovery.lock().pop_front() {
                            Some(tx) => {
                                let _ = tx.send(tools);
                            }
                            None => {
                                tracing::debug!("unsolicited discovery response");
                            }
                        }
                    }
                    Ok(WireMessage::Ping { timestamp }) => {
                        let _ = reader_outbound.send(WireMessage::Pong { timestamp }).await;
                    }
                    Ok(WireMessage::Pong { .. }) => {
                        tracing::trace!("received pong");
                    }
                    Ok(other) => {
                        tracing::debug!(
                            msg_type = ?std::mem::discriminant(&other),
                            "unexpected message from server, ignoring"
                        );
                    }
                    Err(e) => {
                        tracing::info!(error = %e, "connection closed");
                        break;
                    }
                }
            }

            // Resolve every pending call to ConnectionClosed by dropping
            // its sender, and wake discovery waiters the same way.
            reader_closed.cancel();
            reader_pending.lock().clear();
            reader_discovery.lock().clear();
        });

        let heartbeat_task = opts.heartbeat_interval.map(|period| {
            let tx = outbound_tx.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await; // immediate first tick
                loop {
                    interval.tick().await;
                    let msg = WireMessage::Ping {
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
            })
        });

        Ok(Self {
            outbound: outbound_tx,
            pending,
            discovery,
            closed,
            cached_tools: Mutex::new(None),
            default_timeout: opts.default_timeout,
            session_id,
            server_version,
            reader_task,
            writer_task,
            heartbeat_task,
            child,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Whether the connection is known to be gone.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Invoke a tool with the session's default timeout.
    pub async fn call(&self, tool: &str, args: Value) -> Result<Value, ClientError> {
        self.call_with_timeout(tool, args, self.default_timeout)
            .await
    }

    /// Invoke a tool. On local timeout, a best-effort `cancel_notice` is
    /// sent upstream and the call resolves to [`ClientError::Timeout`] —
    /// callers never observe a hang past the budget.
    pub async fn call_with_timeout(
        &self,
        tool: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        if self.closed.is_cancelled() {
            return Err(ClientError::ConnectionClosed);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let request = WireMessage::Request {
            id: id.clone(),
            tool: tool.to_string(),
            args,
        };
        if self.outbound.send(request).await.is_err() {
            self.pending.lock().remove(&id);
            return Err(ClientError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => {
                if reply.ok {
                    Ok(reply.result.unwrap_or(Value::Null))
                } else {
                    Err(ClientError::Tool(reply.error.unwrap_or_else(|| {
                        WireError::new(ErrorKind::Handler, "failure without error payload")
                    })))
                }
            }
            // Sender dropped — the connection went away mid-call.
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().remove(&id);
                let _ = self
                    .outbound
                    .try_send(WireMessage::CancelNotice { id: id.clone() });
                tracing::debug!(request_id = %id, tool = %tool, "local timeout, cancel notice sent");
                Err(ClientError::Timeout(timeout))
            }
        }
    }

    /// Discovery snapshot, fetched once per session and cached.
    pub async fn list_tools(&self) -> Result<Vec<ToolSummary>, ClientError> {
        if let Some(tools) = self.cached_tools.lock().clone() {
            return Ok(tools);
        }
        self.refresh_tools().await
    }

    /// Force a fresh discovery fetch and update the cache.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolSummary>, ClientError> {
        if self.closed.is_cancelled() {
            return Err(ClientError::ConnectionClosed);
        }

        let (tx, rx) = oneshot::channel();
        self.discovery.lock().push_back(tx);
        if self.outbound.send(WireMessage::DiscoveryRequest).await.is_err() {
            return Err(ClientError::ConnectionClosed);
        }

        match tokio::time::timeout(self.default_timeout, rx).await {
            Ok(Ok(tools)) => {
                *self.cached_tools.lock() = Some(tools.clone());
                Ok(tools)
            }
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout(self.default_timeout)),
        }
    }

    /// Close the session: stop the background tasks, close the transport,
    /// and reap the child process if this session spawned one.
    pub async fn shutdown(self) {
        let ClientSession {
            outbound,
            pending,
            discovery,
            closed,
            reader_task,
            writer_task,
            heartbeat_task,
            child,
            ..
        } = self;

        closed.cancel();
        if let Some(task) = heartbeat_task {
            task.abort();
        }
        // The reader holds an outbound clone (for pongs) — abort it first
        // so dropping ours closes the channel. The writer then drains and
        // drops the transport half, which the server sees as a clean EOF.
        reader_task.abort();
        drop(outbound);
        let _ = tokio::time::timeout(Duration::from_secs(5), writer_task).await;
        pending.lock().clear();
        discovery.lock().clear();

        if let Some(mut child) = child {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(?status, "server process exited");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "error waiting for server process");
                }
                Err(_) => {
                    tracing::warn!("server process did not exit within timeout, killing");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill server process");
                    }
                }
            }
        }
    }
}
