//! Per-connection lifecycle.
//!
//! Flow:
//! 1. Client sends `hello` within the handshake timeout
//! 2. Server answers `welcome` with a fresh session id
//! 3. Message loop — inbound frames feed the [`Dispatcher`], outbound
//!    messages flow through an mpsc channel to a dedicated writer task
//! 4. Teardown — on EOF or a malformed frame the connection closes and
//!    every in-flight call on it is cancelled
//!
//! A protocol fault here closes only this connection; other connections
//! and the process are untouched.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tb_protocol::{
    read_frame, write_frame, ErrorKind, FrameError, WireError, WireMessage, PROTOCOL_VERSION,
};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::inflight::InflightTable;
use crate::registry::ToolRegistry;
use crate::sandbox::Sandbox;

/// Drive one connection to completion. `shutdown` aborts the loop early
/// (server going away); teardown still runs, so in-flight calls are
/// cancelled either way.
pub async fn run_connection<R, W>(
    reader: R,
    writer: W,
    registry: Arc<ToolRegistry>,
    sandbox: Arc<Sandbox>,
    config: ServerConfig,
    shutdown: CancellationToken,
    peer: String,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let mut writer = writer;
    let max_bytes = config.max_frame_bytes;

    // ── Handshake ────────────────────────────────────────────────────
    let hello = tokio::time::timeout(
        config.handshake_timeout(),
        read_frame(&mut reader, max_bytes),
    )
    .await;

    let (client_name, client_version) = match hello {
        Ok(Ok(WireMessage::Hello {
            protocol_version,
            client_name,
            client_version,
        })) => {
            if protocol_version != PROTOCOL_VERSION {
                tracing::warn!(
                    peer = %peer,
                    client_version = protocol_version,
                    server_version = PROTOCOL_VERSION,
                    "protocol version mismatch, closing"
                );
                return;
            }
            (client_name, client_version)
        }
        Ok(Ok(_other)) => {
            tracing::warn!(peer = %peer, "first message was not hello, closing");
            return;
        }
        Ok(Err(e)) => {
            tracing::debug!(peer = %peer, error = %e, "connection ended before handshake");
            return;
        }
        Err(_) => {
            tracing::warn!(peer = %peer, "handshake timeout, closing");
            return;
        }
    };

    let session_id = uuid::Uuid::new_v4().to_string();
    let welcome = WireMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        session_id: session_id.clone(),
    };
    if write_frame(&mut writer, &welcome, max_bytes).await.is_err() {
        tracing::warn!(peer = %peer, "failed to send welcome");
        return;
    }

    tracing::info!(
        peer = %peer,
        session_id = %session_id,
        client = %format!("{client_name}/{client_version}"),
        "client connected"
    );

    // ── Message loop ─────────────────────────────────────────────────
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WireMessage>(64);

    // Writer task: forwards outbound messages to the transport. An
    // oversized response is replaced by a contract failure so the call
    // still settles with exactly one response.
    let writer_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            match write_frame(&mut writer, &msg, max_bytes).await {
                Ok(()) => {}
                Err(FrameError::TooLarge { actual, limit }) => {
                    if let WireMessage::Response { id, .. } = &msg {
                        let fallback = WireMessage::failure(
                            id.as_str(),
                            WireError::new(
                                ErrorKind::Contract,
                                format!("result of {actual} bytes exceeds frame limit of {limit} bytes"),
                            ),
                        );
                        if write_frame(&mut writer, &fallback, limit).await.is_err() {
                            break;
                        }
                    } else {
                        tracing::warn!(
                            bytes = actual,
                            limit,
                            "dropping oversized outbound message"
                        );
                    }
                }
                Err(_) => break,
            }
        }
    });

    let inflight = Arc::new(InflightTable::new());
    let dispatcher = Dispatcher::new(
        registry,
        sandbox,
        inflight.clone(),
        outbound_tx,
        config.call_timeout(),
    );

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_bytes) => frame,
            _ = shutdown.cancelled() => {
                tracing::info!(peer = %peer, session_id = %session_id, "connection closed by shutdown");
                break;
            }
        };
        match frame {
            Ok(msg) => dispatcher.handle(msg).await,
            Err(FrameError::Closed) => {
                tracing::info!(peer = %peer, session_id = %session_id, "client disconnected");
                break;
            }
            Err(e) => {
                tracing::warn!(
                    peer = %peer,
                    session_id = %session_id,
                    error = %e,
                    "protocol fault, closing connection"
                );
                break;
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────
    let cancelled = inflight.cancel_all();
    writer_task.abort();
    if cancelled > 0 {
        tracing::info!(
            peer = %peer,
            session_id = %session_id,
            cancelled_in_flight = cancelled,
            "connection torn down with calls in flight"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ToolContext, ToolDescriptor, ToolHandler};
    use serde_json::Value;
    use std::time::Duration;
    use tokio::io::{ReadHalf, WriteHalf};

    struct Echo;
    #[async_trait::async_trait]
    impl ToolHandler for Echo {
        async fn call(&self, _ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
            Ok(args)
        }
    }

    /// Returns a string of `n` bytes — output far larger than its input.
    struct Inflate;
    #[async_trait::async_trait]
    impl ToolHandler for Inflate {
        async fn call(&self, _ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
            let n = args["n"].as_u64().unwrap_or(0) as usize;
            Ok(Value::String("a".repeat(n)))
        }
    }

    fn spawn_connection(
        config: ServerConfig,
    ) -> (
        BufReader<ReadHalf<tokio::io::DuplexStream>>,
        WriteHalf<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<()>,
    ) {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolDescriptor::new(
                    "echo",
                    "",
                    serde_json::json!(true),
                    serde_json::json!(true),
                    Echo,
                )
                .unwrap(),
            )
            .unwrap();
        registry
            .register(
                ToolDescriptor::new(
                    "inflate",
                    "",
                    serde_json::json!(true),
                    serde_json::json!(true),
                    Inflate,
                )
                .unwrap(),
            )
            .unwrap();

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let sandbox = Arc::new(Sandbox::new(4, Duration::from_millis(100)));
        let handle = tokio::spawn(run_connection(
            server_read,
            server_write,
            Arc::new(registry),
            sandbox,
            config,
            CancellationToken::new(),
            "test".into(),
        ));

        (BufReader::new(client_read), client_write, handle)
    }

    fn hello() -> WireMessage {
        WireMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            client_name: "test".into(),
            client_version: "0.0.0".into(),
        }
    }

    const MAX: usize = tb_protocol::MAX_FRAME_BYTES;

    #[tokio::test]
    async fn handshake_then_echo() {
        let (mut read, mut write, _handle) = spawn_connection(ServerConfig::default());

        write_frame(&mut write, &hello(), MAX).await.unwrap();
        let welcome = read_frame(&mut read, MAX).await.unwrap();
        assert!(matches!(welcome, WireMessage::Welcome { .. }));

        write_frame(
            &mut write,
            &WireMessage::Request {
                id: "r1".into(),
                tool: "echo".into(),
                args: serde_json::json!({ "hi": true }),
            },
            MAX,
        )
        .await
        .unwrap();

        match read_frame(&mut read, MAX).await.unwrap() {
            WireMessage::Response { id, ok, result, .. } => {
                assert_eq!(id, "r1");
                assert!(ok);
                assert_eq!(result, Some(serde_json::json!({ "hi": true })));
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_hello_first_message_closes_connection() {
        let (mut read, mut write, handle) = spawn_connection(ServerConfig::default());

        write_frame(&mut write, &WireMessage::DiscoveryRequest, MAX)
            .await
            .unwrap();

        // No welcome — the server just goes away.
        let err = read_frame(&mut read, MAX).await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn version_mismatch_closes_connection() {
        let (mut read, mut write, handle) = spawn_connection(ServerConfig::default());

        write_frame(
            &mut write,
            &WireMessage::Hello {
                protocol_version: PROTOCOL_VERSION + 1,
                client_name: "test".into(),
                client_version: "0.0.0".into(),
            },
            MAX,
        )
        .await
        .unwrap();

        let err = read_frame(&mut read, MAX).await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_frame_closes_connection() {
        use tokio::io::AsyncWriteExt;

        let (mut read, mut write, handle) = spawn_connection(ServerConfig::default());

        write_frame(&mut write, &hello(), MAX).await.unwrap();
        let _welcome = read_frame(&mut read, MAX).await.unwrap();

        write.write_all(b"this is not json\n").await.unwrap();
        write.flush().await.unwrap();

        let err = read_frame(&mut read, MAX).await.unwrap_err();
        assert!(matches!(err, FrameError::Closed));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_result_becomes_contract_failure() {
        let config = ServerConfig {
            max_frame_bytes: 512,
            ..Default::default()
        };
        let (mut read, mut write, _handle) = spawn_connection(config);

        write_frame(&mut write, &hello(), 512).await.unwrap();
        let _welcome = read_frame(&mut read, 512).await.unwrap();

        // Small request, response far over the frame limit.
        write_frame(
            &mut write,
            &WireMessage::Request {
                id: "r1".into(),
                tool: "inflate".into(),
                args: serde_json::json!({ "n": 4096 }),
            },
            512,
        )
        .await
        .unwrap();

        match read_frame(&mut read, 512).await.unwrap() {
            WireMessage::Response { id, ok, error, .. } => {
                assert_eq!(id, "r1");
                assert!(!ok);
                assert_eq!(error.unwrap().kind, ErrorKind::Contract);
            }
            other => panic!("expected response, got {other:?}"),
        }
    }
}
