//! Dispatcher — the per-connection protocol state machine.
//!
//! Call lifecycle: `Received → Validating → Executing → Completed |
//! Cancelled | Failed`. Validation happens inline on the message loop;
//! execution is spawned so independent calls proceed concurrently and
//! responses may leave out of request order — the correlation id is the
//! only ordering contract. A faulting call never disturbs another call
//! or the connection itself.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use tb_protocol::{ErrorKind, WireError, WireMessage};

use crate::inflight::InflightTable;
use crate::registry::{ToolContext, ToolRegistry};
use crate::sandbox::{Sandbox, SandboxError};

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<Sandbox>,
    inflight: Arc<InflightTable>,
    outbound: mpsc::Sender<WireMessage>,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        sandbox: Arc<Sandbox>,
        inflight: Arc<InflightTable>,
        outbound: mpsc::Sender<WireMessage>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            sandbox,
            inflight,
            outbound,
            call_timeout,
        }
    }

    /// Process one inbound message.
    pub async fn handle(&self, msg: WireMessage) {
        match msg {
            WireMessage::Request { id, tool, args } => {
                self.handle_request(id, tool, args).await;
            }
            WireMessage::CancelNotice { id } => {
                // Idempotent: a notice for an unknown or completed id is
                // a no-op and never produces a duplicate response.
                if self.inflight.cancel(&id) {
                    tracing::debug!(request_id = %id, "cancellation requested");
                } else {
                    tracing::debug!(request_id = %id, "cancel notice for unknown call, ignoring");
                }
            }
            WireMessage::DiscoveryRequest => {
                let tools = self.registry.list().collect();
                let _ = self
                    .outbound
                    .send(WireMessage::DiscoveryResponse { tools })
                    .await;
            }
            WireMessage::Ping { timestamp } => {
                let _ = self.outbound.send(WireMessage::Pong { timestamp }).await;
            }
            WireMessage::Pong { .. } => {
                tracing::trace!("received pong");
            }
            other => {
                tracing::debug!(
                    msg_type = ?std::mem::discriminant(&other),
                    "unexpected inbound message type, ignoring"
                );
            }
        }
    }

    async fn handle_request(&self, id: String, tool: String, args: Value) {
        tracing::debug!(request_id = %id, tool = %tool, "received request");

        // Correlation ids must be unique among in-flight calls.
        let cancel = match self.inflight.insert(&id) {
            Some(token) => token,
            None => {
                tracing::warn!(request_id = %id, "correlation id already in flight");
                self.respond_failure(
                    &id,
                    WireError::new(
                        ErrorKind::Protocol,
                        format!("correlation id already in flight: {id}"),
                    ),
                )
                .await;
                return;
            }
        };

        // ── Validating ───────────────────────────────────────────────
        let descriptor = match self.registry.lookup(&tool) {
            Some(d) => d,
            None => {
                self.inflight.remove(&id);
                self.respond_failure(
                    &id,
                    WireError::new(ErrorKind::UnknownTool, format!("unknown tool: {tool}")),
                )
                .await;
                return;
            }
        };

        if let Err((message, path)) = descriptor.validate_input(&args) {
            self.inflight.remove(&id);
            self.respond_failure(&id, WireError::validation(message, path))
                .await;
            return;
        }

        // ── Executing ────────────────────────────────────────────────
        let ctx = ToolContext {
            request_id: id.clone(),
            tool_name: tool.clone(),
            cancel,
        };
        let sandbox = self.sandbox.clone();
        let inflight = self.inflight.clone();
        let outbound = self.outbound.clone();
        let timeout = self.call_timeout;

        tokio::spawn(async move {
            let outcome = sandbox.execute(&descriptor, ctx, args, timeout).await;

            let response = match outcome {
                Ok(result) => {
                    // A result violating the declared output schema is a
                    // server-side contract failure, never passed through.
                    match descriptor.validate_output(&result) {
                        Ok(()) => WireMessage::success(id.as_str(), result),
                        Err((message, path)) => WireMessage::failure(
                            id.as_str(),
                            WireError {
                                kind: ErrorKind::Contract,
                                message: format!("result violates output schema: {message}"),
                                path: Some(path),
                            },
                        ),
                    }
                }
                Err(SandboxError::Handler(message)) => {
                    WireMessage::failure(id.as_str(), WireError::new(ErrorKind::Handler, message))
                }
                Err(SandboxError::Timeout(budget)) => WireMessage::failure(
                    id.as_str(),
                    WireError::new(
                        ErrorKind::Timeout,
                        format!("call exceeded {} ms", budget.as_millis()),
                    ),
                ),
                Err(SandboxError::Cancelled) => WireMessage::failure(
                    id.as_str(),
                    WireError::new(ErrorKind::Cancelled, "call cancelled"),
                ),
            };

            let elapsed = inflight.remove(&id);
            tracing::debug!(
                request_id = %id,
                tool = %tool,
                elapsed_ms = elapsed.map(|d| d.as_millis() as u64),
                ok = matches!(response, WireMessage::Response { ok: true, .. }),
                "call settled"
            );
            let _ = outbound.send(response).await;
        });
    }

    async fn respond_failure(&self, id: &str, error: WireError) {
        let _ = self.outbound.send(WireMessage::failure(id, error)).await;
    }
}
