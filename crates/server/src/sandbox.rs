//! Handler execution sandbox.
//!
//! Every handler runs inside [`Sandbox::execute`], which enforces:
//!
//! - **Bounded concurrency** — a fair semaphore admits at most `N`
//!   handlers at once; excess calls queue in arrival order.
//! - **Wall-clock timeout** — measured from the moment the handler starts
//!   executing. On expiry the call's cancellation token fires; a handler
//!   that does not yield within the grace period is abandoned (the future
//!   is dropped, which reclaims its resources).
//! - **Fault isolation** — panics and handler errors are captured and
//!   converted to structured errors; nothing raw escapes the boundary.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::registry::{ToolContext, ToolDescriptor};

/// Terminal outcome of a sandboxed execution, other than success.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    #[error("handler fault: {0}")]
    Handler(String),

    #[error("call exceeded {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,
}

/// Shared execution sandbox. One per server; all connections feed it.
pub struct Sandbox {
    permits: Arc<Semaphore>,
    grace: Duration,
}

impl Sandbox {
    /// * `max_concurrent` — handler slots; further calls queue FIFO.
    /// * `grace` — how long a cancelled or timed-out handler gets to
    ///   acknowledge before it is abandoned.
    pub fn new(max_concurrent: usize, grace: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            grace,
        }
    }

    /// Run one handler to a terminal state.
    pub async fn execute(
        &self,
        descriptor: &ToolDescriptor,
        ctx: ToolContext,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, SandboxError> {
        // Queue for a slot; cancellation while queued aborts before the
        // handler ever starts. `biased` gives the cancellation signal
        // priority when both are ready.
        let _permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(SandboxError::Cancelled),
            permit = self.permits.acquire() => match permit {
                Ok(p) => p,
                // Closed semaphore means the server is going away.
                Err(_) => return Err(SandboxError::Cancelled),
            },
        };

        let handler = descriptor.handler();
        let cancel = ctx.cancel.clone();
        let fut = AssertUnwindSafe(handler.call(ctx, args)).catch_unwind();
        tokio::pin!(fut);

        let expiry = tokio::select! {
            biased;
            _ = cancel.cancelled() => SandboxError::Cancelled,
            _ = tokio::time::sleep(timeout) => SandboxError::Timeout(timeout),
            result = &mut fut => return settle(result),
        };

        // Signal the handler and give it the grace period to yield. Its
        // result, if any, is discarded — the call is already terminal.
        cancel.cancel();
        if tokio::time::timeout(self.grace, &mut fut).await.is_err() {
            tracing::warn!(error = %expiry, "handler ignored cancellation, abandoning");
        }
        Err(expiry)
    }
}

type CaughtResult = Result<anyhow::Result<Value>, Box<dyn std::any::Any + Send>>;

/// Collapse a caught handler result into the sandbox outcome.
fn settle(result: CaughtResult) -> Result<Value, SandboxError> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(SandboxError::Handler(fault.to_string())),
        Err(payload) => Err(SandboxError::Handler(panic_message(payload))),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
