//! Server entry points: TCP accept loop and single-connection stdio.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::connection::run_connection;
use crate::registry::ToolRegistry;
use crate::sandbox::Sandbox;

/// A configured server: registry plus shared sandbox.
///
/// The registry is frozen at construction — registration before first
/// use, no re-registration races.
pub struct Server {
    registry: Arc<ToolRegistry>,
    sandbox: Arc<Sandbox>,
    config: ServerConfig,
}

impl Server {
    pub fn new(registry: ToolRegistry, config: ServerConfig) -> Self {
        let sandbox = Arc::new(Sandbox::new(
            config.max_concurrent_handlers,
            config.cancel_grace(),
        ));
        Self {
            registry: Arc::new(registry),
            sandbox,
            config,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Accept connections until `shutdown` fires. Each connection runs on
    /// its own task; all of them share the sandbox's concurrency budget.
    pub async fn serve_tcp(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, tools = self.registry.len(), "listening");

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = shutdown.cancelled() => {
                    tracing::info!(addr = %local, "shutdown requested");
                    return Ok(());
                }
            };

            let (read, write) = stream.into_split();
            let registry = self.registry.clone();
            let sandbox = self.sandbox.clone();
            let config = self.config.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(run_connection(
                read,
                write,
                registry,
                sandbox,
                config,
                shutdown,
                peer.to_string(),
            ));
        }
    }

    /// Serve exactly one connection over stdin/stdout. Returns when the
    /// pipe closes or `shutdown` fires — the process is expected to exit
    /// 0 afterwards.
    pub async fn serve_stdio(&self, shutdown: CancellationToken) {
        tracing::info!(tools = self.registry.len(), "serving on stdio");
        run_connection(
            tokio::io::stdin(),
            tokio::io::stdout(),
            self.registry.clone(),
            self.sandbox.clone(),
            self.config.clone(),
            shutdown,
            "stdio".to_string(),
        )
        .await;
    }
}
