//! Reference ToolBus server.
//!
//! Registers four demonstration tools and serves them over TCP or stdio:
//!
//! - `ping`         — pong with a timestamp
//! - `echo`         — echo the arguments back
//! - `sleep`        — sleep for `ms` milliseconds, cancellation-aware
//! - `fs.read_text` — read a text file (from an allowlisted directory)
//!
//! Usage:
//!   tb-hello-server --listen 127.0.0.1:4180
//!   tb-hello-server --stdio
//!
//! Env vars:
//!   TB_LOG           — log filter (default: "info")
//!   TB_ALLOWED_DIR   — directory allowed for fs.read_text (default: ".")
//!
//! Exits 0 when the transport closes cleanly, non-zero when startup
//! fails (bad config, unavailable port).

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tb_server::{Server, ServerConfig, ToolContext, ToolDescriptor, ToolHandler, ToolRegistry};

#[derive(Debug, Parser)]
#[command(name = "tb-hello-server", about = "Reference ToolBus server")]
struct Cli {
    /// TCP address to listen on (e.g. 127.0.0.1:4180).
    #[arg(long, conflicts_with = "stdio")]
    listen: Option<String>,

    /// Serve a single connection over stdin/stdout instead of TCP.
    #[arg(long)]
    stdio: bool,

    /// Optional TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr: in stdio mode stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("TB_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };

    let allowed_dir =
        PathBuf::from(std::env::var("TB_ALLOWED_DIR").unwrap_or_else(|_| ".".into()));

    let registry = build_registry(allowed_dir)?;
    let server = Server::new(registry, config);

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.cancel();
            }
        });
    }

    if cli.stdio {
        server.serve_stdio(shutdown).await;
        return Ok(());
    }

    let addr = cli.listen.as_deref().unwrap_or("127.0.0.1:4180");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    server.serve_tcp(listener, shutdown).await?;
    Ok(())
}

fn build_registry(allowed_dir: PathBuf) -> anyhow::Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();

    registry.register(ToolDescriptor::new(
        "ping",
        "Echo pong with a timestamp",
        serde_json::json!({ "type": "object", "additionalProperties": false }),
        serde_json::json!({
            "type": "object",
            "properties": {
                "pong": { "type": "boolean" },
                "timestamp": { "type": "integer" }
            },
            "required": ["pong", "timestamp"]
        }),
        PingTool,
    )?)?;

    registry.register(ToolDescriptor::new(
        "echo",
        "Echo the arguments back",
        serde_json::json!(true),
        serde_json::json!(true),
        EchoTool,
    )?)?;

    registry.register(ToolDescriptor::new(
        "sleep",
        "Sleep for `ms` milliseconds; yields promptly when cancelled",
        serde_json::json!({
            "type": "object",
            "properties": { "ms": { "type": "integer", "minimum": 0 } },
            "required": ["ms"]
        }),
        serde_json::json!({
            "type": "object",
            "properties": { "slept_ms": { "type": "integer" } },
            "required": ["slept_ms"]
        }),
        SleepTool,
    )?)?;

    registry.register(ToolDescriptor::new(
        "fs.read_text",
        "Read a text file from the allowed directory",
        serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        }),
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        }),
        ReadTextTool { allowed_dir },
    )?)?;

    Ok(registry)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct PingTool;

#[async_trait::async_trait]
impl ToolHandler for PingTool {
    async fn call(&self, _ctx: ToolContext, _args: Value) -> anyhow::Result<Value> {
        Ok(serde_json::json!({
            "pong": true,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        }))
    }
}

struct EchoTool;

#[async_trait::async_trait]
impl ToolHandler for EchoTool {
    async fn call(&self, _ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
        Ok(args)
    }
}

struct SleepTool;

#[async_trait::async_trait]
impl ToolHandler for SleepTool {
    async fn call(&self, ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
        let ms = args["ms"].as_u64().unwrap_or(0);
        tokio::select! {
            _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {
                Ok(serde_json::json!({ "slept_ms": ms }))
            }
            _ = ctx.cancel.cancelled() => anyhow::bail!("sleep interrupted"),
        }
    }
}

struct ReadTextTool {
    allowed_dir: PathBuf,
}

#[async_trait::async_trait]
impl ToolHandler for ReadTextTool {
    async fn call(&self, _ctx: ToolContext, args: Value) -> anyhow::Result<Value> {
        let path = args["path"].as_str().unwrap_or_default();
        let resolved = resolve_in_allowed_dir(&self.allowed_dir, Path::new(path))?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .with_context(|| format!("reading {}", resolved.display()))?;
        Ok(serde_json::json!({
            "path": resolved.display().to_string(),
            "content": content,
        }))
    }
}

/// Resolve `path` inside `allowed_dir`, refusing traversal outside it.
fn resolve_in_allowed_dir(allowed_dir: &Path, path: &Path) -> anyhow::Result<PathBuf> {
    let canonical_dir = allowed_dir
        .canonicalize()
        .with_context(|| format!("allowed dir {}", allowed_dir.display()))?;
    let canonical_file = canonical_dir
        .join(path)
        .canonicalize()
        .with_context(|| format!("file {}", path.display()))?;
    if !canonical_file.starts_with(&canonical_dir) {
        anyhow::bail!("path escapes the allowed directory: {}", path.display());
    }
    Ok(canonical_file)
}
