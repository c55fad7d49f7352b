//! `tb-server` — the ToolBus server: registry, dispatcher, and sandbox.
//!
//! Register schema-typed tools, then serve them over TCP or stdio:
//!
//! ```rust,ignore
//! use tb_server::{Server, ServerConfig, ToolDescriptor, ToolRegistry};
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(ToolDescriptor::new(
//!     "echo",
//!     "Echo the arguments back",
//!     serde_json::json!({ "type": "object" }),
//!     serde_json::json!({ "type": "object" }),
//!     EchoTool,
//! )?)?;
//!
//! let server = Server::new(registry, ServerConfig::default());
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:4180").await?;
//! server.serve_tcp(listener, shutdown).await?;
//! ```
//!
//! Each connection runs a hello/welcome handshake, then a message loop:
//! requests are validated against the tool's input schema, executed inside
//! a bounded sandbox (concurrency cap, wall-clock timeout, panic capture,
//! cooperative cancellation), and answered with a correlated response.
//! One call's failure never disturbs another call or the connection.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod inflight;
pub mod registry;
pub mod sandbox;
pub mod server;

pub use config::ServerConfig;
pub use registry::{RegistryError, ToolContext, ToolDescriptor, ToolHandler, ToolRegistry};
pub use sandbox::{Sandbox, SandboxError};
pub use server::Server;
