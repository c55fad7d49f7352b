//! `tb-client` — client session for the ToolBus protocol.
//!
//! Exposes a synchronous-looking `call` interface over the asynchronous
//! transport: each call gets a fresh correlation id, a pending slot, and
//! a local timeout; the background reader task routes responses back by
//! id, so calls from many tasks can be in flight at once.
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tb_client::ClientBuilder;
//!
//! let session = ClientBuilder::new()
//!     .client_name("example")
//!     .default_timeout(Duration::from_secs(10))
//!     .connect_tcp("127.0.0.1:4180")
//!     .await?;
//!
//! let tools = session.list_tools().await?;
//! let result = session.call("echo", serde_json::json!({ "x": 1 })).await?;
//! session.shutdown().await;
//! ```
//!
//! A session can also spawn the server as a child process and talk to it
//! over its stdin/stdout pipe — the same shape the original stdio tool
//! servers use.

pub mod builder;
pub mod session;
pub mod transport;

pub use builder::ClientBuilder;
pub use session::{ClientError, ClientSession};
