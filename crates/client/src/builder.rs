//! Builder pattern for establishing a [`ClientSession`].

use std::time::Duration;

use crate::session::{ClientError, ClientSession};
use crate::transport;

/// Fluent builder for [`ClientSession`].
///
/// # Example
///
/// ```rust,no_run
/// # async fn example() -> Result<(), tb_client::ClientError> {
/// use tb_client::ClientBuilder;
///
/// let session = ClientBuilder::new()
///     .client_name("my-agent")
///     .client_version(env!("CARGO_PKG_VERSION"))
///     .default_timeout(std::time::Duration::from_secs(30))
///     .connect_tcp("127.0.0.1:4180")
///     .await?;
/// # Ok(()) }
/// ```
pub struct ClientBuilder {
    pub(crate) client_name: String,
    pub(crate) client_version: String,
    pub(crate) default_timeout: Duration,
    pub(crate) handshake_timeout: Duration,
    pub(crate) heartbeat_interval: Option<Duration>,
    pub(crate) max_frame_bytes: usize,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            client_name: "tb-client".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            default_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: None,
            max_frame_bytes: tb_protocol::MAX_FRAME_BYTES,
        }
    }

    /// Name reported in the `hello` handshake.
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    /// Version reported in the `hello` handshake.
    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    /// Default budget for `call` and discovery (default 30s).
    pub fn default_timeout(mut self, d: Duration) -> Self {
        self.default_timeout = d;
        self
    }

    /// How long to wait for `welcome` (default 10s).
    pub fn handshake_timeout(mut self, d: Duration) -> Self {
        self.handshake_timeout = d;
        self
    }

    /// Emit periodic pings. Off by default — mostly useful for long-lived
    /// TCP sessions crossing NAT boxes, pointless on a local pipe.
    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.heartbeat_interval = Some(d);
        self
    }

    /// Upper bound on a single frame, either direction (default 1 MiB).
    pub fn max_frame_bytes(mut self, n: usize) -> Self {
        self.max_frame_bytes = n;
        self
    }

    /// Connect to a listening TCP server.
    pub async fn connect_tcp(self, addr: impl AsRef<str>) -> Result<ClientSession, ClientError> {
        let (reader, writer) = transport::connect_tcp(addr.as_ref()).await?;
        ClientSession::start(reader, writer, None, &self).await
    }

    /// Spawn the server as a child process and connect over its
    /// stdin/stdout pipe.
    pub async fn spawn_server(
        self,
        command: impl AsRef<str>,
        args: Vec<String>,
    ) -> Result<ClientSession, ClientError> {
        let (reader, writer, child) = transport::spawn_server(command.as_ref(), &args)?;
        ClientSession::start(reader, writer, Some(child), &self).await
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
