//! Server configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Tunables for the server and its sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Handler slots in the sandbox; further calls queue FIFO.
    #[serde(default = "d_8")]
    pub max_concurrent_handlers: usize,
    /// Wall-clock budget per call, measured from execution start (ms).
    #[serde(default = "d_30000")]
    pub call_timeout_ms: u64,
    /// How long a cancelled or timed-out handler gets to acknowledge
    /// before it is abandoned (ms).
    #[serde(default = "d_1000")]
    pub cancel_grace_ms: u64,
    /// How long a fresh connection gets to send `hello` (ms).
    #[serde(default = "d_10000")]
    pub handshake_timeout_ms: u64,
    /// Upper bound on a single encoded frame, either direction (bytes).
    #[serde(default = "d_frame")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 8,
            call_timeout_ms: 30_000,
            cancel_grace_ms: 1_000,
            handshake_timeout_ms: 10_000,
            max_frame_bytes: tb_protocol::MAX_FRAME_BYTES,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_8() -> usize {
    8
}
fn d_30000() -> u64 {
    30_000
}
fn d_1000() -> u64 {
    1_000
}
fn d_10000() -> u64 {
    10_000
}
fn d_frame() -> usize {
    tb_protocol::MAX_FRAME_BYTES
}
