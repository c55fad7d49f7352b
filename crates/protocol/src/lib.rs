//! `tb-protocol` — wire types and framing for the ToolBus protocol.
//!
//! The protocol is message-oriented and bidirectional: each message is a
//! single line of JSON (newline-delimited) carried over any byte stream —
//! a TCP socket or a stdin/stdout pipe.
//!
//! Connection flow:
//!
//! 1. Client sends `hello { protocol_version, client_name, client_version }`
//! 2. Server answers `welcome { protocol_version, server_version, session_id }`
//! 3. Main loop:
//!    - Client sends `request { id, tool, args }`; server eventually answers
//!      `response { id, ok, result, error }` — out of request order is fine,
//!      the correlation `id` is the only ordering contract.
//!    - `cancel_notice { id }` asks the server to cancel an in-flight call.
//!    - `discovery_request` / `discovery_response` list the registered tools.
//!    - `ping` / `pong` keep long-lived connections warm.

pub mod blob;
pub mod framing;
pub mod message;

pub use blob::Blob;
pub use framing::{read_frame, write_frame, FrameError};
pub use message::{ErrorKind, ToolSummary, WireError, WireMessage};

/// Protocol version negotiated in the hello/welcome handshake.
/// Peers with a different version must not proceed past the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default upper bound on a single encoded frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;
