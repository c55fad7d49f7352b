//! Client-side transports.
//!
//! A session needs nothing more than a byte stream split into halves.
//! Two ways to get one:
//! - **TCP**: connect to a listening server.
//! - **Child process**: spawn the server and talk over its stdin/stdout,
//!   the way stdio tool servers are traditionally launched.

use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Connect to a TCP server.
pub(crate) async fn connect_tcp(addr: &str) -> std::io::Result<(BoxedReader, BoxedWriter)> {
    let stream = TcpStream::connect(addr).await?;
    let (read, write) = stream.into_split();
    Ok((Box::new(read), Box::new(write)))
}

/// Spawn a server child process with piped stdin/stdout.
///
/// The child's stderr is inherited so its logs land on the client's
/// stderr. The child is killed if the handle is dropped without a clean
/// shutdown.
pub(crate) fn spawn_server(
    command: &str,
    args: &[String],
) -> std::io::Result<(BoxedReader, BoxedWriter, Child)> {
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    let stdin = child.stdin.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "failed to capture child stdin")
    })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, "failed to capture child stdout")
    })?;

    Ok((Box::new(stdout), Box::new(stdin), child))
}
