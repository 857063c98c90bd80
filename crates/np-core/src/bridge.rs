//! Full-duplex byte bridging between two streams.
//!
//! Used three times in the system: the relay splices the two authenticated
//! rendezvous sockets, the daemon bridges its rendezvous socket to the local
//! sshd, and the client bridges its local listener to its rendezvous socket.
//!
//! Each direction reads into a bounded buffer and only reads again once the
//! mirrored write has completed, so a slow receiver throttles a fast sender
//! without unbounded memory.

use std::fmt::Write as _;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Per-direction buffer size. 64 KiB is the floor the protocol requires.
pub const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub buffer_size: usize,
    /// Hex-dump every chunk at debug level. Never alters the bytes.
    pub snoop: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            buffer_size: BUFFER_SIZE,
            snoop: false,
        }
    }
}

/// Copy bytes both ways between `a` and `b` until either side EOFs or
/// errors. Returns (bytes a→b, bytes b→a).
///
/// On EOF in one direction the corresponding writer is shut down, which
/// propagates the close to the far peer; the call returns once both
/// directions have drained.
pub async fn splice<A, B>(label: &str, a: A, b: B, config: &BridgeConfig) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    tokio::try_join!(
        pump(label, "a->b", &mut a_read, &mut b_write, config),
        pump(label, "b->a", &mut b_read, &mut a_write, config),
    )
}

async fn pump<R, W>(
    label: &str,
    direction: &str,
    reader: &mut R,
    writer: &mut W,
    config: &BridgeConfig,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; config.buffer_size];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            let _ = writer.shutdown().await;
            debug!(%label, direction, total, "bridge direction closed");
            return Ok(total);
        }
        if config.snoop {
            debug!(%label, direction, "\n{}", hex_dump(&buf[..n]));
        }
        // The mirrored write must finish before the next read; this is the
        // backpressure path.
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Render bytes as offset-prefixed hex lines, 16 bytes per line.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (i, chunk) in bytes.chunks(16).enumerate() {
        let _ = write!(out, "{:08x}  ", i * 16);
        for b in chunk {
            let _ = write!(out, "{b:02x} ");
        }
        out.push('\n');
    }
    out
}
