//! Local tunnel endpoint.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::debug;

use np_core::bridge::{self, BridgeConfig};

/// Accept exactly one connection on `listener` and bridge it to the
/// already-authenticated relay socket. The listener closes after the
/// accept, mirroring the relay's one-shot listeners.
pub async fn serve_one<S>(listener: TcpListener, relay: S) -> io::Result<(u64, u64)>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (local, peer) = listener.accept().await?;
    drop(listener);
    debug!(%peer, "local tunnel connection accepted");
    bridge::splice("local-tunnel", local, relay, &BridgeConfig::default()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn one_connection_is_bridged_end_to_end() {
        // A stand-in for the relay: echoes whatever arrives.
        let far_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let far_addr = far_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = far_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });
        let relay = TcpStream::connect(far_addr).await.unwrap();

        let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local_listener.local_addr().unwrap();
        let bridge = tokio::spawn(serve_one(local_listener, relay));

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");

        drop(client);
        let _ = bridge.await.unwrap();
    }
}
