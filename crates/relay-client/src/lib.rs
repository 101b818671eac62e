// Minimal async client for the gateway's length-prefixed wire protocol.
// Applications and integration tests use it to talk to a running gateway.
use anyhow::{Context, Result, bail};
use bytes::{Bytes, BytesMut};
use relay_wire::{LEN_PREFIX, MIN_FRAME_LEN, TYPE_LEN, encode_frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// One TCP connection to a gateway.
///
/// ```no_run
/// use relay_client::GatewayClient;
///
/// async fn ping(addr: std::net::SocketAddr) -> anyhow::Result<()> {
///     let mut client = GatewayClient::connect(addr).await?;
///     client.send(2, b"hello").await?;
///     let (msg_type, body) = client.recv().await?.expect("reply");
///     assert_eq!(msg_type, 2);
///     println!("{} bytes", body.len());
///     Ok(())
/// }
/// ```
pub struct GatewayClient {
    stream: TcpStream,
    scratch: BytesMut,
    max_frame_bytes: usize,
}

impl GatewayClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("connect to gateway")?;
        Ok(Self {
            stream,
            scratch: BytesMut::new(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    /// Cap on accepted reply frames; mirrors the server-side setting.
    pub fn set_max_frame_bytes(&mut self, max: usize) {
        self.max_frame_bytes = max;
    }

    /// Encode and write one frame.
    pub async fn send(&mut self, msg_type: u16, body: &[u8]) -> Result<()> {
        let frame = encode_frame(msg_type, body).context("encode frame")?;
        self.stream
            .write_all(&frame)
            .await
            .context("write frame")?;
        Ok(())
    }

    /// Write raw bytes as-is. Lets tests exercise split and corrupt frames.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes).await.context("write raw bytes")
    }

    /// Read the next frame. Returns `None` on a clean end-of-stream at a
    /// frame boundary; EOF inside a frame is an error.
    pub async fn recv(&mut self) -> Result<Option<(u16, Bytes)>> {
        let mut header = [0u8; LEN_PREFIX];
        if !self.read_exact_or_eof(&mut header).await? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(header);
        if len < MIN_FRAME_LEN {
            bail!("invalid frame length {len}");
        }
        let len = len as usize;
        if len > self.max_frame_bytes {
            bail!("frame length {len} exceeds cap {}", self.max_frame_bytes);
        }

        let mut type_bytes = [0u8; TYPE_LEN];
        self.stream
            .read_exact(&mut type_bytes)
            .await
            .context("read frame type")?;
        let msg_type = u16::from_be_bytes(type_bytes);

        // Reuse the scratch buffer across reads to avoid per-frame allocation.
        let body_len = len - TYPE_LEN;
        self.scratch.clear();
        self.scratch.resize(body_len, 0);
        self.stream
            .read_exact(&mut self.scratch[..])
            .await
            .context("read frame body")?;
        Ok(Some((msg_type, self.scratch.split().freeze())))
    }

    /// Shut down the write half, signalling end-of-stream to the gateway.
    pub async fn finish(&mut self) -> Result<()> {
        self.stream.shutdown().await.context("shutdown stream")
    }

    // read_exact, except a clean EOF before the first byte yields false.
    async fn read_exact_or_eof(&mut self, out: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < out.len() {
            let n = self
                .stream
                .read(&mut out[filled..])
                .await
                .context("read frame header")?;
            if n == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                bail!("connection closed mid-frame");
            }
            filled += n;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn round_trips_a_frame() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await?;
            let mut buf = vec![0u8; 64];
            let n = sock.read(&mut buf).await?;
            sock.write_all(&buf[..n]).await?;
            Result::<()>::Ok(())
        });

        let mut client = GatewayClient::connect(addr).await?;
        client.send(5, b"abc").await?;
        let (msg_type, body) = client.recv().await?.expect("echoed frame");
        assert_eq!(msg_type, 5);
        assert_eq!(body.as_ref(), b"abc");
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn clean_eof_yields_none() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await?;
            drop(sock);
            Result::<()>::Ok(())
        });

        let mut client = GatewayClient::connect(addr).await?;
        assert!(client.recv().await?.is_none());
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await?;
            // Header promising 10 bytes, then hang up.
            sock.write_all(&[0, 0, 0, 12, 0]).await?;
            Result::<()>::Ok(())
        });

        let mut client = GatewayClient::connect(addr).await?;
        assert!(client.recv().await.is_err());
        server.await??;
        Ok(())
    }
}
