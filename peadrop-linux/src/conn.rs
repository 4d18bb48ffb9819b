//! One job's TCP stream: frame-level reads with an optional idle timeout, header and chunk writes.

use std::net::SocketAddr;
use std::time::Duration;

use peadrop_core::wire::{encode_chunk, encode_frame};
use peadrop_core::{Frame, FrameDecodeError, FrameDecoder, FrameEncodeError, Header};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad frame: {0}")]
    Frame(#[from] FrameDecodeError),
    #[error("cannot encode header: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("connection closed by peer")]
    Closed,
    #[error("no data for {0:?}")]
    IdleTimeout(Duration),
}

pub struct FramedConn {
    stream: TcpStream,
    decoder: FrameDecoder,
    peer: SocketAddr,
    read_buf: Vec<u8>,
}

impl FramedConn {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            decoder: FrameDecoder::new(),
            peer,
            read_buf: vec![0u8; READ_BUF_SIZE],
        })
    }

    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Next whole frame. Frames already buffered are always returned before a close
    /// is reported, so a close is judged against the state left by the last frame.
    /// Cancel-safe: bytes read before cancellation stay buffered.
    pub async fn recv(&mut self, idle: Option<Duration>) -> Result<Frame, ConnError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }
            let read = self.stream.read(&mut self.read_buf);
            let n = match idle {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .map_err(|_| ConnError::IdleTimeout(limit))??,
                None => read.await?,
            };
            if n == 0 {
                return Err(ConnError::Closed);
            }
            self.decoder.push(&self.read_buf[..n]);
        }
    }

    pub async fn send(&mut self, header: &Header) -> Result<(), ConnError> {
        let frame = encode_frame(header)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Chunk header and payload in one write.
    pub async fn send_chunk(&mut self, payload: &[u8]) -> Result<(), ConnError> {
        let frame = encode_chunk(payload)?;
        self.stream.write_all(&frame).await?;
        Ok(())
    }

    /// Half-close our side; errors are irrelevant at this point.
    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// After our last frame: discard whatever still arrives until the peer closes,
    /// waiting at most `grace`.
    pub async fn drain_until_closed(&mut self, grace: Duration) {
        let _ = tokio::time::timeout(grace, async {
            loop {
                match self.stream.read(&mut self.read_buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
    }
}
