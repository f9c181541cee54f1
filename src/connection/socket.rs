use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// This is an abstraction for writing encoded frames to the socket, introduced to facilitate
///  mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameSink: Send + Sync + 'static {
    async fn write_frames(&self, buf: &[u8]) -> anyhow::Result<()>;

    async fn shutdown(&self);
}

/// [FrameSink] for the write half of any byte stream (TCP, TLS, in-memory)
pub struct StreamSink<W> {
    writer: Mutex<W>,
}

impl <W: AsyncWrite + Unpin + Send + 'static> StreamSink<W> {
    pub fn new(writer: W) -> StreamSink<W> {
        StreamSink {
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl <W: AsyncWrite + Unpin + Send + 'static> FrameSink for StreamSink<W> {
    async fn write_frames(&self, buf: &[u8]) -> anyhow::Result<()> {
        trace!("writing {} bytes", buf.len());
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn shutdown(&self) {
        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("error shutting down socket: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_stream_sink() {
        let (a, mut b) = tokio::io::duplex(64);
        let sink = StreamSink::new(a);
        sink.write_frames(&[1, 2, 3]).await.unwrap();
        sink.shutdown().await;

        let mut received = Vec::new();
        b.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, vec![1, 2, 3]);
    }
}
