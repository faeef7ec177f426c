use std::sync::Arc;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::StreamError;

/// Receiver for flushed data blocks. The connection's implementation blocks until the
///  congestion window admits another packet - that back-pressure propagating up through
///  `write` and stalling the application is the intended behavior.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockSink: Send + Sync + 'static {
    async fn receive_block(&self, data: Bytes) -> Result<(), StreamError>;
}

/// Per-connection write buffer: application writes accumulate until a full packet
///  payload is available (or immediately, for interactive flows), then go to the sink
///  as one data block.
///
/// Flushes are atomic with respect to the buffer: the lock is held across the flush,
///  so concurrent writers never see a partially drained buffer.
pub struct MessageOutputStream {
    inner: Mutex<OutputInner>,
    sink: Arc<dyn BlockSink>,
    /// flush threshold - one packet payload
    buffer_size: usize,
    /// flush eagerly rather than waiting for a full packet
    interactive: bool,
}

struct OutputInner {
    buffer: BytesMut,
    closed: bool,
}

impl MessageOutputStream {
    pub fn new(sink: Arc<dyn BlockSink>, buffer_size: usize, interactive: bool) -> MessageOutputStream {
        MessageOutputStream {
            inner: Mutex::new(OutputInner {
                buffer: BytesMut::with_capacity(buffer_size),
                closed: false,
            }),
            sink,
            buffer_size,
            interactive,
        }
    }

    pub async fn write(&self, mut data: &[u8]) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(StreamError::Closed);
        }

        while !data.is_empty() {
            let room = self.buffer_size - inner.buffer.len();
            let n = room.min(data.len());
            inner.buffer.put_slice(&data[..n]);
            data = &data[n..];

            if inner.buffer.len() == self.buffer_size {
                self.flush_locked(&mut inner).await?;
            }
        }

        if self.interactive && !inner.buffer.is_empty() {
            self.flush_locked(&mut inner).await?;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;
        if inner.buffer.is_empty() {
            return Ok(());
        }
        self.flush_locked(&mut inner).await
    }

    /// Flush any buffered data and mark the stream closed. Idempotent.
    pub async fn close(&self) -> Result<(), StreamError> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        if !inner.buffer.is_empty() {
            self.flush_locked(&mut inner).await?;
        }
        Ok(())
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    async fn flush_locked(&self, inner: &mut OutputInner) -> Result<(), StreamError> {
        let block = inner.buffer.split().freeze();
        trace!("flushing block of {} bytes", block.len());
        self.sink.receive_block(block).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use rstest::rstest;

    #[rstest]
    #[case::below_threshold(8, vec![vec![1, 2, 3]], vec![])]
    #[case::exact_threshold(3, vec![vec![1, 2, 3]], vec![vec![1, 2, 3]])]
    #[case::split_across_blocks(4, vec![vec![1, 2, 3, 4, 5, 6]], vec![vec![1, 2, 3, 4]])]
    #[case::accumulates_across_writes(4, vec![vec![1, 2], vec![3, 4, 5]], vec![vec![1, 2, 3, 4]])]
    fn test_write_buffering(
        #[case] buffer_size: usize,
        #[case] writes: Vec<Vec<u8>>,
        #[case] expected_blocks: Vec<Vec<u8>>,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async move {
            let mut sink = MockBlockSink::new();
            for block in expected_blocks {
                sink.expect_receive_block()
                    .with(eq(Bytes::from(block)))
                    .once()
                    .returning(|_| Ok(()));
            }

            let out = MessageOutputStream::new(Arc::new(sink), buffer_size, false);
            for w in writes {
                out.write(&w).await.unwrap();
            }
        });
    }

    #[rstest]
    fn test_interactive_flushes_eagerly() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sink = MockBlockSink::new();
            sink.expect_receive_block()
                .with(eq(Bytes::from_static(&[1, 2])))
                .once()
                .returning(|_| Ok(()));

            let out = MessageOutputStream::new(Arc::new(sink), 1024, true);
            out.write(&[1, 2]).await.unwrap();
        });
    }

    #[rstest]
    fn test_close_flushes_remainder_and_is_idempotent() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sink = MockBlockSink::new();
            sink.expect_receive_block()
                .with(eq(Bytes::from_static(&[9])))
                .once()
                .returning(|_| Ok(()));

            let out = MessageOutputStream::new(Arc::new(sink), 1024, false);
            out.write(&[9]).await.unwrap();
            out.close().await.unwrap();
            out.close().await.unwrap();

            assert_eq!(out.write(&[1]).await, Err(StreamError::Closed));
        });
    }

    #[rstest]
    fn test_sink_error_propagates_to_writer() {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut sink = MockBlockSink::new();
            sink.expect_receive_block().returning(|_| Err(StreamError::Reset));

            let out = MessageOutputStream::new(Arc::new(sink), 2, false);
            assert_eq!(out.write(&[1, 2, 3]).await, Err(StreamError::Reset));
        });
    }
}
