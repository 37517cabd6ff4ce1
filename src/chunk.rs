use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::errors::{Result, StreamError};
use crate::source::ByteSource;

/// Capacity of the chunk conduit.
///
/// A single slot gives rendezvous-style backpressure: the producer holds
/// at most one published chunk plus the one it is currently reading.
pub const CONDUIT_CAPACITY: usize = 1;

/// Spawn the chunk source: a blocking task that tiles `source` into
/// fixed-size windows and publishes them, in order, onto a bounded
/// conduit.
///
/// The conduit closes when the task finishes, whether the source was
/// exhausted, a read failed, or the run was cancelled — the consumer is
/// never left blocked. The task resolves to the total number of bytes
/// read.
pub fn spawn_chunk_source<S>(
    mut source: S,
    config: StreamConfig,
    cancel: CancellationToken,
) -> (Receiver<Vec<u8>>, JoinHandle<Result<u64>>)
where
    S: ByteSource + Send + 'static,
{
    let (tx, rx) = mpsc::channel(CONDUIT_CAPACITY);
    let handle = tokio::task::spawn_blocking(move || {
        read_chunks(&mut source, &config, &tx, &cancel)
    });

    (rx, handle)
}

fn read_chunks<S: ByteSource>(
    source: &mut S,
    config: &StreamConfig,
    chunks: &Sender<Vec<u8>>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut offset: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            log::debug!("chunk source cancelled at offset {}", offset);
            return Err(StreamError::Cancelled);
        }

        let mut buf = vec![0u8; config.buffer_size];
        let (read, end) = source.read_at(&mut buf, offset).map_err(|e| {
            log::error!("read failed at offset {}: {}", offset, e);
            e
        })?;
        offset += read as u64;

        if read > 0 {
            // Publish exactly the bytes read, never the full capacity.
            buf.truncate(read);
            log::trace!("publishing {} bytes, offset now {}", read, offset);

            if cancel.is_cancelled() {
                log::debug!("chunk source cancelled before publish");
                return Err(StreamError::Cancelled);
            }
            if chunks.blocking_send(buf).is_err() {
                log::debug!(
                    "chunk conduit closed by consumer at offset {}",
                    offset
                );
                return Ok(offset);
            }
        }

        if end {
            log::debug!("source exhausted at offset {}", offset);
            return Ok(offset);
        }
        if read == 0 {
            // Zero bytes without an end-of-stream signal is unusual;
            // treat it conservatively as exhaustion.
            log::warn!(
                "zero-byte read without end of stream at offset {}, stopping",
                offset
            );
            return Ok(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Source that never signals end of stream but runs out of bytes.
    struct SilentlyDrySource {
        data: Vec<u8>,
    }

    impl ByteSource for SilentlyDrySource {
        fn read_at(
            &mut self,
            buf: &mut [u8],
            offset: u64,
        ) -> Result<(usize, bool)> {
            let start = usize::min(offset as usize, self.data.len());
            let end = usize::min(start + buf.len(), self.data.len());
            buf[..end - start].copy_from_slice(&self.data[start..end]);
            Ok((end - start, false))
        }
    }

    /// Source that fails after serving one window.
    struct FailingSource {
        reads: usize,
    }

    impl ByteSource for FailingSource {
        fn read_at(
            &mut self,
            buf: &mut [u8],
            _offset: u64,
        ) -> Result<(usize, bool)> {
            self.reads += 1;
            if self.reads > 1 {
                return Err(StreamError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "connection reset",
                )));
            }
            buf.fill(b'x');
            Ok((buf.len(), false))
        }
    }

    async fn drain(mut chunks: Receiver<Vec<u8>>) -> Vec<Vec<u8>> {
        let mut received = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            received.push(chunk);
        }
        received
    }

    #[tokio::test]
    async fn tiles_source_into_fixed_windows() {
        let source = crate::source::BytesSource::new(*b"0123456789");
        let config = StreamConfig::default().buffer_size(4);

        let (chunks, handle) =
            spawn_chunk_source(source, config, CancellationToken::new());
        let received = drain(chunks).await;

        assert_eq!(
            received,
            vec![b"0123".to_vec(), b"4567".to_vec(), b"89".to_vec()]
        );
        let bytes = handle
            .await
            .expect("Producer task should not panic")
            .expect("Producer should succeed");
        assert_eq!(bytes, 10);
    }

    #[tokio::test]
    async fn zero_byte_read_stops_conservatively() {
        let source = SilentlyDrySource {
            data: b"abcdef".to_vec(),
        };
        let config = StreamConfig::default().buffer_size(4);

        let (chunks, handle) =
            spawn_chunk_source(source, config, CancellationToken::new());
        let received = drain(chunks).await;

        assert_eq!(received, vec![b"abcd".to_vec(), b"ef".to_vec()]);
        let bytes = handle
            .await
            .expect("Producer task should not panic")
            .expect("Producer should stop without error");
        assert_eq!(bytes, 6);
    }

    #[tokio::test]
    async fn read_failure_closes_conduit() {
        let source = FailingSource { reads: 0 };
        let config = StreamConfig::default().buffer_size(4);

        let (chunks, handle) =
            spawn_chunk_source(source, config, CancellationToken::new());
        let received = drain(chunks).await;

        // The first window still arrives, then the conduit closes.
        assert_eq!(received.len(), 1);
        let result = handle.await.expect("Producer task should not panic");
        assert!(matches!(result, Err(StreamError::Io(_))));
    }

    #[tokio::test]
    async fn cancellation_stops_the_producer() {
        let source = crate::source::BytesSource::new(vec![b'x'; 4096]);
        let config = StreamConfig::default().buffer_size(16);
        let cancel = CancellationToken::new();

        let (mut chunks, handle) =
            spawn_chunk_source(source, config, cancel.clone());

        let first = chunks.recv().await;
        assert!(first.is_some());
        cancel.cancel();
        drop(chunks);

        let result = handle.await.expect("Producer task should not panic");
        assert!(matches!(result, Err(StreamError::Cancelled) | Ok(_)));
    }

    #[tokio::test]
    async fn producer_never_runs_ahead_of_the_consumer() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct CountingSource {
            inner: crate::source::BytesSource,
            reads: Arc<AtomicUsize>,
        }

        impl ByteSource for CountingSource {
            fn read_at(
                &mut self,
                buf: &mut [u8],
                offset: u64,
            ) -> Result<(usize, bool)> {
                self.reads.fetch_add(1, Ordering::SeqCst);
                self.inner.read_at(buf, offset)
            }
        }

        let reads = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            inner: crate::source::BytesSource::new(vec![b'x'; 160]),
            reads: reads.clone(),
        };
        let config = StreamConfig::default().buffer_size(16);

        let (mut chunks, handle) =
            spawn_chunk_source(source, config, CancellationToken::new());

        // Receive slowly; the producer may only ever be one published
        // chunk plus one in-progress read ahead.
        for received in 1usize..=5 {
            chunks.recv().await.expect("Chunk should arrive");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            assert!(
                reads.load(Ordering::SeqCst) <= received + CONDUIT_CAPACITY + 1,
                "producer ran ahead of backpressure"
            );
        }

        drop(chunks);
        let _ = handle.await.expect("Producer task should not panic");
    }
}
