use tokio_util::sync::CancellationToken;

use crate::chunk::spawn_chunk_source;
use crate::config::StreamConfig;
use crate::errors::{Result, StreamError};
use crate::reassembly::{RecordAssembler, RecordHandler, StreamStats};
use crate::source::ByteSource;

/// Stream a delimited byte source through the chunk conduit, invoking
/// `handler` once per reassembled record, in stream order.
///
/// The producer reads fixed-size windows off the positional-read
/// capability while the reassembler repairs records split by window
/// boundaries; memory stays bounded by the window size plus any carried
/// record fragment. Cancelling `cancel` stops both stages promptly and
/// yields [`StreamError::Cancelled`].
pub async fn stream_records<S, H>(
    source: S,
    config: StreamConfig,
    handler: &mut H,
    cancel: CancellationToken,
) -> Result<StreamStats>
where
    S: ByteSource + Send + 'static,
    H: RecordHandler,
{
    config.validate()?;
    log::debug!(
        "starting record stream: buffer_size={}, delimiter={:?}",
        config.buffer_size,
        config.delimiter as char
    );

    let (chunks, producer) =
        spawn_chunk_source(source, config.clone(), cancel.clone());

    let mut assembler = RecordAssembler::new(config);
    let consumed = assembler.consume(chunks, handler, &cancel).await;

    // The receiver is gone by now, so a producer blocked on a full
    // conduit has unblocked; join it to surface read failures.
    let produced = producer.await.map_err(|e| {
        StreamError::Channel(format!("chunk source task failed: {e}"))
    })?;

    consumed?;
    let bytes = produced?;

    let stats = assembler.into_stats();
    log::info!(
        "stream complete: {} bytes in {} chunks, {} records ({} parse, {} handler errors)",
        bytes,
        stats.chunks,
        stats.records,
        stats.parse_errors,
        stats.handler_errors
    );
    Ok(stats)
}
