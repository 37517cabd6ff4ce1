use csv::{Reader, ReaderBuilder, StringRecord};
use serde::Serialize;
use tokio::sync::mpsc::Receiver;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::errors::{Result, StreamError};

/// Receives each reassembled record, in stream order.
///
/// A returned error marks the record as failed downstream; it is logged
/// and counted, and the pipeline continues. Callers that need to stop on
/// the first failure should cancel the run instead.
pub trait RecordHandler {
    fn handle(&mut self, record: Vec<String>) -> Result<()>;
}

impl<F> RecordHandler for F
where
    F: FnMut(Vec<String>) -> Result<()>,
{
    fn handle(&mut self, record: Vec<String>) -> Result<()> {
        self(record)
    }
}

/// Counters accumulated over one streaming run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    /// Chunks taken off the conduit.
    pub chunks: u64,
    /// Bytes contained in those chunks.
    pub bytes: u64,
    /// Records handed to the record handler.
    pub records: u64,
    /// Chunks or trailing fragments abandoned because of malformed bytes.
    pub parse_errors: u64,
    /// Records the handler rejected.
    pub handler_errors: u64,
}

/// Reassembles delimited records from an ordered sequence of byte chunks.
///
/// Records falling strictly inside a chunk are emitted immediately. A
/// record whose parse ends flush with the chunk's final byte cannot be
/// confirmed until the following bytes are seen, so its raw span is
/// carried over and merged with the continuation at the start of the
/// next chunk. When the stream ends, whatever is still carried is
/// accepted as the final record.
pub struct RecordAssembler {
    config: StreamConfig,
    carry: Vec<u8>,
    stats: StreamStats,
}

impl RecordAssembler {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            carry: Vec::new(),
            stats: StreamStats::default(),
        }
    }

    /// Counters accumulated so far.
    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Consume the assembler, returning its counters.
    pub fn into_stats(self) -> StreamStats {
        self.stats
    }

    /// Number of bytes currently held over from the previous chunk.
    pub fn carry_len(&self) -> usize {
        self.carry.len()
    }

    /// Drain the conduit until it closes or the run is cancelled.
    ///
    /// On closure the pending carry is flushed as the final record. On
    /// cancellation the wait resolves immediately; an in-flight chunk is
    /// finished but nothing further is accepted and nothing is flushed.
    pub async fn consume<H: RecordHandler>(
        &mut self,
        mut chunks: Receiver<Vec<u8>>,
        handler: &mut H,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                chunk = chunks.recv() => match chunk {
                    Some(chunk) => self.process_chunk(&chunk, handler),
                    None => {
                        self.finish(handler);
                        return Ok(());
                    }
                },
                _ = cancel.cancelled() => {
                    log::debug!(
                        "reassembly cancelled with {} carried bytes",
                        self.carry.len()
                    );
                    return Err(StreamError::Cancelled);
                }
            }
        }
    }

    /// Parse one chunk, emitting every record confirmed complete and
    /// deferring a trailing boundary record into the carry buffer.
    pub fn process_chunk<H: RecordHandler>(
        &mut self,
        chunk: &[u8],
        handler: &mut H,
    ) {
        self.stats.chunks += 1;
        self.stats.bytes += chunk.len() as u64;
        log::trace!(
            "chunk {}: {} bytes, {} carried",
            self.stats.chunks,
            chunk.len(),
            self.carry.len()
        );

        let mut reader = record_reader(chunk, self.config.delimiter);
        let mut record = StringRecord::new();
        let mut attempts = 0usize;

        loop {
            let last_offset = reader.position().byte() as usize;
            let got = match reader.read_record(&mut record) {
                Ok(got) => got,
                Err(e) => {
                    // Malformed bytes: give up on this chunk only.
                    self.stats.parse_errors += 1;
                    log::error!(
                        "abandoning chunk {}: parse error at offset {}: {}",
                        self.stats.chunks,
                        last_offset,
                        e
                    );
                    self.salvage_carry(handler);
                    return;
                }
            };
            let buf_offset = reader.position().byte() as usize;
            attempts += 1;

            if attempts == 1 && !self.carry.is_empty() {
                // The previous chunk ended in a dangling record; its
                // continuation is the first span of this chunk.
                let split = if got { buf_offset } else { chunk.len() };
                let mut merged = std::mem::take(&mut self.carry);
                merged.extend_from_slice(&chunk[..split]);
                self.emit_merged(&merged, handler);
                if !got {
                    return;
                }
                continue;
            }

            if !got {
                return;
            }

            if buf_offset == chunk.len() {
                // The record ends flush with the chunk's final byte; only
                // the next bytes can confirm it, so its raw span is
                // carried over.
                if let Some(expected) = self.config.expected_fields {
                    if record.len() < expected {
                        log::debug!(
                            "boundary record has {} of {} expected fields",
                            record.len(),
                            expected
                        );
                    }
                }
                self.carry = chunk[last_offset..].to_vec();
                log::trace!("carrying {} trailing bytes", self.carry.len());
                return;
            }

            self.emit(&record, handler);
        }
    }

    /// Flush the pending carry once the conduit closes: the remaining
    /// bytes are the stream's final record and are accepted as-is.
    pub fn finish<H: RecordHandler>(&mut self, handler: &mut H) {
        if self.carry.is_empty() {
            log::trace!("stream ended with no pending bytes");
            return;
        }

        let pending = std::mem::take(&mut self.carry);
        log::debug!("flushing {} pending bytes as final record", pending.len());

        let mut reader = record_reader(&pending, self.config.delimiter);
        let mut record = StringRecord::new();
        loop {
            match reader.read_record(&mut record) {
                Ok(true) => self.emit(&record, handler),
                Ok(false) => return,
                Err(e) => {
                    // The stream's last bytes never formed a valid
                    // record and there is no more data to complete them.
                    self.stats.parse_errors += 1;
                    log::error!("failed to parse final record: {}", e);
                    return;
                }
            }
        }
    }

    /// Settle the carry when the chunk that was to confirm it is lost.
    ///
    /// A terminated carried span was already a whole record and is
    /// emitted, keeping the loss confined to the abandoned chunk. An
    /// unterminated span continued into the lost bytes and cannot be
    /// completed.
    fn salvage_carry<H: RecordHandler>(&mut self, handler: &mut H) {
        if self.carry.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.carry);
        if terminated(&pending) {
            self.emit_merged(&pending, handler);
        } else {
            log::warn!(
                "discarding {} carried bytes with the chunk",
                pending.len()
            );
        }
    }

    /// Re-parse a reconstructed byte run (carry + continuation) and emit
    /// its records. A trailing span without a record terminator belongs
    /// to a record that is still unfinished and goes back into the
    /// carry buffer.
    fn emit_merged<H: RecordHandler>(
        &mut self,
        merged: &[u8],
        handler: &mut H,
    ) {
        let complete = terminated(merged);
        let mut reader = record_reader(merged, self.config.delimiter);
        let mut record = StringRecord::new();

        loop {
            let last_offset = reader.position().byte() as usize;
            let got = match reader.read_record(&mut record) {
                Ok(got) => got,
                Err(e) => {
                    self.stats.parse_errors += 1;
                    log::error!("reassembled record failed to parse: {}", e);
                    return;
                }
            };
            if !got {
                return;
            }

            let buf_offset = reader.position().byte() as usize;
            if buf_offset == merged.len() && !complete {
                self.carry = merged[last_offset..].to_vec();
                log::trace!(
                    "reassembled record still dangling, carrying {} bytes",
                    self.carry.len()
                );
                return;
            }

            self.emit(&record, handler);
        }
    }

    fn emit<H: RecordHandler>(
        &mut self,
        record: &StringRecord,
        handler: &mut H,
    ) {
        let fields: Vec<String> =
            record.iter().map(str::to_string).collect();
        self.stats.records += 1;

        if let Err(e) = handler.handle(fields) {
            self.stats.handler_errors += 1;
            log::error!(
                "record handler failed on record {}: {}",
                self.stats.records,
                e
            );
        }
    }
}

/// True if the byte run ends on a record terminator (`\n`, `\r\n` or a
/// bare `\r`, matching the parser's terminator handling).
fn terminated(bytes: &[u8]) -> bool {
    matches!(bytes.last(), Some(b'\n') | Some(b'\r'))
}

/// Bounded-input parser over exactly one byte run.
///
/// The format is flat single-character-delimited text: ragged field
/// counts are permitted and quoting is not interpreted.
fn record_reader(bytes: &[u8], delimiter: u8) -> Reader<&[u8]> {
    ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .from_reader(bytes)
}
