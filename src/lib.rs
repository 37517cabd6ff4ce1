//! Streaming ingestion of large delimited-text sources.
//!
//! A byte source — a local file or a remote object behind the same
//! positional-read capability — is tiled into fixed-size chunks by a
//! producer, pushed through a single-slot conduit, and reassembled by a
//! consumer into complete records even when a record straddles a chunk
//! boundary. The whole file is never materialized: memory stays bounded
//! by one chunk plus the fragment carried across a boundary.

mod chunk;
mod config;
mod errors;
mod pipeline;
mod reassembly;
mod source;

pub use chunk::{spawn_chunk_source, CONDUIT_CAPACITY};
pub use config::{StreamConfig, DEFAULT_BUFFER_SIZE, DEFAULT_DELIMITER};
pub use errors::{Result, StreamError};
pub use pipeline::stream_records;
pub use reassembly::{RecordAssembler, RecordHandler, StreamStats};
pub use source::{ByteSource, BytesSource, FileSource};
