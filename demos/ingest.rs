//! Stream a delimited file chunk by chunk and print every reassembled
//! record.
//!
//! ```text
//! cargo run --example ingest -- data/agents.csv '|'
//! ```

use record_stream::{stream_records, FileSource, Result, StreamConfig};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .expect("usage: ingest <file> [delimiter]");
    let delimiter = args
        .next()
        .map(|d| d.bytes().next().expect("delimiter must be one byte"))
        .unwrap_or(b'|');

    let config = StreamConfig::default().delimiter(delimiter);
    let source = FileSource::open(&path)?;

    let mut handler = |record: Vec<String>| -> Result<()> {
        println!("{}", record.join("\t"));
        Ok(())
    };
    let stats = stream_records(
        source,
        config,
        &mut handler,
        CancellationToken::new(),
    )
    .await?;

    eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
