use std::{fs, io::BufReader, path::Path};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StreamError};

/// Default read-window size in bytes. A few hundred bytes keeps several
/// records per chunk for typical delimited data; any positive size is
/// valid and only affects throughput.
pub const DEFAULT_BUFFER_SIZE: usize = 400;

/// Default field delimiter.
pub const DEFAULT_DELIMITER: u8 = b'|';

/// Configuration for one streaming run.
///
/// All knobs are passed explicitly; the pipeline keeps no ambient state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Fixed read-window size in bytes; must be positive.
    pub buffer_size: usize,
    /// Single-byte field delimiter separating fields within a record.
    pub delimiter: u8,
    /// Expected number of fields per record, if known.
    ///
    /// Only used to flag deferred boundary records that look truncated;
    /// it never changes how records are reassembled.
    pub expected_fields: Option<usize>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            delimiter: DEFAULT_DELIMITER,
            expected_fields: None,
        }
    }
}

impl StreamConfig {
    /// Sets the read-window size in bytes.
    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    /// Sets the field delimiter.
    pub fn delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Sets the expected field count used to flag suspicious boundary
    /// records in the logs.
    pub fn expected_fields(mut self, fields: usize) -> Self {
        self.expected_fields = Some(fields);
        self
    }

    /// Load a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        log::debug!(
            "loading stream config from {}",
            path.as_ref().display()
        );

        let file = fs::File::open(path.as_ref())?;
        let reader = BufReader::new(file);
        let config: StreamConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(StreamError::Config(
                "buffer size must be positive".to_owned(),
            ));
        }
        if self.delimiter == b'\n' || self.delimiter == b'\r' {
            return Err(StreamError::Config(
                "delimiter collides with the record terminator".to_owned(),
            ));
        }
        Ok(())
    }
}
