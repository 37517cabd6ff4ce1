use std::str::Utf8Error;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StreamError>;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Record parse error: {0}")]
    Parse(String),
    #[error("Conduit error: {0}")]
    Channel(String),
    #[error("Run cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<Utf8Error> for StreamError {
    fn from(e: Utf8Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<csv::Error> for StreamError {
    fn from(e: csv::Error) -> Self {
        Self::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}
