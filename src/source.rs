use std::fs::File;
use std::path::Path;

use crate::errors::Result;

/// A positional-read capability over an arbitrary byte source.
///
/// `read_at` fills `buf` starting at `offset` and reports how many bytes
/// were read together with whether the source is exhausted. Local files
/// and remote objects satisfy the same contract; the streaming pipeline
/// is indifferent to which one it is given.
pub trait ByteSource {
    /// Read up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns `(bytes_read, end_of_stream)`. An implementation may
    /// report end of stream together with the final bytes, or on a
    /// following zero-byte read; both shapes are handled by the chunk
    /// source.
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(usize, bool)>;
}

/// Local file satisfying the positional-read contract.
pub struct FileSource {
    file: File,
}

impl FileSource {
    /// Open the file at `path` for positional reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        log::debug!("opening file source {}", path.as_ref().display());

        let file = File::open(path.as_ref())?;
        Ok(Self { file })
    }
}

impl From<File> for FileSource {
    fn from(file: File) -> Self {
        Self { file }
    }
}

impl ByteSource for FileSource {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(usize, bool)> {
        #[cfg(unix)]
        let read = std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)?;
        #[cfg(windows)]
        let read =
            std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)?;

        // A positional read past the end of a file yields zero bytes.
        Ok((read, read == 0))
    }
}

/// In-memory byte source.
///
/// Reports end of stream together with the final bytes, so the last
/// window and the termination signal arrive in a single read.
pub struct BytesSource {
    data: Vec<u8>,
}

impl BytesSource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { data: data.into() }
    }
}

impl ByteSource for BytesSource {
    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(usize, bool)> {
        if offset >= self.data.len() as u64 {
            return Ok((0, true));
        }

        let start = offset as usize;
        let end = usize::min(start + buf.len(), self.data.len());
        buf[..end - start].copy_from_slice(&self.data[start..end]);

        Ok((end - start, end == self.data.len()))
    }
}
