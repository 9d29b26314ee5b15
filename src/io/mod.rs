//! File sinks the table builder writes through.
//!
//! The builder only needs append/flush/sync; everything else about file
//! lifecycle (naming, renames, directory syncs) belongs to the layers above.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;

/// Append-only byte sink.
pub trait WritableFile: Send {
    fn append(&mut self, data: &[u8]) -> Result<()>;

    /// Pushes buffered bytes to the OS.
    fn flush(&mut self) -> Result<()>;

    /// Makes appended bytes durable.
    fn sync(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

const WRITE_BUFFER_BYTES: usize = 64 * 1024;

/// Buffered filesystem sink.
pub struct FsWritableFile {
    file: File,
    buf: Vec<u8>,
}

impl FsWritableFile {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(FsWritableFile {
            file,
            buf: Vec::with_capacity(WRITE_BUFFER_BYTES),
        })
    }
}

impl WritableFile for FsWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        if self.buf.len() + data.len() <= WRITE_BUFFER_BYTES {
            self.buf.extend_from_slice(data);
            return Ok(());
        }
        self.flush()?;
        if data.len() <= WRITE_BUFFER_BYTES {
            self.buf.extend_from_slice(data);
        } else {
            self.file.write_all(data)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.file.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

/// In-memory sink whose contents stay readable through a shared handle
/// after the writer is consumed. Used by tests and table tooling.
#[derive(Default)]
pub struct MemWritableFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemWritableFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle to the accumulated bytes.
    pub fn contents(&self) -> Arc<Mutex<Vec<u8>>> {
        self.data.clone()
    }
}

impl WritableFile for MemWritableFile {
    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.data.lock().extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn fs_file_buffers_and_flushes() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("out.bin");

        let mut file = FsWritableFile::create(&path)?;
        file.append(b"hello ")?;
        file.append(b"world")?;
        // Large append bypasses the buffer after draining it.
        let big = vec![0xabu8; WRITE_BUFFER_BYTES + 1];
        file.append(&big)?;
        file.sync()?;
        file.close()?;

        let mut contents = Vec::new();
        File::open(&path)?.read_to_end(&mut contents)?;
        assert_eq!(&contents[..11], b"hello world");
        assert_eq!(contents.len(), 11 + big.len());
        assert!(contents[11..].iter().all(|&b| b == 0xab));
        Ok(())
    }

    #[test]
    fn mem_file_outlives_writer() {
        let file = MemWritableFile::new();
        let contents = file.contents();
        let mut file: Box<dyn WritableFile> = Box::new(file);
        file.append(b"abc").unwrap();
        file.append(b"def").unwrap();
        drop(file);
        assert_eq!(contents.lock().as_slice(), b"abcdef");
    }
}
