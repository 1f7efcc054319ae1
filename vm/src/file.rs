//! Files that back segment and mapped pages.

use crate::sync::Mutex;
use alloc::{sync::Arc, vec::Vec};
use core::error::Error;
use core::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    /// The file ended before the requested bytes were read.
    ShortRead,
    /// The file accepted fewer bytes than were written.
    ShortWrite,
    /// The underlying storage failed.
    Io,
}

impl Display for FileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FileError::ShortRead => write!(f, "file ended before the page was filled"),
            FileError::ShortWrite => write!(f, "file accepted fewer bytes than written"),
            FileError::Io => write!(f, "file i/o error"),
        }
    }
}

impl Error for FileError {}

pub type Result<T> = core::result::Result<T, FileError>;

/// An open file the memory manager can read pages from and write pages back to.
pub trait VmFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`, returning how many were read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes `buf` at `offset`, returning how many bytes were written.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;

    /// Current length of the file in bytes.
    fn length(&self) -> u64;

    /// Opens an independent handle to the same file.
    fn reopen(&self) -> Result<Arc<dyn VmFile>>;
}

/// Reads exactly `buf.len()` bytes at `offset`.
pub fn read_exact_at(file: &dyn VmFile, offset: u64, buf: &mut [u8]) -> Result<()> {
    if file.read_at(offset, buf)? != buf.len() {
        return Err(FileError::ShortRead);
    }
    Ok(())
}

/// Writes all of `buf` at `offset`.
pub fn write_all_at(file: &dyn VmFile, offset: u64, buf: &[u8]) -> Result<()> {
    if file.write_at(offset, buf)? != buf.len() {
        return Err(FileError::ShortWrite);
    }
    Ok(())
}

/// A file whose contents live in memory. Reopened handles share the contents.
#[derive(Clone, Default)]
pub struct MemFile {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemFile {
    pub fn new(contents: &[u8]) -> Self {
        Self {
            data: Arc::new(Mutex::new(contents.to_vec())),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

#[allow(clippy::cast_possible_truncation)]
impl VmFile for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.lock();
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut data = self.data.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn length(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn reopen(&self) -> Result<Arc<dyn VmFile>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_past_end_is_short() {
        let file = MemFile::new(b"hello");
        let mut buf = [0; 8];
        assert_eq!(file.read_at(2, &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"llo");
        assert_eq!(read_exact_at(&file, 0, &mut buf), Err(FileError::ShortRead));
    }

    #[test]
    fn write_extends_file() {
        let file = MemFile::new(b"ab");
        write_all_at(&file, 4, b"cd").unwrap();
        assert_eq!(file.contents(), b"ab\0\0cd");
        assert_eq!(file.length(), 6);
    }

    #[test]
    fn reopened_handle_shares_contents() {
        let file = MemFile::new(b"xyz");
        let other = file.reopen().unwrap();
        write_all_at(&*other, 0, b"X").unwrap();
        assert_eq!(file.contents(), b"Xyz");
    }
}
