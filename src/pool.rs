//! The file-pool abstraction (C1): positional reads against a set of opened
//! extent files addressed by a small integer handle.
//!
//! The read engine never opens files itself once a pool exists; it only asks
//! the pool for sizes and positional reads. [`StdFilePool`] is the default,
//! filesystem-backed implementation used by [`crate::Handle::open`].

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// A collaborator that owns a set of opened extent files and serves
/// positional reads against them by integer handle.
///
/// Handle IDs are assigned by the pool at open time and must remain stable
/// for the pool's lifetime; the core never assumes a particular ordering.
pub trait FilePool {
    /// Size in bytes of the file behind `handle`.
    fn size(&self, handle: u32) -> Result<u64>;

    /// Reads `buf.len()` bytes starting at `offset` into `buf`. A short read
    /// (fewer bytes available than requested) is an error, not a partial
    /// success, matching the file-pool contract.
    fn read_at(&mut self, handle: u32, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Whether `handle` still refers to an open file.
    fn is_open(&self, handle: u32) -> bool;
}

/// Default [`FilePool`] backed by plain [`std::fs::File`] handles opened
/// from the local filesystem.
pub struct StdFilePool {
    files: Vec<File>,
    paths: Vec<PathBuf>,
}

impl StdFilePool {
    /// An empty pool; extent files are added with [`StdFilePool::open`].
    pub fn new() -> Self {
        Self {
            files: Vec::new(),
            paths: Vec::new(),
        }
    }

    /// Opens `path` read-only and returns its newly assigned handle.
    pub fn open(&mut self, path: impl AsRef<Path>) -> Result<u32> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        self.files.push(file);
        self.paths.push(path.to_path_buf());
        Ok((self.files.len() - 1) as u32)
    }

    /// Number of files currently registered.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn file_mut(&mut self, handle: u32) -> Result<&mut File> {
        self.files
            .get_mut(handle as usize)
            .ok_or_else(|| Error::unsupported_format(format!("unknown file handle {handle}")))
    }
}

impl Default for StdFilePool {
    fn default() -> Self {
        Self::new()
    }
}

impl FilePool for StdFilePool {
    fn size(&self, handle: u32) -> Result<u64> {
        let file = self
            .files
            .get(handle as usize)
            .ok_or_else(|| Error::unsupported_format(format!("unknown file handle {handle}")))?;
        let path = &self.paths[handle as usize];
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| Error::io(e, path.clone()))
    }

    fn read_at(&mut self, handle: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        let path = self.paths.get(handle as usize).cloned();
        let file = self.file_mut(handle)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| match &path {
                Some(p) => Error::io(e, p.clone()),
                None => Error::io_simple(e),
            })?;
        file.read_exact(buf).map_err(|e| match &path {
            Some(p) => Error::io(e, p.clone()),
            None => Error::io_simple(e),
        })
    }

    fn is_open(&self, handle: u32) -> bool {
        (handle as usize) < self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_open_and_read_at() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"0123456789").unwrap();
        tmp.flush().unwrap();

        let mut pool = StdFilePool::new();
        let handle = pool.open(tmp.path()).unwrap();
        assert_eq!(pool.size(handle).unwrap(), 10);

        let mut buf = [0u8; 4];
        pool.read_at(handle, 3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");
        assert!(pool.is_open(handle));
        assert!(!pool.is_open(handle + 1));
    }

    #[test]
    fn test_short_read_is_error() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"abc").unwrap();
        tmp.flush().unwrap();

        let mut pool = StdFilePool::new();
        let handle = pool.open(tmp.path()).unwrap();
        let mut buf = [0u8; 10];
        assert!(pool.read_at(handle, 0, &mut buf).is_err());
    }
}
