//! Leaf storages: a heap buffer and a host file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use super::{Storage, check_range};
use crate::Result;
use crate::utils::to_usize;

/// A storage backed by a `Vec<u8>`.
///
/// Reads and writes must stay inside the current size; use
/// [`Storage::set_size`] to grow it.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Vec<u8>,
}

impl MemoryStorage {
    /// A zero-filled storage of `size` bytes.
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    /// Wrap existing bytes.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Borrow the raw bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutably borrow the raw bytes, bypassing every layer above.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consume the storage, returning its bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Storage for MemoryStorage {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.data.len() as u64)?;
        let start = to_usize(offset)?;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.data.len() as u64)?;
        let start = to_usize(offset)?;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        self.data.resize(to_usize(size)?, 0);
        Ok(())
    }
}

/// A storage backed by a host file.
#[derive(Debug)]
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    /// Open an existing container, read-only or read-write.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Ok(Self { file })
    }

    /// Create (or truncate) a container file.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    /// Wrap an already opened file.
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    /// Consume the storage, returning the file.
    pub fn into_inner(self) -> File {
        self.file
    }
}

impl Storage for FileStorage {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.size()?)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.size()?)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        self.file.set_len(size)?;
        Ok(())
    }
}
