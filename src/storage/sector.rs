//! Sector-alignment guard.
//!
//! Every access must start on a sector boundary; the length is free. The
//! layer adds no buffering - it exists so that the layers above can rely on
//! block-aligned offsets.

use super::Storage;
use crate::{Error, Result};

/// Storage that rejects accesses not starting on a sector boundary.
#[derive(Debug)]
pub struct SectorStorage<S> {
    inner: S,
    sector_size: u64,
    sector_count: u64,
    len: u64,
}

impl<S: Storage> SectorStorage<S> {
    /// Wrap `inner`, addressing it in units of `sector_size` bytes.
    pub fn new(inner: S, sector_size: u64) -> Result<Self> {
        if sector_size == 0 {
            return Err(Error::Parse("sector size must be non-zero"));
        }
        let len = inner.size()?;
        Ok(Self {
            inner,
            sector_size,
            sector_count: len.div_ceil(sector_size),
            len,
        })
    }

    pub fn sector_size(&self) -> u64 {
        self.sector_size
    }

    /// Number of sectors, counting a trailing partial sector.
    pub fn sector_count(&self) -> u64 {
        self.sector_count
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn validate(&self, offset: u64) -> Result<()> {
        if offset % self.sector_size != 0 {
            return Err(Error::Alignment {
                offset,
                alignment: self.sector_size,
            });
        }
        Ok(())
    }
}

impl<S: Storage> Storage for SectorStorage<S> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.validate(offset)?;
        self.inner.read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.validate(offset)?;
        self.inner.write(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len)
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        self.inner.set_size(size)?;
        self.len = self.inner.size()?;
        self.sector_count = self.len.div_ceil(self.sector_size);
        Ok(())
    }
}
