//! The streaming-storage abstraction every layer implements and consumes.
//!
//! A save container is a stack of storage transforms. Each transform is a
//! struct that owns (or exclusively borrows) the storage it wraps and
//! implements [`Storage`] itself, so layers compose by plain nesting:
//!
//! ```text
//! SectorStorage<HierarchicalIntegrityVerificationStorage<JournalStorage<..>>>
//! ```
//!
//! Where one storage genuinely feeds several consumers (the container file
//! under the header and both remap tables, for example) it is wrapped in a
//! [`SharedStorage`] and carved into [`SubStorage`] windows.
//!
//! ## Layers
//!
//! | Module | Layer |
//! |--------|-------|
//! | [`memory`]    | Leaf storages: in-memory buffer and host file |
//! | [`sub`]       | Windows into a storage and the shared handle |
//! | [`sector`]    | Sector-alignment guard |
//! | [`duplex`]    | A/B redundant copies selected by a bitmap |
//! | [`remap`]     | Virtual-to-physical extent translation |
//! | [`journal`]   | Shadow-block journaling with commit/rollback |
//! | [`integrity`] | SHA-256 hash tree verification |

pub mod duplex;
pub mod integrity;
pub mod journal;
pub mod memory;
pub mod remap;
pub mod sector;
pub mod sub;

pub use duplex::{DuplexStorage, HierarchicalDuplexStorage};
pub use integrity::{
    HierarchicalIntegrityVerificationStorage, IntegrityCheckLevel, IntegrityLevelInfo, Validity,
};
pub use journal::{BlockMapping, JournalStorage};
pub use memory::{FileStorage, MemoryStorage};
pub use remap::{RemapEntry, RemapStorage};
pub use sector::SectorStorage;
pub use sub::{SharedStorage, SubStorage};

use crate::{Error, Result};

/// A byte-addressable storage.
///
/// Reads and writes either transfer the whole buffer or fail; there are no
/// short transfers.
pub trait Storage {
    /// Fill `buf` with the bytes starting at `offset`.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` starting at `offset`.
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Push buffered writes down to the underlying storage.
    fn flush(&mut self) -> Result<()>;

    /// Current size in bytes.
    fn size(&self) -> Result<u64>;

    /// Grow or shrink the storage.
    fn set_size(&mut self, size: u64) -> Result<()>;
}

/// Type-erased storage used where the concrete stack is chosen at runtime.
pub type DynStorage = Box<dyn Storage + Send>;

impl<S: Storage + ?Sized> Storage for Box<S> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(offset, buf)
    }
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write(offset, buf)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
    fn size(&self) -> Result<u64> {
        (**self).size()
    }
    fn set_size(&mut self, size: u64) -> Result<()> {
        (**self).set_size(size)
    }
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read(offset, buf)
    }
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write(offset, buf)
    }
    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
    fn size(&self) -> Result<u64> {
        (**self).size()
    }
    fn set_size(&mut self, size: u64) -> Result<()> {
        (**self).set_size(size)
    }
}

/// Check that `[offset, offset + len)` lies inside a storage of `size` bytes.
#[inline]
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> Result<()> {
    let end = offset.checked_add(len as u64).ok_or(Error::InvalidRange)?;
    if end > size {
        return Err(Error::InvalidRange);
    }
    Ok(())
}

/// Read `len` bytes at `offset` into a new buffer.
pub fn read_vec<S: Storage + ?Sized>(storage: &mut S, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    storage.read(offset, &mut buf)?;
    Ok(buf)
}

/// Size of the scratch buffer used by [`fill_zero`] and [`copy_to`].
const COPY_CHUNK: usize = 0x4000;

/// Overwrite `[offset, offset + len)` with zeros.
pub fn fill_zero<S: Storage + ?Sized>(storage: &mut S, offset: u64, len: u64) -> Result<()> {
    let zeros = vec![0u8; COPY_CHUNK];
    let mut done = 0u64;
    while done < len {
        let n = (len - done).min(COPY_CHUNK as u64) as usize;
        storage.write(offset + done, &zeros[..n])?;
        done += n as u64;
    }
    Ok(())
}

/// Stream the whole of `src` into `dst` starting at offset 0.
///
/// `progress` is called after every chunk with `(bytes_done, bytes_total)`.
pub fn copy_to<S, D>(src: &mut S, dst: &mut D, mut progress: impl FnMut(u64, u64)) -> Result<()>
where
    S: Storage + ?Sized,
    D: Storage + ?Sized,
{
    let total = src.size()?;
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut done = 0u64;
    while done < total {
        let n = (total - done).min(COPY_CHUNK as u64) as usize;
        src.read(done, &mut buf[..n])?;
        dst.write(done, &buf[..n])?;
        done += n as u64;
        progress(done, total);
    }
    Ok(())
}
