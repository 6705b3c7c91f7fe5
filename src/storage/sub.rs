//! Windows into a storage, and the shared handle that lets several windows
//! sit on one storage.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::{Storage, check_range};
use crate::{Error, Result};

/// A fixed window `[offset, offset + len)` of another storage.
#[derive(Debug, Clone)]
pub struct SubStorage<S> {
    inner: S,
    offset: u64,
    len: u64,
}

impl<S: Storage> SubStorage<S> {
    /// Create a window; fails if it does not fit inside `inner`.
    pub fn new(inner: S, offset: u64, len: u64) -> Result<Self> {
        let end = offset.checked_add(len).ok_or(Error::InvalidRange)?;
        if end > inner.size()? {
            return Err(Error::InvalidRange);
        }
        Ok(Self { inner, offset, len })
    }

    /// Start of the window inside the wrapped storage.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Consume the window, returning the wrapped storage.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Storage> Storage for SubStorage<S> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.inner.read(self.offset + offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.inner.write(self.offset + offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len)
    }

    fn set_size(&mut self, _size: u64) -> Result<()> {
        Err(Error::Unsupported("sub-storage windows have a fixed size"))
    }
}

/// A cloneable handle to one storage.
///
/// Every clone refers to the same storage; each call takes the lock for its
/// duration only. The save stack is single-threaded, so the lock only
/// serialises the handles owned by one [`crate::save::SaveDataFileSystem`].
pub struct SharedStorage<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedStorage<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Storage> SharedStorage<S> {
    /// Put `storage` behind a shared handle.
    pub fn new(storage: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(storage)),
        }
    }

    /// Lock the storage for direct access.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock()
    }

    /// A window `[offset, offset + len)` over this storage.
    pub fn slice(&self, offset: u64, len: u64) -> Result<SubStorage<Self>> {
        SubStorage::new(self.clone(), offset, len)
    }

    /// Recover the storage once every other handle has been dropped.
    pub fn try_unwrap(self) -> std::result::Result<S, Self> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|inner| Self { inner })
    }
}

impl<S: Storage> Storage for SharedStorage<S> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.lock().read(offset, buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.inner.lock().write(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.lock().flush()
    }

    fn size(&self) -> Result<u64> {
        self.inner.lock().size()
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        self.inner.lock().set_size(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn windows_share_the_same_bytes() {
        let shared = SharedStorage::new(MemoryStorage::new(64));
        let mut a = shared.slice(0, 32).unwrap();
        let mut b = shared.slice(16, 32).unwrap();

        a.write(20, &[7; 4]).unwrap();
        let mut buf = [0u8; 4];
        b.read(4, &mut buf).unwrap();
        assert_eq!(buf, [7; 4]);

        assert!(matches!(b.read(30, &mut buf), Err(Error::InvalidRange)));
        assert!(shared.slice(48, 32).is_err());
    }

    #[test]
    fn unwrap_after_handles_drop() {
        let shared = SharedStorage::new(MemoryStorage::new(8));
        let window = shared.slice(0, 8).unwrap();
        let shared = shared.try_unwrap().unwrap_err();
        drop(window);
        assert_eq!(shared.try_unwrap().ok().unwrap().size().unwrap(), 8);
    }
}
