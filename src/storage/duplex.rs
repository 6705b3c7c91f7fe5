//! Duplex storage - two redundant copies selected block-by-block by a bitmap.
//!
//! ```text
//! bitmap bit n (MSB-first) ── 0 ──▶ block n of copy A is authoritative
//!                          └─ 1 ──▶ block n of copy B is authoritative
//! ```
//!
//! The selection loaded when the storage is opened is the committed one,
//! and the copies it names are never written. The first write to a block
//! after that stages the new contents in the other copy and only then
//! flips the block's bit; later writes to the same block land in place in
//! the staged copy. Until the flip lands a reader still sees the old
//! block, after it the new one, so a crash can only ever expose one of
//! those two states. [`commit`](DuplexStorage::commit) makes the current
//! selection the committed one and [`rollback`](DuplexStorage::rollback)
//! returns to it.
//!
//! The bitmap itself lives in a storage, which may be another duplex
//! storage: the save container uses a small master bitmap in the header to
//! protect a level-1 bitmap, which in turn protects the metadata region
//! ([`HierarchicalDuplexStorage`]).

use bitvec::prelude::*;
use log::trace;

use super::{Storage, check_range, read_vec};
use crate::utils::to_usize;
use crate::{Error, Result};

type Bitmap = BitVec<u8, Msb0>;

/// A/B redundant storage.
#[derive(Debug)]
pub struct DuplexStorage<B, D> {
    bitmap: B,
    copies: [D; 2],
    block_size: u64,
    len: u64,
    committed: Bitmap,
    current: Bitmap,
}

/// Two duplex levels: a master bitmap protecting the level-1 bitmap, which
/// protects the data copies.
pub type HierarchicalDuplexStorage<M, S> = DuplexStorage<DuplexStorage<M, S>, S>;

impl<B: Storage, D: Storage> DuplexStorage<B, D> {
    /// Combine a selection bitmap with the two copies.
    pub fn new(mut bitmap: B, copy_a: D, copy_b: D, block_size: u64) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::Parse("duplex block size must be non-zero"));
        }
        let len = copy_a.size()?;
        if copy_b.size()? != len {
            return Err(Error::Corrupted("duplex copies differ in size"));
        }
        let blocks = to_usize(len.div_ceil(block_size))?;
        if bitmap.size()? * 8 < blocks as u64 {
            return Err(Error::Corrupted("duplex bitmap too small for data"));
        }
        let mut current = Bitmap::from_vec(read_vec(&mut bitmap, 0, blocks.div_ceil(8))?);
        current.truncate(blocks);
        Ok(Self {
            bitmap,
            copies: [copy_a, copy_b],
            block_size,
            len,
            committed: current.clone(),
            current,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Index (0 = A, 1 = B) of the authoritative copy of `block`.
    pub fn active_copy(&self, block: u64) -> Result<usize> {
        let block = to_usize(block)?;
        self.current
            .get(block)
            .map(|bit| usize::from(*bit))
            .ok_or(Error::InvalidRange)
    }

    /// Whether any block was staged since the last commit or rollback.
    pub fn has_staged_blocks(&self) -> bool {
        self.current != self.committed
    }

    /// Make the current selection the committed one. Copies the previous
    /// selection named become the staging area for the next writes.
    pub fn commit(&mut self) {
        self.committed.clone_from(&self.current);
    }

    /// Return to the committed selection, abandoning every staged block.
    pub fn rollback(&mut self) -> Result<()> {
        self.current.clone_from(&self.committed);
        self.bitmap.write(0, self.current.as_raw_slice())
    }

    /// Point `block` at `copy` and persist the byte holding its bit.
    fn select(&mut self, block: usize, copy: usize) -> Result<()> {
        self.current.set(block, copy == 1);
        let byte = block / 8;
        if let Err(e) = self
            .bitmap
            .write(byte as u64, &self.current.as_raw_slice()[byte..byte + 1])
        {
            self.current.set(block, copy != 1);
            return Err(e);
        }
        trace!("duplex: block {block} now served from copy {copy}");
        Ok(())
    }

    /// Yield `(block, offset_in_block, chunk_len)` for every block touched
    /// by `[offset, offset + len)`.
    fn chunks(&self, offset: u64, len: usize) -> impl Iterator<Item = (u64, u64, usize)> + use<B, D> {
        let block_size = self.block_size;
        let end = offset + len as u64;
        let mut pos = offset;
        std::iter::from_fn(move || {
            if pos >= end {
                return None;
            }
            let block = pos / block_size;
            let within = pos % block_size;
            let n = (block_size - within).min(end - pos);
            pos += n;
            Some((block, within, n as usize))
        })
    }

    /// Consume the storage, returning its bitmap and copies.
    pub fn into_parts(self) -> (B, D, D) {
        let [a, b] = self.copies;
        (self.bitmap, a, b)
    }
}

impl<M: Storage, S: Storage> HierarchicalDuplexStorage<M, S> {
    /// Build the master → level-1 → data chain used by save containers.
    #[allow(clippy::too_many_arguments)]
    pub fn hierarchical(
        master_bitmap: M,
        l1_a: S,
        l1_b: S,
        l1_block_size: u64,
        data_a: S,
        data_b: S,
        data_block_size: u64,
    ) -> Result<Self> {
        let level1 = DuplexStorage::new(master_bitmap, l1_a, l1_b, l1_block_size)?;
        DuplexStorage::new(level1, data_a, data_b, data_block_size)
    }

    /// [`commit`](DuplexStorage::commit) both levels.
    pub fn commit_levels(&mut self) {
        self.commit();
        self.bitmap.commit();
    }

    /// [`rollback`](DuplexStorage::rollback) both levels, data level first.
    pub fn rollback_levels(&mut self) -> Result<()> {
        self.rollback()?;
        self.bitmap.rollback()
    }
}

impl<B: Storage, D: Storage> Storage for DuplexStorage<B, D> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let mut done = 0usize;
        for (block, within, n) in self.chunks(offset, buf.len()) {
            let copy = self.active_copy(block)?;
            self.copies[copy].read(block * self.block_size + within, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.len)?;
        let mut done = 0usize;
        for (block, within, n) in self.chunks(offset, buf.len()) {
            let start = block * self.block_size;
            let index = to_usize(block)?;
            let committed = usize::from(self.committed[index]);
            let data = &buf[done..done + n];

            if usize::from(self.current[index]) != committed {
                self.copies[committed ^ 1].write(start + within, data)?;
                done += n;
                continue;
            }

            let block_len = to_usize(self.block_size.min(self.len - start))?;
            let mut staged = vec![0u8; block_len];
            if n != block_len {
                self.copies[committed].read(start, &mut staged)?;
            }
            let within = to_usize(within)?;
            staged[within..within + n].copy_from_slice(data);

            self.copies[committed ^ 1].write(start, &staged)?;
            self.select(index, committed ^ 1)?;
            done += n;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.copies[0].flush()?;
        self.copies[1].flush()?;
        self.bitmap.flush()
    }

    fn size(&self) -> Result<u64> {
        Ok(self.len)
    }

    fn set_size(&mut self, _size: u64) -> Result<()> {
        Err(Error::Unsupported("duplex storage cannot be resized"))
    }
}
