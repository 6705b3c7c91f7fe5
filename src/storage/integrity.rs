//! Hierarchical integrity verification - a SHA-256 hash tree over a storage.
//!
//! ```text
//! level 0   master hash        (stored in the container header)
//! level 1   hashes of level 2 blocks
//! ...
//! level n   data               (hashed in blocks of its block size)
//! ```
//!
//! Hash `j` of level `i - 1` (32 bytes at offset `j * 32`) covers block `j`
//! of level `i`. Computed hashes always have the top bit of their final
//! byte set, so an all-zero stored hash can only mean the block has never
//! been written. Reads of such blocks return zeros without verification;
//! this is what lets a freshly formatted container start out with every
//! level zero-filled.
//!
//! Reads verify every block against the level above, recursively up to the
//! master hash. Writes store the block and then rewrite the covering hash
//! at every level up to the master hash, after which the header signature
//! is stale until the owner re-signs it (see [`master_hash_dirty`]).
//!
//! [`master_hash_dirty`]: HierarchicalIntegrityVerificationStorage::master_hash_dirty

use log::{debug, warn};
use sha2::{Digest, Sha256};

use super::{DynStorage, Storage, check_range};
use crate::utils::to_usize;
use crate::{Error, Result};

/// Size of one stored hash.
pub const HASH_SIZE: u64 = 0x20;

/// How hash mismatches are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntegrityCheckLevel {
    /// Do not verify at all.
    None,
    /// Verify, record [`Validity::Invalid`] and keep going.
    #[default]
    IgnoreOnInvalid,
    /// Verify and fail the read with [`Error::IntegrityMismatch`].
    ErrorOnInvalid,
}

/// Verification state of a level or a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validity {
    /// Nothing in this region has been checked yet.
    #[default]
    Unchecked,
    Valid,
    Invalid,
}

impl Validity {
    /// Short suffix for listings, e.g. `" (GOOD)"`.
    pub fn describe(self) -> &'static str {
        match self {
            Validity::Unchecked => "",
            Validity::Valid => " (GOOD)",
            Validity::Invalid => " (FAIL)",
        }
    }
}

/// Placement of one level of a hash tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntegrityLevelInfo {
    /// Offset of the level inside the storage that holds it.
    pub offset: u64,
    pub size: u64,
    /// Size of the blocks this level is hashed in.
    pub block_size: u64,
}

/// Sizes of the master hash and each hash level needed to cover
/// `data_size` bytes, all levels hashed in `block_size` blocks.
///
/// Returns `hash_levels + 1` sizes: master first, lowest hash level last.
pub fn hash_level_sizes(data_size: u64, block_size: u64, hash_levels: usize) -> Vec<u64> {
    let mut sizes = Vec::with_capacity(hash_levels + 1);
    let mut covered = data_size;
    for _ in 0..=hash_levels {
        covered = covered.div_ceil(block_size).max(1) * HASH_SIZE;
        sizes.push(covered);
    }
    sizes.reverse();
    sizes
}

/// Hash a block the way the tree stores it.
pub fn block_hash(data: &[u8]) -> [u8; 32] {
    let mut hash: [u8; 32] = Sha256::digest(data).into();
    hash[31] |= 0x80;
    hash
}

/// A hash tree over the data storage `D`, verified against a master hash.
///
/// Level 0 is the master hash, levels `1..n` the hash levels and level `n`
/// the data.
pub struct HierarchicalIntegrityVerificationStorage<D = DynStorage> {
    /// Master hash followed by the hash levels, top first.
    levels: Vec<DynStorage>,
    data: D,
    /// `block_sizes[i]` is the block size of level `i`; index 0 is unused.
    block_sizes: Vec<u64>,
    validity: Vec<Validity>,
    check_level: IntegrityCheckLevel,
    master_dirty: bool,
}

impl<D> std::fmt::Debug for HierarchicalIntegrityVerificationStorage<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchicalIntegrityVerificationStorage")
            .field("levels", &(self.levels.len() + 1))
            .field("block_sizes", &self.block_sizes)
            .field("validity", &self.validity)
            .field("check_level", &self.check_level)
            .finish()
    }
}

impl<D: Storage> HierarchicalIntegrityVerificationStorage<D> {
    /// Build a tree from the master hash, the hash levels (top first) and
    /// the data level. `block_sizes` gives the block size of every level
    /// below the master, in the same order.
    pub fn new(
        master: DynStorage,
        hash_levels: Vec<DynStorage>,
        data: D,
        block_sizes: &[u64],
        check_level: IntegrityCheckLevel,
    ) -> Result<Self> {
        let mut levels = Vec::with_capacity(hash_levels.len() + 1);
        levels.push(master);
        levels.extend(hash_levels);

        if block_sizes.len() != levels.len() || block_sizes.iter().any(|&b| b == 0) {
            return Err(Error::Parse("one non-zero block size per level"));
        }
        let mut sizes = vec![0];
        sizes.extend_from_slice(block_sizes);

        let tree = Self {
            validity: vec![Validity::Unchecked; levels.len() + 1],
            levels,
            data,
            block_sizes: sizes,
            check_level,
            master_dirty: false,
        };
        for lv in 1..=tree.data_level() {
            let needed = tree.level_size(lv)?.div_ceil(tree.block_sizes[lv]) * HASH_SIZE;
            if tree.level_size(lv - 1)? < needed {
                return Err(Error::Corrupted("hash level too small for the level below"));
            }
        }

        debug!(
            "integrity: {} levels, data size {:#x}",
            tree.data_level() + 1,
            tree.data.size()?
        );
        Ok(tree)
    }

    /// Number of levels including master and data.
    pub fn level_count(&self) -> usize {
        self.levels.len() + 1
    }

    /// Validity of each level below the master, top first.
    pub fn level_validity(&self) -> &[Validity] {
        &self.validity[1..]
    }

    pub fn check_level(&self) -> IntegrityCheckLevel {
        self.check_level
    }

    pub fn set_check_level(&mut self, check_level: IntegrityCheckLevel) {
        self.check_level = check_level;
    }

    /// Whether a write changed the master hash since the last
    /// [`clear_master_hash_dirty`](Self::clear_master_hash_dirty).
    pub fn master_hash_dirty(&self) -> bool {
        self.master_dirty
    }

    pub fn clear_master_hash_dirty(&mut self) {
        self.master_dirty = false;
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    /// The unverified data level. Writes through it leave the tree stale.
    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    /// Forget every whole data block inside `[offset, offset + len)`: its
    /// stored hash is cleared, so it reads back as zeros until rewritten.
    /// The data level itself is not touched.
    ///
    /// Returns the number of blocks cleared.
    pub fn discard(&mut self, offset: u64, len: u64) -> Result<u64> {
        let lv = self.data_level();
        let size = self.data.size()?;
        let end = offset.checked_add(len).ok_or(Error::InvalidRange)?;
        if end > size {
            return Err(Error::InvalidRange);
        }
        let bs = self.block_sizes[lv];
        let first = offset.div_ceil(bs);
        let last = if end == size { size.div_ceil(bs) } else { end / bs };
        for block in first..last {
            self.write_level(lv - 1, block * HASH_SIZE, &[0; HASH_SIZE as usize])?;
        }
        Ok(last.saturating_sub(first))
    }

    fn data_level(&self) -> usize {
        self.levels.len()
    }

    fn level_size(&self, lv: usize) -> Result<u64> {
        match self.levels.get(lv) {
            Some(level) => level.size(),
            None => self.data.size(),
        }
    }

    fn raw_read(&mut self, lv: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.levels.get_mut(lv) {
            Some(level) => level.read(offset, buf),
            None => self.data.read(offset, buf),
        }
    }

    fn raw_write(&mut self, lv: usize, offset: u64, buf: &[u8]) -> Result<()> {
        match self.levels.get_mut(lv) {
            Some(level) => level.write(offset, buf),
            None => self.data.write(offset, buf),
        }
    }

    fn record(&mut self, lv: usize, ok: bool) {
        let v = &mut self.validity[lv];
        if !ok {
            *v = Validity::Invalid;
        } else if *v == Validity::Unchecked {
            *v = Validity::Valid;
        }
    }

    /// Blocks of level `lv` touched by `[offset, offset + len)`, as
    /// `(block, start, block_len, within, chunk_len)`.
    fn blocks(&self, lv: usize, offset: u64, len: usize) -> Result<Vec<(u64, u64, usize, usize, usize)>> {
        let size = self.level_size(lv)?;
        check_range(offset, len, size)?;
        let bs = self.block_sizes[lv];
        let mut out = Vec::new();
        let mut pos = offset;
        let end = offset + len as u64;
        while pos < end {
            let block = pos / bs;
            let start = block * bs;
            let block_len = bs.min(size - start);
            let within = pos - start;
            let n = (block_len - within).min(end - pos);
            out.push((block, start, to_usize(block_len)?, to_usize(within)?, to_usize(n)?));
            pos += n;
        }
        Ok(out)
    }

    /// Read one whole block of level `lv`, verified.
    ///
    /// Returns `Ok(None)` for a never-written block.
    fn read_block(
        &mut self,
        lv: usize,
        block: u64,
        start: u64,
        block_len: usize,
        mode: IntegrityCheckLevel,
    ) -> Result<Option<Vec<u8>>> {
        let mut data = vec![0u8; block_len];
        if mode == IntegrityCheckLevel::None {
            self.raw_read(lv, start, &mut data)?;
            return Ok(Some(data));
        }

        let mut expected = [0u8; 32];
        self.read_level(lv - 1, block * HASH_SIZE, &mut expected, mode)?;
        if expected == [0u8; 32] {
            return Ok(None);
        }

        self.raw_read(lv, start, &mut data)?;
        let ok = block_hash(&data) == expected;
        self.record(lv, ok);
        if !ok {
            warn!("integrity: level {lv} block {block} does not match its hash");
            if mode == IntegrityCheckLevel::ErrorOnInvalid {
                return Err(Error::IntegrityMismatch { level: lv });
            }
        }
        Ok(Some(data))
    }

    fn read_level(&mut self, lv: usize, offset: u64, buf: &mut [u8], mode: IntegrityCheckLevel) -> Result<()> {
        if lv == 0 {
            return self.raw_read(0, offset, buf);
        }
        let mut done = 0usize;
        for (block, start, block_len, within, n) in self.blocks(lv, offset, buf.len())? {
            let out = &mut buf[done..done + n];
            match self.read_block(lv, block, start, block_len, mode)? {
                Some(data) => out.copy_from_slice(&data[within..within + n]),
                None => out.fill(0),
            }
            done += n;
        }
        Ok(())
    }

    fn write_level(&mut self, lv: usize, offset: u64, buf: &[u8]) -> Result<()> {
        if lv == 0 {
            self.master_dirty = true;
            return self.raw_write(0, offset, buf);
        }
        let mut done = 0usize;
        for (block, start, block_len, within, n) in self.blocks(lv, offset, buf.len())? {
            let mut data = if n == block_len {
                vec![0u8; block_len]
            } else {
                self.read_block(lv, block, start, block_len, self.check_level)?
                    .unwrap_or_else(|| vec![0u8; block_len])
            };
            data[within..within + n].copy_from_slice(&buf[done..done + n]);

            self.raw_write(lv, start, &data)?;
            self.write_level(lv - 1, block * HASH_SIZE, &block_hash(&data))?;
            done += n;
        }
        Ok(())
    }

    /// Check every written block of every level, without failing on
    /// mismatches. Returns the validity of each level below the master.
    pub fn verify_all(&mut self) -> Result<Vec<Validity>> {
        self.validity.iter_mut().for_each(|v| *v = Validity::Unchecked);
        for lv in 1..=self.data_level() {
            let size = self.level_size(lv)?;
            let bs = self.block_sizes[lv];
            for block in 0..size.div_ceil(bs) {
                let start = block * bs;
                let block_len = to_usize(bs.min(size - start))?;
                self.read_block(lv, block, start, block_len, IntegrityCheckLevel::IgnoreOnInvalid)?;
            }
            if self.validity[lv] == Validity::Unchecked {
                self.validity[lv] = Validity::Valid;
            }
        }
        Ok(self.level_validity().to_vec())
    }

    /// Consume the tree, returning its hash level storages (master first)
    /// and the data level.
    pub fn into_parts(self) -> (Vec<DynStorage>, D) {
        (self.levels, self.data)
    }
}

impl<D: Storage> Storage for HierarchicalIntegrityVerificationStorage<D> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data_level();
        self.read_level(data, offset, buf, self.check_level)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let data = self.data_level();
        self.write_level(data, offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        for level in &mut self.levels {
            level.flush()?;
        }
        self.data.flush()
    }

    fn size(&self) -> Result<u64> {
        self.data.size()
    }

    fn set_size(&mut self, _size: u64) -> Result<()> {
        Err(Error::Unsupported("hash trees cannot be resized"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, SharedStorage};

    const BS: u64 = 0x100;
    const DATA: u64 = 0x2000;

    struct Tree {
        disk: SharedStorage<MemoryStorage>,
        offsets: Vec<u64>,
        sizes: Vec<u64>,
    }

    // master, L1, L2, L3 hash levels followed by the data, packed back to back.
    fn tree() -> Tree {
        let mut sizes = hash_level_sizes(DATA, BS, 3);
        sizes.push(DATA);
        let mut offsets = Vec::new();
        let mut pos = 0;
        for s in &sizes {
            offsets.push(pos);
            pos += s;
        }
        Tree {
            disk: SharedStorage::new(MemoryStorage::new(pos as usize)),
            offsets,
            sizes,
        }
    }

    impl Tree {
        fn open(&self, check: IntegrityCheckLevel) -> HierarchicalIntegrityVerificationStorage {
            let slice = |i: usize| -> DynStorage {
                Box::new(self.disk.slice(self.offsets[i], self.sizes[i]).unwrap())
            };
            HierarchicalIntegrityVerificationStorage::new(
                slice(0),
                vec![slice(1), slice(2), slice(3)],
                slice(4),
                &[BS; 4],
                check,
            )
            .unwrap()
        }

        fn data_offset(&self) -> u64 {
            self.offsets[4]
        }
    }

    #[test]
    fn level_sizes_shrink_to_one_hash() {
        let sizes = hash_level_sizes(DATA, BS, 3);
        assert_eq!(sizes, vec![0x20, 0x20, 0x40, 0x400]);
    }

    #[test]
    fn unwritten_blocks_read_as_zero() {
        let t = tree();
        let mut ivfc = t.open(IntegrityCheckLevel::ErrorOnInvalid);
        let mut buf = [0xFFu8; 0x10];
        ivfc.read(0x180, &mut buf).unwrap();
        assert_eq!(buf, [0; 0x10]);
        assert_eq!(ivfc.level_validity(), &[Validity::Unchecked; 4]);
    }

    #[test]
    fn write_then_strict_read_succeeds() {
        let t = tree();
        let mut ivfc = t.open(IntegrityCheckLevel::ErrorOnInvalid);
        ivfc.write(0x110, &[0x5A; 0x20]).unwrap();
        assert!(ivfc.master_hash_dirty());

        let mut buf = [0u8; 0x30];
        ivfc.read(0x100, &mut buf).unwrap();
        assert_eq!(&buf[..0x10], &[0; 0x10]);
        assert_eq!(&buf[0x10..], &[0x5A; 0x20]);
        assert_eq!(ivfc.level_validity()[3], Validity::Valid);

        // A fresh instance sees the same tree.
        let mut reopened = t.open(IntegrityCheckLevel::ErrorOnInvalid);
        reopened.read(0x100, &mut buf).unwrap();
        assert_eq!(reopened.verify_all().unwrap(), vec![Validity::Valid; 4]);
    }

    #[test]
    fn tampered_data_fails_strict_read() {
        let t = tree();
        t.open(IntegrityCheckLevel::ErrorOnInvalid)
            .write(0x200, &[1; 0x100])
            .unwrap();
        let at = (t.data_offset() + 0x2FF) as usize;
        t.disk.lock().as_mut_slice()[at] ^= 0x01;

        let mut strict = t.open(IntegrityCheckLevel::ErrorOnInvalid);
        let mut buf = [0u8; 0x10];
        assert!(matches!(
            strict.read(0x200, &mut buf),
            Err(Error::IntegrityMismatch { level: 4 })
        ));
        // Other blocks are unaffected.
        strict.read(0x300, &mut buf).unwrap();

        let mut lenient = t.open(IntegrityCheckLevel::IgnoreOnInvalid);
        lenient.read(0x200, &mut buf).unwrap();
        assert_eq!(buf, [1; 0x10]);
        assert_eq!(lenient.level_validity()[3], Validity::Invalid);

        let report = lenient.verify_all().unwrap();
        assert_eq!(report[..3], [Validity::Valid; 3]);
        assert_eq!(report[3], Validity::Invalid);
    }

    #[test]
    fn tampered_hash_level_is_reported_at_its_level() {
        let t = tree();
        t.open(IntegrityCheckLevel::ErrorOnInvalid)
            .write(0, &[9; 0x40])
            .unwrap();
        // First hash in L2.
        let at = t.offsets[2] as usize;
        t.disk.lock().as_mut_slice()[at] ^= 0x80;

        let mut strict = t.open(IntegrityCheckLevel::ErrorOnInvalid);
        let mut buf = [0u8; 0x40];
        assert!(matches!(
            strict.read(0, &mut buf),
            Err(Error::IntegrityMismatch { level: 2 })
        ));
    }

    #[test]
    fn discarded_blocks_read_as_zero_until_rewritten() {
        let t = tree();
        let mut ivfc = t.open(IntegrityCheckLevel::ErrorOnInvalid);
        ivfc.write(0, &[3; 0x400]).unwrap();
        // Only the whole blocks 1 and 2 fall inside the range.
        assert_eq!(ivfc.discard(0x80, 0x280).unwrap(), 2);

        let mut buf = [0xFFu8; 0x400];
        ivfc.read(0, &mut buf).unwrap();
        assert_eq!(&buf[..0x100], &[3; 0x100]);
        assert_eq!(&buf[0x100..0x300], &[0; 0x200]);
        assert_eq!(&buf[0x300..], &[3; 0x100]);
        // The data level still holds the old bytes.
        let at = (t.data_offset() + 0x100) as usize;
        assert_eq!(t.disk.lock().as_slice()[at], 3);

        ivfc.write(0x140, &[4; 4]).unwrap();
        ivfc.read(0x100, &mut buf[..0x100]).unwrap();
        assert_eq!(&buf[..0x40], &[0; 0x40]);
        assert_eq!(&buf[0x40..0x44], &[4; 4]);
        assert_eq!(t.open(IntegrityCheckLevel::ErrorOnInvalid).verify_all().unwrap(), vec![Validity::Valid; 4]);
    }

    #[test]
    fn unchecked_mode_skips_hashes() {
        let t = tree();
        let at = (t.data_offset() + 4) as usize;
        t.disk.lock().as_mut_slice()[at] = 0x77;
        let mut raw = t.open(IntegrityCheckLevel::None);
        let mut buf = [0u8; 8];
        raw.read(0, &mut buf).unwrap();
        assert_eq!(buf[4], 0x77);
    }
}
