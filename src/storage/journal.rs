//! Journal storage - copy-on-write staging of block writes with atomic
//! commit and rollback.
//!
//! The base storage holds `main + journal` physical blocks. Virtual block
//! `v` is served by the physical block its map entry names. The first write
//! to a block after a commit goes to a fresh physical block (the shadow);
//! the committed block stays untouched until [`commit`] releases it, or is
//! reinstated by [`rollback`].
//!
//! ## Header (0x40 bytes)
//! ```text
//! [0x00] Magic "JNGL"            (4 bytes)
//! [0x04] Version                 (u32 LE)
//! [0x08] VirtualSize             (u64 LE) - main blocks * block size
//! [0x10] JournalSize             (u64 LE) - journal blocks * block size
//! [0x18] BlockSize               (u64 LE)
//! [0x20] MainBlockCount          (u32 LE)
//! [0x24] JournalBlockCount       (u32 LE)
//! [0x28] Reserved                (0x18 bytes)
//! ```
//!
//! ## Map entry (8 bytes, one per virtual block)
//! ```text
//! [0x00] Committed physical block (bits 0..30), bit 31 set when shadowed
//! [0x04] Shadow physical block    (meaningful only when shadowed)
//! ```
//!
//! Three MSB-first bitmaps accompany the map: modified-physical (shadows
//! allocated since the last commit), modified-virtual (blocks shadowed since
//! the last commit) and free (bit set = physical block in use). The map is
//! authoritative; all three bitmaps are rebuilt from it when the journal is
//! opened.
//!
//! [`commit`]: JournalStorage::commit
//! [`rollback`]: JournalStorage::rollback

use std::io::Cursor;

use bitvec::prelude::*;
use log::{debug, info, trace};

use super::{Storage, check_range, fill_zero, read_vec};
use crate::utils::{le_u32, le_u64, magic, pad_to, put_u32, put_u64, to_usize};
use crate::{Error, Result};

/// Header magic.
pub const JOURNAL_MAGIC: &[u8; 4] = b"JNGL";
/// Header version written by this crate.
pub const JOURNAL_VERSION: u32 = 0x10000;
/// Size of the header record.
pub const JOURNAL_HEADER_SIZE: u64 = 0x40;
/// Size of one map entry.
pub const JOURNAL_MAP_ENTRY_SIZE: u64 = 8;

const SHADOWED: u32 = 0x8000_0000;

/// Block counts and size of a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalGeometry {
    pub block_size: u64,
    /// Virtual blocks visible to the layer above.
    pub main_blocks: u32,
    /// Spare physical blocks available for shadows.
    pub journal_blocks: u32,
}

impl JournalGeometry {
    pub fn physical_blocks(&self) -> u32 {
        self.main_blocks + self.journal_blocks
    }

    pub fn virtual_size(&self) -> u64 {
        u64::from(self.main_blocks) * self.block_size
    }

    pub fn journal_size(&self) -> u64 {
        u64::from(self.journal_blocks) * self.block_size
    }

    /// Bytes of base storage the journal addresses.
    pub fn data_size(&self) -> u64 {
        u64::from(self.physical_blocks()) * self.block_size
    }

    pub fn map_size(&self) -> u64 {
        u64::from(self.main_blocks) * JOURNAL_MAP_ENTRY_SIZE
    }

    /// Size of the modified-physical and free bitmaps.
    pub fn physical_bitmap_size(&self) -> u64 {
        u64::from(self.physical_blocks()).div_ceil(8)
    }

    pub fn virtual_bitmap_size(&self) -> u64 {
        u64::from(self.main_blocks).div_ceil(8)
    }

    fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(buf);
        magic(&mut r, JOURNAL_MAGIC)?;
        let version = le_u32(&mut r)?;
        if version != JOURNAL_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let virtual_size = le_u64(&mut r)?;
        let journal_size = le_u64(&mut r)?;
        let block_size = le_u64(&mut r)?;
        let main_blocks = le_u32(&mut r)?;
        let journal_blocks = le_u32(&mut r)?;

        let geometry = Self {
            block_size,
            main_blocks,
            journal_blocks,
        };
        if block_size == 0
            || geometry.virtual_size() != virtual_size
            || geometry.journal_size() != journal_size
            || geometry.physical_blocks() & SHADOWED != 0
        {
            return Err(Error::Corrupted("journal header sizes disagree"));
        }
        Ok(geometry)
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(JOURNAL_HEADER_SIZE as usize);
        out.extend_from_slice(JOURNAL_MAGIC);
        put_u32(&mut out, JOURNAL_VERSION);
        put_u64(&mut out, self.virtual_size());
        put_u64(&mut out, self.journal_size());
        put_u64(&mut out, self.block_size);
        put_u32(&mut out, self.main_blocks);
        put_u32(&mut out, self.journal_blocks);
        pad_to(out, JOURNAL_HEADER_SIZE as usize)
    }
}

/// Where a virtual block currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMapping {
    /// Unmodified since the last commit.
    Committed { physical: u32 },
    /// Written since the last commit; reads are served from `shadow`.
    Shadowed { committed: u32, shadow: u32 },
}

impl BlockMapping {
    /// Physical block reads are served from.
    pub fn current(self) -> u32 {
        match self {
            BlockMapping::Committed { physical } => physical,
            BlockMapping::Shadowed { shadow, .. } => shadow,
        }
    }

    fn parse(word0: u32, word1: u32) -> Self {
        if word0 & SHADOWED != 0 {
            BlockMapping::Shadowed {
                committed: word0 & !SHADOWED,
                shadow: word1,
            }
        } else {
            BlockMapping::Committed { physical: word0 }
        }
    }

    fn to_bytes(self) -> [u8; 8] {
        let (word0, word1) = match self {
            BlockMapping::Committed { physical } => (physical, 0),
            BlockMapping::Shadowed { committed, shadow } => (committed | SHADOWED, shadow),
        };
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&word0.to_le_bytes());
        out[4..].copy_from_slice(&word1.to_le_bytes());
        out
    }
}

/// The metadata storages a journal keeps its state in.
#[derive(Debug)]
pub struct JournalParts<M> {
    pub header: M,
    pub map: M,
    pub modified_physical: M,
    pub modified_virtual: M,
    pub free: M,
}

type Bitmap = BitVec<u8, Msb0>;

/// Journaled view of `main_blocks` virtual blocks over a base storage `B`.
#[derive(Debug)]
pub struct JournalStorage<M, B> {
    parts: JournalParts<M>,
    base: B,
    geometry: JournalGeometry,
    map: Vec<BlockMapping>,
    modified_physical: Bitmap,
    modified_virtual: Bitmap,
    free: Bitmap,
}

impl<M: Storage, B: Storage> JournalStorage<M, B> {
    /// Write an initial journal: every virtual block maps to the physical
    /// block of the same index, and every journal block is free.
    pub fn format(parts: &mut JournalParts<M>, geometry: JournalGeometry) -> Result<()> {
        if geometry.block_size == 0 || geometry.physical_blocks() & SHADOWED != 0 {
            return Err(Error::Parse("journal geometry out of range"));
        }
        parts.header.write(0, &geometry.to_bytes())?;

        let mut map = Vec::with_capacity(to_usize(geometry.map_size())?);
        for v in 0..geometry.main_blocks {
            map.extend_from_slice(&BlockMapping::Committed { physical: v }.to_bytes());
        }
        parts.map.write(0, &map)?;

        let (modified_physical, modified_virtual, free) = rebuild_bitmaps(
            &(0..geometry.main_blocks)
                .map(|physical| BlockMapping::Committed { physical })
                .collect::<Vec<_>>(),
            geometry,
        );
        parts.modified_physical.write(0, modified_physical.as_raw_slice())?;
        parts.modified_virtual.write(0, modified_virtual.as_raw_slice())?;
        parts.free.write(0, free.as_raw_slice())?;
        debug!(
            "journal: formatted {} main + {} journal blocks of {:#x}",
            geometry.main_blocks, geometry.journal_blocks, geometry.block_size
        );
        Ok(())
    }

    /// Load the journal state and validate the map against the base.
    pub fn new(mut parts: JournalParts<M>, base: B) -> Result<Self> {
        let mut raw = vec![0u8; JOURNAL_HEADER_SIZE as usize];
        parts.header.read(0, &mut raw)?;
        let geometry = JournalGeometry::parse(&raw)?;

        if base.size()? < geometry.data_size() {
            return Err(Error::Corrupted("journal base smaller than its blocks"));
        }

        let mut raw_map = vec![0u8; to_usize(geometry.map_size())?];
        parts.map.read(0, &mut raw_map)?;
        let map = raw_map
            .chunks_exact(JOURNAL_MAP_ENTRY_SIZE as usize)
            .map(|e| {
                let word0 = u32::from_le_bytes([e[0], e[1], e[2], e[3]]);
                let word1 = u32::from_le_bytes([e[4], e[5], e[6], e[7]]);
                BlockMapping::parse(word0, word1)
            })
            .collect::<Vec<_>>();
        validate(&map, geometry.physical_blocks())?;

        let (modified_physical, modified_virtual, free) = rebuild_bitmaps(&map, geometry);
        let mut journal = Self {
            parts,
            base,
            geometry,
            map,
            modified_physical,
            modified_virtual,
            free,
        };
        if journal.bitmaps_stale()? {
            debug!("journal: stored bitmaps disagree with the map, rewriting");
            journal.sync_bitmaps()?;
        }
        debug!(
            "journal: opened, {} free blocks, {} pending",
            journal.free_block_count(),
            journal.modified_virtual.count_ones()
        );
        Ok(journal)
    }

    pub fn geometry(&self) -> JournalGeometry {
        self.geometry
    }

    pub fn block_size(&self) -> u64 {
        self.geometry.block_size
    }

    /// Current mapping of virtual block `block`.
    pub fn mapping(&self, block: u32) -> Option<BlockMapping> {
        self.map.get(block as usize).copied()
    }

    /// Physical blocks neither committed nor shadowing anything.
    pub fn free_block_count(&self) -> u32 {
        self.free.count_zeros() as u32
    }

    /// Whether any block was written since the last commit or rollback.
    pub fn has_uncommitted_changes(&self) -> bool {
        self.modified_virtual.any()
    }

    pub fn base_mut(&mut self) -> &mut B {
        &mut self.base
    }

    /// Make every shadow block authoritative and release the blocks they
    /// replace.
    pub fn commit(&mut self) -> Result<()> {
        let mut promoted = 0u32;
        for v in 0..self.map.len() {
            if let BlockMapping::Shadowed { committed, shadow } = self.map[v] {
                self.free.set(committed as usize, false);
                self.map[v] = BlockMapping::Committed { physical: shadow };
                promoted += 1;
            }
        }
        self.modified_physical.fill(false);
        self.modified_virtual.fill(false);
        self.persist_all()?;
        debug!("journal: committed {promoted} blocks");
        Ok(())
    }

    /// Discard every shadow block and reinstate the committed mapping.
    pub fn rollback(&mut self) -> Result<()> {
        let mut discarded = 0u32;
        for v in 0..self.map.len() {
            if let BlockMapping::Shadowed { committed, shadow } = self.map[v] {
                self.free.set(shadow as usize, false);
                self.map[v] = BlockMapping::Committed { physical: committed };
                discarded += 1;
            }
        }
        self.modified_physical.fill(false);
        self.modified_virtual.fill(false);
        self.persist_all()?;
        debug!("journal: rolled back {discarded} blocks");
        Ok(())
    }

    /// Zero every free physical block, dropping whatever stale contents
    /// earlier shadows left behind. No mapped block moves.
    ///
    /// Returns the number of blocks cleared.
    pub fn trim(&mut self) -> Result<u32> {
        let (modified_physical, modified_virtual, free) = rebuild_bitmaps(&self.map, self.geometry);
        self.modified_physical = modified_physical;
        self.modified_virtual = modified_virtual;
        self.free = free;
        self.sync_bitmaps()?;

        let bs = self.geometry.block_size;
        let mut cleared = 0u32;
        for p in self.free.iter_zeros().collect::<Vec<_>>() {
            fill_zero(&mut self.base, p as u64 * bs, bs)?;
            cleared += 1;
        }
        info!("journal: trimmed {cleared} free blocks");
        Ok(cleared)
    }

    /// Zero the physical block serving virtual block `block` in place,
    /// without shadowing it.
    ///
    /// Only for blocks whose contents matter to neither the committed nor
    /// the pending state, such as blocks the filesystem above holds free.
    pub fn discard_block(&mut self, block: u32) -> Result<()> {
        let mapping = self.mapping(block).ok_or(Error::InvalidRange)?;
        let bs = self.geometry.block_size;
        fill_zero(&mut self.base, u64::from(mapping.current()) * bs, bs)
    }

    /// Lowest free physical block. It stays free until [`claim`](Self::claim).
    fn allocate(&self) -> Result<u32> {
        let p = self.free.first_zero().ok_or(Error::OutOfSpace)?;
        Ok(p as u32)
    }

    fn claim(&mut self, p: u32) {
        self.free.set(p as usize, true);
        self.modified_physical.set(p as usize, true);
    }

    fn persist_entry(&mut self, v: usize) -> Result<()> {
        let offset = v as u64 * JOURNAL_MAP_ENTRY_SIZE;
        self.parts.map.write(offset, &self.map[v].to_bytes())
    }

    fn persist_bit(storage: &mut M, bitmap: &Bitmap, index: usize) -> Result<()> {
        let byte = index / 8;
        storage.write(byte as u64, &bitmap.as_raw_slice()[byte..byte + 1])
    }

    fn sync_bitmaps(&mut self) -> Result<()> {
        self.parts
            .modified_physical
            .write(0, self.modified_physical.as_raw_slice())?;
        self.parts
            .modified_virtual
            .write(0, self.modified_virtual.as_raw_slice())?;
        self.parts.free.write(0, self.free.as_raw_slice())
    }

    /// Whether any stored bitmap differs from the one rebuilt from the map.
    fn bitmaps_stale(&mut self) -> Result<bool> {
        let pairs = [
            (&mut self.parts.modified_physical, &self.modified_physical),
            (&mut self.parts.modified_virtual, &self.modified_virtual),
            (&mut self.parts.free, &self.free),
        ];
        for (storage, bitmap) in pairs {
            let stored = read_vec(storage, 0, bitmap.as_raw_slice().len())?;
            if stored != bitmap.as_raw_slice() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn persist_all(&mut self) -> Result<()> {
        let mut raw = Vec::with_capacity(self.map.len() * JOURNAL_MAP_ENTRY_SIZE as usize);
        for entry in &self.map {
            raw.extend_from_slice(&entry.to_bytes());
        }
        self.parts.map.write(0, &raw)?;
        self.sync_bitmaps()
    }

    /// `(block, offset_in_block, chunk_len)` for `[offset, offset + len)`.
    fn chunks(&self, offset: u64, len: usize) -> Vec<(usize, u64, usize)> {
        let bs = self.geometry.block_size;
        let end = offset + len as u64;
        let mut out = Vec::new();
        let mut pos = offset;
        while pos < end {
            let within = pos % bs;
            let n = (bs - within).min(end - pos);
            out.push(((pos / bs) as usize, within, n as usize));
            pos += n;
        }
        out
    }

    /// Redirect block `v` to a fresh shadow holding its current contents
    /// merged with `data` at `within`.
    ///
    /// The shadow is only claimed once its contents are in place, so a
    /// failed base write leaves the journal as it was.
    fn shadow(&mut self, v: usize, committed: u32, within: u64, data: &[u8]) -> Result<u32> {
        let bs = self.geometry.block_size;
        let shadow = self.allocate()?;
        let mut block = vec![0u8; to_usize(bs)?];
        if data.len() as u64 != bs {
            self.base.read(u64::from(committed) * bs, &mut block)?;
        }
        let within = to_usize(within)?;
        block[within..within + data.len()].copy_from_slice(data);
        self.base.write(u64::from(shadow) * bs, &block)?;

        self.claim(shadow);
        self.modified_virtual.set(v, true);
        self.map[v] = BlockMapping::Shadowed { committed, shadow };
        Self::persist_bit(&mut self.parts.free, &self.free, shadow as usize)?;
        Self::persist_bit(&mut self.parts.modified_physical, &self.modified_physical, shadow as usize)?;
        Self::persist_bit(&mut self.parts.modified_virtual, &self.modified_virtual, v)?;
        self.persist_entry(v)?;
        trace!("journal: block {v} shadowed {committed} -> {shadow}");
        Ok(shadow)
    }
}

impl<M: Storage, B: Storage> Storage for JournalStorage<M, B> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_range(offset, buf.len(), self.geometry.virtual_size())?;
        let bs = self.geometry.block_size;
        let mut done = 0usize;
        for (v, within, n) in self.chunks(offset, buf.len()) {
            let physical = self.map[v].current();
            self.base
                .read(u64::from(physical) * bs + within, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        check_range(offset, buf.len(), self.geometry.virtual_size())?;
        let bs = self.geometry.block_size;
        let mut done = 0usize;
        for (v, within, n) in self.chunks(offset, buf.len()) {
            let data = &buf[done..done + n];
            match self.map[v] {
                BlockMapping::Shadowed { shadow, .. } => {
                    self.base.write(u64::from(shadow) * bs + within, data)?;
                }
                BlockMapping::Committed { physical } => {
                    self.shadow(v, physical, within, data)?;
                }
            }
            done += n;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.parts.map.flush()?;
        self.parts.modified_physical.flush()?;
        self.parts.modified_virtual.flush()?;
        self.parts.free.flush()?;
        self.base.flush()
    }

    fn size(&self) -> Result<u64> {
        Ok(self.geometry.virtual_size())
    }

    fn set_size(&mut self, _size: u64) -> Result<()> {
        Err(Error::Unsupported("journal storage cannot be resized"))
    }
}

/// Every index must address a physical block and no physical block may be
/// referenced twice.
fn validate(map: &[BlockMapping], physical_blocks: u32) -> Result<()> {
    let mut seen: Bitmap = bitvec![u8, Msb0; 0; physical_blocks as usize];
    let mut claim = |p: u32| -> Result<()> {
        if p >= physical_blocks {
            return Err(Error::Corrupted("journal map index out of range"));
        }
        if seen.replace(p as usize, true) {
            return Err(Error::Corrupted("journal map references a block twice"));
        }
        Ok(())
    };
    for entry in map {
        match *entry {
            BlockMapping::Committed { physical } => claim(physical)?,
            BlockMapping::Shadowed { committed, shadow } => {
                claim(committed)?;
                claim(shadow)?;
            }
        }
    }
    Ok(())
}

/// Derive the modified-physical, modified-virtual and free bitmaps from a
/// validated map.
fn rebuild_bitmaps(map: &[BlockMapping], geometry: JournalGeometry) -> (Bitmap, Bitmap, Bitmap) {
    let physical = geometry.physical_blocks() as usize;
    let mut modified_physical: Bitmap = bitvec![u8, Msb0; 0; physical];
    let mut modified_virtual: Bitmap = bitvec![u8, Msb0; 0; map.len()];
    let mut free: Bitmap = bitvec![u8, Msb0; 0; physical];
    for (v, entry) in map.iter().enumerate() {
        match *entry {
            BlockMapping::Committed { physical } => free.set(physical as usize, true),
            BlockMapping::Shadowed { committed, shadow } => {
                free.set(committed as usize, true);
                free.set(shadow as usize, true);
                modified_physical.set(shadow as usize, true);
                modified_virtual.set(v, true);
            }
        }
    }
    (modified_physical, modified_virtual, free)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, SharedStorage, SubStorage};

    type Slice = SubStorage<SharedStorage<MemoryStorage>>;

    const GEOMETRY: JournalGeometry = JournalGeometry {
        block_size: 0x100,
        main_blocks: 8,
        journal_blocks: 4,
    };

    // [header 0x40][map 0x40][phys 2][virt 1][free 2] then data at 0x100.
    fn parts(disk: &SharedStorage<MemoryStorage>) -> JournalParts<Slice> {
        JournalParts {
            header: disk.slice(0, 0x40).unwrap(),
            map: disk.slice(0x40, 0x40).unwrap(),
            modified_physical: disk.slice(0x80, 2).unwrap(),
            modified_virtual: disk.slice(0x82, 1).unwrap(),
            free: disk.slice(0x83, 2).unwrap(),
        }
    }

    fn open(disk: &SharedStorage<MemoryStorage>) -> JournalStorage<Slice, Slice> {
        JournalStorage::new(parts(disk), disk.slice(0x100, GEOMETRY.data_size()).unwrap()).unwrap()
    }

    fn formatted() -> SharedStorage<MemoryStorage> {
        let _ = env_logger::builder().is_test(true).try_init();
        let disk = SharedStorage::new(MemoryStorage::new(0x100 + GEOMETRY.data_size() as usize));
        JournalStorage::<Slice, Slice>::format(&mut parts(&disk), GEOMETRY).unwrap();
        disk
    }

    #[test]
    fn fresh_journal_is_identity_mapped() {
        let disk = formatted();
        let journal = open(&disk);
        assert_eq!(journal.free_block_count(), 4);
        assert_eq!(journal.mapping(3), Some(BlockMapping::Committed { physical: 3 }));
        assert!(!journal.has_uncommitted_changes());
        assert_eq!(journal.size().unwrap(), 0x800);
    }

    #[test]
    fn commit_makes_writes_durable() {
        let disk = formatted();
        let mut journal = open(&disk);
        journal.write(0x110, &[0xAB; 0x20]).unwrap();
        assert_eq!(
            journal.mapping(1),
            Some(BlockMapping::Shadowed {
                committed: 1,
                shadow: 8
            })
        );
        assert_eq!(journal.free_block_count(), 3);
        journal.commit().unwrap();
        assert_eq!(journal.mapping(1), Some(BlockMapping::Committed { physical: 8 }));
        assert_eq!(journal.free_block_count(), 4);
        drop(journal);

        let mut reopened = open(&disk);
        let mut buf = [0u8; 0x30];
        reopened.read(0x100, &mut buf).unwrap();
        assert_eq!(&buf[..0x10], &[0; 0x10]);
        assert_eq!(&buf[0x10..], &[0xAB; 0x20]);
        assert!(!reopened.has_uncommitted_changes());
    }

    #[test]
    fn rollback_restores_data_and_free_count() {
        let disk = formatted();
        let mut journal = open(&disk);
        journal.write(0, &[1; 0x300]).unwrap();
        journal.commit().unwrap();
        let free_before = journal.free_block_count();

        journal.write(0x80, &[2; 0x100]).unwrap();
        journal.write(0x700, &[3; 4]).unwrap();
        journal.write(0x90, &[4; 4]).unwrap();
        assert!(journal.has_uncommitted_changes());
        assert_eq!(journal.free_block_count(), free_before - 3);

        journal.rollback().unwrap();
        assert_eq!(journal.free_block_count(), free_before);
        assert!(!journal.has_uncommitted_changes());
        let mut buf = vec![0u8; 0x300];
        journal.read(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 1));
        let mut tail = [0xFFu8; 4];
        journal.read(0x700, &mut tail).unwrap();
        assert_eq!(tail, [0; 4]);
    }

    #[test]
    fn pending_shadows_survive_reopen() {
        let disk = formatted();
        open(&disk).write(0x200, &[9; 8]).unwrap();
        let mut reopened = open(&disk);
        assert!(reopened.has_uncommitted_changes());
        reopened.rollback().unwrap();
        let mut buf = [0xFFu8; 8];
        reopened.read(0x200, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    fn exhausted_journal_is_out_of_space() {
        let disk = formatted();
        let mut journal = open(&disk);
        for v in 0..4u64 {
            journal.write(v * 0x100, &[v as u8; 1]).unwrap();
        }
        assert_eq!(journal.free_block_count(), 0);
        assert!(matches!(journal.write(0x400, &[1]), Err(Error::OutOfSpace)));
        // Already shadowed blocks are written in place.
        journal.write(0x10, &[7; 4]).unwrap();
    }

    #[test]
    fn trim_clears_free_blocks() {
        let disk = formatted();
        let mut journal = open(&disk);
        journal.write(0, &[5; 0x100]).unwrap();
        journal.commit().unwrap();
        // Physical block 0 held the old contents and is now free.
        disk.lock().as_mut_slice()[0x100] = 0xEE;
        assert_eq!(journal.trim().unwrap(), 4);
        assert_eq!(disk.lock().as_slice()[0x100], 0);
        let mut buf = [0u8; 4];
        journal.read(0, &mut buf).unwrap();
        assert_eq!(buf, [5; 4]);
    }

    /// Fails the next base write once armed.
    struct FailingWrites {
        inner: Slice,
        fail_next: bool,
    }

    impl Storage for FailingWrites {
        fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            self.inner.read(offset, buf)
        }
        fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
            if std::mem::take(&mut self.fail_next) {
                return Err(Error::Io(std::io::Error::other("write failed")));
            }
            self.inner.write(offset, buf)
        }
        fn flush(&mut self) -> Result<()> {
            self.inner.flush()
        }
        fn size(&self) -> Result<u64> {
            self.inner.size()
        }
        fn set_size(&mut self, size: u64) -> Result<()> {
            self.inner.set_size(size)
        }
    }

    #[test]
    fn failed_shadow_write_keeps_its_block_free() {
        let disk = formatted();
        let base = FailingWrites {
            inner: disk.slice(0x100, GEOMETRY.data_size()).unwrap(),
            fail_next: false,
        };
        let mut journal = JournalStorage::new(parts(&disk), base).unwrap();
        let free_before = journal.free_block_count();

        journal.base_mut().fail_next = true;
        assert!(matches!(journal.write(0, &[1; 0x10]), Err(Error::Io(_))));
        assert_eq!(journal.free_block_count(), free_before);
        assert_eq!(journal.mapping(0), Some(BlockMapping::Committed { physical: 0 }));
        assert!(!journal.has_uncommitted_changes());

        journal.write(0x100, &[2; 0x10]).unwrap();
        journal.rollback().unwrap();
        assert_eq!(journal.free_block_count(), free_before);
        // The block the failed write picked is handed out again.
        journal.write(0, &[3; 0x10]).unwrap();
        assert_eq!(
            journal.mapping(0),
            Some(BlockMapping::Shadowed {
                committed: 0,
                shadow: 8
            })
        );
    }

    #[test]
    fn discarded_block_reads_as_zero() {
        let disk = formatted();
        let mut journal = open(&disk);
        journal.write(0x300, &[6; 0x100]).unwrap();
        journal.commit().unwrap();
        journal.discard_block(3).unwrap();
        assert!(!journal.has_uncommitted_changes());
        let mut buf = [0xFFu8; 0x100];
        journal.read(0x300, &mut buf).unwrap();
        assert_eq!(buf, [0; 0x100]);
    }

    #[test]
    fn duplicate_physical_blocks_are_corrupt() {
        let disk = formatted();
        // Point virtual block 2 at physical block 1.
        disk.lock().as_mut_slice()[0x40 + 2 * 8] = 1;
        let result = JournalStorage::new(parts(&disk), disk.slice(0x100, GEOMETRY.data_size()).unwrap());
        assert!(matches!(result, Err(Error::Corrupted(_))));

        let disk = formatted();
        disk.lock().as_mut_slice()[0x40 + 2 * 8] = 12;
        let result = JournalStorage::new(parts(&disk), disk.slice(0x100, GEOMETRY.data_size()).unwrap());
        assert!(matches!(result, Err(Error::Corrupted(_))));
    }
}
