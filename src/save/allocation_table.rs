//! Allocation table - linked runs of blocks.
//!
//! Every block of the journaled data area has one 8-byte entry. Blocks are
//! grouped into *runs* of consecutive blocks, and a chain is a singly linked
//! list of runs. Only the first block of a run carries a meaningful entry.
//!
//! ## Table header (0x40 bytes, at the start of the table storage)
//! ```text
//! [0x00] Magic "SAVE"            (4 bytes)
//! [0x04] Version                 (u32 LE)
//! [0x08] BlockSize               (u64 LE)
//! [0x10] BlockCount              (u32 LE)
//! [0x14] FreeListHead            (u32 LE) - 0xFFFFFFFF when full
//! [0x18] DirectoryTableHead      (u32 LE)
//! [0x1C] FileTableHead           (u32 LE)
//! [0x20] Reserved                (0x20 bytes)
//! ```
//!
//! ## Entry (8 bytes, one per block, following the header)
//! ```text
//! [0x00] bit 31: run head; bits 0..30: run length in blocks
//! [0x04] Next run head           (u32 LE) - 0xFFFFFFFF ends the chain
//! ```
//! Entries of blocks inside a run are zero.
//!
//! Every block belongs to exactly one chain: the free list, the directory
//! table, the file table, or one file's data.

use std::io::Cursor;

use log::{debug, trace};

use crate::storage::Storage;
use crate::utils::{le_u32, le_u64, magic, pad_to, put_u32, put_u64};
use crate::{Error, Result};

/// Marks the end of a chain.
pub const CHAIN_END: u32 = 0xFFFF_FFFF;
/// Size of the table header.
pub const TABLE_HEADER_SIZE: u64 = 0x40;
/// Size of one entry.
pub const TABLE_ENTRY_SIZE: u64 = 8;

const TABLE_MAGIC: &[u8; 4] = b"SAVE";
const TABLE_VERSION: u32 = 0x10000;
const RUN_HEAD: u32 = 0x8000_0000;

/// Bytes of table storage needed for `block_count` blocks.
pub fn table_size(block_count: u32) -> u64 {
    TABLE_HEADER_SIZE + u64::from(block_count) * TABLE_ENTRY_SIZE
}

/// A chain named by role instead of by sentinel block index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainId {
    Free,
    DirectoryTable,
    FileTable,
    /// A file's data chain, by its first block.
    Data(u32),
}

/// `len` consecutive blocks starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub start: u32,
    pub len: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Entry {
    word0: u32,
    next: u32,
}

impl Entry {
    fn head(len: u32, next: u32) -> Self {
        Self {
            word0: RUN_HEAD | len,
            next,
        }
    }

    fn run_len(self) -> Option<u32> {
        (self.word0 & RUN_HEAD != 0).then_some(self.word0 & !RUN_HEAD)
    }
}

#[derive(Debug)]
struct TableState {
    free_head: u32,
    directory_head: u32,
    file_head: u32,
    entries: Vec<Entry>,
}

/// The allocation table over its storage `F`.
///
/// The table is loaded into memory on open and every mutation is written
/// through to the storage.
#[derive(Debug)]
pub struct AllocationTable<F> {
    storage: F,
    block_size: u64,
    state: TableState,
}

impl<F: Storage> AllocationTable<F> {
    /// Write a fresh table: block 0 heads the directory table, block 1 the
    /// file table and the remaining blocks form one free run.
    pub fn format(storage: &mut F, block_size: u64, block_count: u32) -> Result<()> {
        if block_count < 2 || block_count >= RUN_HEAD {
            return Err(Error::Parse("allocation table needs at least two blocks"));
        }
        if storage.size()? < table_size(block_count) {
            return Err(Error::InvalidRange);
        }
        let mut entries = vec![Entry::default(); block_count as usize];
        entries[0] = Entry::head(1, CHAIN_END);
        entries[1] = Entry::head(1, CHAIN_END);
        let free_head = if block_count > 2 {
            entries[2] = Entry::head(block_count - 2, CHAIN_END);
            2
        } else {
            CHAIN_END
        };
        let state = TableState {
            free_head,
            directory_head: 0,
            file_head: 1,
            entries,
        };
        let mut table = AllocationTable {
            storage: &mut *storage,
            block_size,
            state,
        };
        table.persist_all()?;
        debug!("allocation table: formatted {block_count} blocks of {block_size:#x}");
        Ok(())
    }

    /// Load and sanity-check a table.
    pub fn new(mut storage: F) -> Result<Self> {
        let mut raw = vec![0u8; TABLE_HEADER_SIZE as usize];
        storage.read(0, &mut raw)?;
        let mut r = Cursor::new(&raw);
        magic(&mut r, TABLE_MAGIC)?;
        let version = le_u32(&mut r)?;
        if version != TABLE_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let block_size = le_u64(&mut r)?;
        let block_count = le_u32(&mut r)?;
        let free_head = le_u32(&mut r)?;
        let directory_head = le_u32(&mut r)?;
        let file_head = le_u32(&mut r)?;

        if block_size == 0 || storage.size()? < table_size(block_count) {
            return Err(Error::Corrupted("allocation table header out of range"));
        }

        let mut raw = vec![0u8; block_count as usize * TABLE_ENTRY_SIZE as usize];
        storage.read(TABLE_HEADER_SIZE, &mut raw)?;
        let entries = raw
            .chunks_exact(TABLE_ENTRY_SIZE as usize)
            .map(|e| Entry {
                word0: u32::from_le_bytes([e[0], e[1], e[2], e[3]]),
                next: u32::from_le_bytes([e[4], e[5], e[6], e[7]]),
            })
            .collect();

        let table = Self {
            storage,
            block_size,
            state: TableState {
                free_head,
                directory_head,
                file_head,
                entries,
            },
        };
        table.check_disjoint()?;
        debug!(
            "allocation table: {} blocks, {} free",
            block_count,
            table.free_block_count()?
        );
        Ok(table)
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.state.entries.len() as u32
    }

    pub fn storage_mut(&mut self) -> &mut F {
        &mut self.storage
    }

    pub fn into_storage(self) -> F {
        self.storage
    }

    /// First block of a chain, or `None` for an empty free list.
    pub fn head(&self, chain: ChainId) -> Option<u32> {
        let head = match chain {
            ChainId::Free => self.state.free_head,
            ChainId::DirectoryTable => self.state.directory_head,
            ChainId::FileTable => self.state.file_head,
            ChainId::Data(head) => head,
        };
        (head != CHAIN_END).then_some(head)
    }

    /// Runs of a chain in order. Fails on cycles and out-of-range links.
    pub fn runs(&self, chain: ChainId) -> Result<Vec<Run>> {
        let mut runs = Vec::new();
        let Some(mut at) = self.head(chain) else {
            return Ok(runs);
        };
        let mut blocks = 0u64;
        loop {
            let entry = *self
                .state
                .entries
                .get(at as usize)
                .ok_or(Error::Corrupted("allocation chain link out of range"))?;
            let len = entry
                .run_len()
                .ok_or(Error::Corrupted("allocation chain link is not a run head"))?;
            if len == 0 || u64::from(at) + u64::from(len) > u64::from(self.block_count()) {
                return Err(Error::Corrupted("allocation run out of range"));
            }
            blocks += u64::from(len);
            if blocks > u64::from(self.block_count()) {
                return Err(Error::Corrupted("allocation chain contains a cycle"));
            }
            runs.push(Run { start: at, len });
            if entry.next == CHAIN_END {
                return Ok(runs);
            }
            at = entry.next;
        }
    }

    /// Number of blocks in a chain.
    pub fn chain_len(&self, chain: ChainId) -> Result<u32> {
        Ok(self.runs(chain)?.iter().map(|r| r.len).sum())
    }

    pub fn free_block_count(&self) -> Result<u32> {
        self.chain_len(ChainId::Free)
    }

    /// Take `count` blocks off the free list as a new chain.
    pub fn allocate(&mut self, count: u32) -> Result<u32> {
        if count == 0 {
            return Err(Error::InvalidRange);
        }
        if self.free_block_count()? < count {
            return Err(Error::OutOfSpace);
        }
        let head = self.state.free_head;
        let mut remaining = count;
        let mut last = head;
        loop {
            let len = self.run_len(last)?;
            if len >= remaining {
                if len > remaining {
                    self.split(last, remaining)?;
                }
                let entry = &mut self.state.entries[last as usize];
                self.state.free_head = entry.next;
                entry.next = CHAIN_END;
                self.persist_entry(last)?;
                break;
            }
            remaining -= len;
            last = self.state.entries[last as usize].next;
        }
        self.persist_header()?;
        trace!("allocation table: allocated {count} blocks at {head}");
        Ok(head)
    }

    /// Return a whole chain to the free list.
    pub fn free(&mut self, head: u32) -> Result<()> {
        let runs = self.runs(ChainId::Data(head))?;
        let Some(last) = runs.last() else {
            return Ok(());
        };
        self.state.entries[last.start as usize].next = self.state.free_head;
        self.persist_entry(last.start)?;
        self.state.free_head = head;
        self.persist_header()?;
        trace!("allocation table: freed chain at {head}");
        Ok(())
    }

    /// Append `count` newly allocated blocks to the chain at `head`.
    pub fn extend(&mut self, head: u32, count: u32) -> Result<()> {
        let runs = self.runs(ChainId::Data(head))?;
        let last = runs.last().ok_or(Error::InvalidRange)?.start;
        let added = self.allocate(count)?;
        self.state.entries[last as usize].next = added;
        self.persist_entry(last)
    }

    /// Keep the first `keep` blocks of the chain at `head` and free the
    /// rest. `keep` must be at least one; free the chain to drop it.
    pub fn truncate(&mut self, head: u32, keep: u32) -> Result<()> {
        if keep == 0 {
            return Err(Error::InvalidRange);
        }
        let mut kept = 0u32;
        for run in self.runs(ChainId::Data(head))? {
            if kept + run.len < keep {
                kept += run.len;
                continue;
            }
            let cut = keep - kept;
            if cut < run.len {
                self.split(run.start, cut)?;
            }
            let tail = self.state.entries[run.start as usize].next;
            self.state.entries[run.start as usize].next = CHAIN_END;
            self.persist_entry(run.start)?;
            if tail != CHAIN_END {
                self.free(tail)?;
            }
            return Ok(());
        }
        Err(Error::InvalidRange)
    }

    fn run_len(&self, at: u32) -> Result<u32> {
        self.state
            .entries
            .get(at as usize)
            .and_then(|e| e.run_len())
            .ok_or(Error::Corrupted("allocation chain link is not a run head"))
    }

    /// Split the run at `at` after its first `len` blocks.
    fn split(&mut self, at: u32, len: u32) -> Result<()> {
        let total = self.run_len(at)?;
        let tail = at + len;
        let next = self.state.entries[at as usize].next;
        self.state.entries[tail as usize] = Entry::head(total - len, next);
        self.state.entries[at as usize] = Entry::head(len, tail);
        self.persist_entry(tail)?;
        self.persist_entry(at)
    }

    /// Chains reachable from the header must not share blocks.
    fn check_disjoint(&self) -> Result<()> {
        let mut seen = vec![false; self.state.entries.len()];
        for chain in [ChainId::Free, ChainId::DirectoryTable, ChainId::FileTable] {
            for run in self.runs(chain)? {
                for b in run.start..run.start + run.len {
                    if std::mem::replace(&mut seen[b as usize], true) {
                        return Err(Error::Corrupted("allocation chains overlap"));
                    }
                }
            }
        }
        Ok(())
    }

    fn header_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(TABLE_HEADER_SIZE as usize);
        out.extend_from_slice(TABLE_MAGIC);
        put_u32(&mut out, TABLE_VERSION);
        put_u64(&mut out, self.block_size);
        put_u32(&mut out, self.block_count());
        put_u32(&mut out, self.state.free_head);
        put_u32(&mut out, self.state.directory_head);
        put_u32(&mut out, self.state.file_head);
        pad_to(out, TABLE_HEADER_SIZE as usize)
    }

    fn persist_header(&mut self) -> Result<()> {
        let header = self.header_bytes();
        self.storage.write(0, &header)
    }

    fn persist_entry(&mut self, at: u32) -> Result<()> {
        let e = self.state.entries[at as usize];
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&e.word0.to_le_bytes());
        raw[4..].copy_from_slice(&e.next.to_le_bytes());
        self.storage
            .write(TABLE_HEADER_SIZE + u64::from(at) * TABLE_ENTRY_SIZE, &raw)
    }

    fn persist_all(&mut self) -> Result<()> {
        let mut raw = self.header_bytes();
        for e in &self.state.entries {
            put_u32(&mut raw, e.word0);
            put_u32(&mut raw, e.next);
        }
        self.storage.write(0, &raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    const BLOCKS: u32 = 16;

    fn table() -> AllocationTable<MemoryStorage> {
        let mut storage = MemoryStorage::new(table_size(BLOCKS) as usize);
        AllocationTable::format(&mut storage, 0x200, BLOCKS).unwrap();
        AllocationTable::new(storage).unwrap()
    }

    fn runs(t: &AllocationTable<MemoryStorage>, head: u32) -> Vec<(u32, u32)> {
        t.runs(ChainId::Data(head))
            .unwrap()
            .iter()
            .map(|r| (r.start, r.len))
            .collect()
    }

    #[test]
    fn fresh_table_reserves_both_tables() {
        let t = table();
        assert_eq!(t.head(ChainId::DirectoryTable), Some(0));
        assert_eq!(t.head(ChainId::FileTable), Some(1));
        assert_eq!(t.free_block_count().unwrap(), BLOCKS - 2);
    }

    #[test]
    fn allocate_free_and_reuse() {
        let mut t = table();
        let a = t.allocate(3).unwrap();
        let b = t.allocate(4).unwrap();
        assert_eq!(runs(&t, a), vec![(2, 3)]);
        assert_eq!(runs(&t, b), vec![(5, 4)]);
        assert_eq!(t.free_block_count().unwrap(), BLOCKS - 9);

        t.free(a).unwrap();
        assert_eq!(t.free_block_count().unwrap(), BLOCKS - 6);
        // The freed run is reused first, then the chain continues.
        let c = t.allocate(5).unwrap();
        assert_eq!(runs(&t, c), vec![(2, 3), (9, 2)]);
        assert!(matches!(t.allocate(100), Err(Error::OutOfSpace)));
    }

    #[test]
    fn extend_and_truncate() {
        let mut t = table();
        let a = t.allocate(2).unwrap();
        let _wall = t.allocate(1).unwrap();
        t.extend(a, 3).unwrap();
        assert_eq!(t.chain_len(ChainId::Data(a)).unwrap(), 5);
        assert_eq!(runs(&t, a), vec![(2, 2), (5, 3)]);

        t.truncate(a, 3).unwrap();
        assert_eq!(runs(&t, a), vec![(2, 2), (5, 1)]);
        assert_eq!(t.free_block_count().unwrap(), BLOCKS - 2 - 4);
    }

    #[test]
    fn persisted_table_reloads() {
        let mut t = table();
        let a = t.allocate(6).unwrap();
        t.truncate(a, 2).unwrap();
        let before = t.free_block_count().unwrap();
        let reloaded = AllocationTable::new(t.into_storage()).unwrap();
        assert_eq!(reloaded.free_block_count().unwrap(), before);
        assert_eq!(runs(&reloaded, a), vec![(2, 2)]);
    }

    #[test]
    fn cycles_are_corrupt() {
        let mut t = table();
        let a = t.allocate(1).unwrap();
        // Point the run back at itself.
        let at = (TABLE_HEADER_SIZE + u64::from(a) * TABLE_ENTRY_SIZE + 4) as usize;
        t.storage_mut().as_mut_slice()[at..at + 4].copy_from_slice(&a.to_le_bytes());
        let reloaded = AllocationTable::new(t.into_storage()).unwrap();
        assert!(matches!(reloaded.runs(ChainId::Data(a)), Err(Error::Corrupted(_))));
        assert!(matches!(reloaded.runs(ChainId::Data(BLOCKS + 3)), Err(Error::Corrupted(_))));
    }
}
