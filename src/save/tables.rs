//! Directory and file table records.
//!
//! Both tables are arrays of 0x60-byte records stored in their own
//! allocation-table chain. Record 0 of each table is a header; directory
//! record 1 is the root directory. Links between records are record indices,
//! with 0 meaning "none".
//!
//! ## Table header (record 0)
//! ```text
//! [0x00] FreeListHead            (u32 LE) - first free record, linked
//!                                           through NextSibling
//! [0x04] AllocatedCount          (u32 LE) - records ever handed out,
//!                                           including this one
//! ```
//!
//! ## Directory record
//! ```text
//! [0x00] Parent                  (u32 LE)
//! [0x04] Name                    (0x40, zero-padded)
//! [0x44] NextSibling             (u32 LE)
//! [0x48] FirstChildDirectory     (u32 LE)
//! [0x4C] FirstChildFile          (u32 LE)
//! [0x58] Flags                   (u32 LE)
//! ```
//!
//! ## File record
//! ```text
//! [0x00] Parent                  (u32 LE)
//! [0x04] Name                    (0x40, zero-padded)
//! [0x44] NextSibling             (u32 LE)
//! [0x48] StartBlock              (u32 LE) - 0xFFFFFFFF for an empty file
//! [0x50] Size                    (u64 LE)
//! [0x58] Flags                   (u32 LE)
//! ```

use crate::save::allocation_table::CHAIN_END;
use crate::{Error, Result};

/// Size of one record.
pub const RECORD_SIZE: u64 = 0x60;
/// Longest name a directory or file may have, in bytes.
pub const NAME_MAX: usize = 0x40;
/// Record index meaning "no record".
pub const NO_RECORD: u32 = 0;
/// Record index of the root directory.
pub const ROOT_DIRECTORY: u32 = 1;

fn u32_at(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn u64_at(buf: &[u8], at: usize) -> u64 {
    u64::from(u32_at(buf, at)) | (u64::from(u32_at(buf, at + 4)) << 32)
}

fn put(buf: &mut [u8], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

/// A validated record name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Name([u8; NAME_MAX]);

impl Name {
    pub fn new(name: &str) -> Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() {
            return Err(Error::InvalidPath("empty name"));
        }
        if bytes.len() > NAME_MAX {
            return Err(Error::InvalidPath("name longer than 64 bytes"));
        }
        if bytes.contains(&0) {
            return Err(Error::InvalidPath("name contains NUL"));
        }
        let mut field = [0u8; NAME_MAX];
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(Self(field))
    }

    /// The unnamed root directory's name.
    pub fn root() -> Self {
        Self([0u8; NAME_MAX])
    }

    pub fn decode(&self) -> String {
        crate::utils::padded_name(&self.0)
    }

    fn from_field(buf: &[u8]) -> Self {
        let mut field = [0u8; NAME_MAX];
        field.copy_from_slice(&buf[4..4 + NAME_MAX]);
        Self(field)
    }
}

/// Record 0 of either table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableHeader {
    pub free_head: u32,
    pub allocated: u32,
}

impl TableHeader {
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            free_head: u32_at(buf, 0),
            allocated: u32_at(buf, 4),
        }
    }

    pub fn to_bytes(self) -> [u8; RECORD_SIZE as usize] {
        let mut out = [0u8; RECORD_SIZE as usize];
        put(&mut out, 0, &self.free_head.to_le_bytes());
        put(&mut out, 4, &self.allocated.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub parent: u32,
    pub name: Name,
    pub next_sibling: u32,
    pub first_directory: u32,
    pub first_file: u32,
    pub flags: u32,
}

impl DirectoryRecord {
    pub fn new(parent: u32, name: Name) -> Self {
        Self {
            parent,
            name,
            next_sibling: NO_RECORD,
            first_directory: NO_RECORD,
            first_file: NO_RECORD,
            flags: 0,
        }
    }

    pub fn parse(buf: &[u8]) -> Self {
        Self {
            parent: u32_at(buf, 0),
            name: Name::from_field(buf),
            next_sibling: u32_at(buf, 0x44),
            first_directory: u32_at(buf, 0x48),
            first_file: u32_at(buf, 0x4C),
            flags: u32_at(buf, 0x58),
        }
    }

    pub fn to_bytes(self) -> [u8; RECORD_SIZE as usize] {
        let mut out = [0u8; RECORD_SIZE as usize];
        put(&mut out, 0, &self.parent.to_le_bytes());
        put(&mut out, 4, &self.name.0);
        put(&mut out, 0x44, &self.next_sibling.to_le_bytes());
        put(&mut out, 0x48, &self.first_directory.to_le_bytes());
        put(&mut out, 0x4C, &self.first_file.to_le_bytes());
        put(&mut out, 0x58, &self.flags.to_le_bytes());
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRecord {
    pub parent: u32,
    pub name: Name,
    pub next_sibling: u32,
    /// First block of the data chain, or `None` for an empty file.
    pub start_block: Option<u32>,
    pub size: u64,
    pub flags: u32,
}

impl FileRecord {
    pub fn new(parent: u32, name: Name) -> Self {
        Self {
            parent,
            name,
            next_sibling: NO_RECORD,
            start_block: None,
            size: 0,
            flags: 0,
        }
    }

    pub fn parse(buf: &[u8]) -> Self {
        let start = u32_at(buf, 0x48);
        Self {
            parent: u32_at(buf, 0),
            name: Name::from_field(buf),
            next_sibling: u32_at(buf, 0x44),
            start_block: (start != CHAIN_END).then_some(start),
            size: u64_at(buf, 0x50),
            flags: u32_at(buf, 0x58),
        }
    }

    pub fn to_bytes(self) -> [u8; RECORD_SIZE as usize] {
        let mut out = [0u8; RECORD_SIZE as usize];
        put(&mut out, 0, &self.parent.to_le_bytes());
        put(&mut out, 4, &self.name.0);
        put(&mut out, 0x44, &self.next_sibling.to_le_bytes());
        put(
            &mut out,
            0x48,
            &self.start_block.unwrap_or(CHAIN_END).to_le_bytes(),
        );
        put(&mut out, 0x50, &self.size.to_le_bytes());
        put(&mut out, 0x58, &self.flags.to_le_bytes());
        out
    }
}

/// Next-sibling link of any record, used to thread the free list.
pub fn next_sibling(buf: &[u8]) -> u32 {
    u32_at(buf, 0x44)
}

pub fn set_next_sibling(buf: &mut [u8], next: u32) {
    put(buf, 0x44, &next.to_le_bytes());
}

/// A free record pointing at `next`.
pub fn free_record(next: u32) -> [u8; RECORD_SIZE as usize] {
    let mut out = [0u8; RECORD_SIZE as usize];
    put(&mut out, 0x44, &next.to_le_bytes());
    out
}
