//! Remap storage - a contiguous virtual address space over relocatable
//! physical extents.
//!
//! ## Header (0x40 bytes)
//! ```text
//! [0x00] Magic "RMAP"          (4 bytes)
//! [0x04] Version               (u32 LE)
//! [0x08] EntryCount            (u32 LE)
//! [0x0C] EntryCapacity         (u32 LE) - slots available in the entry table
//! [0x10] Reserved              (0x30 bytes)
//! ```
//!
//! ## Entry (0x20 bytes)
//! ```text
//! [0x00] VirtualOffset         (u64 LE)
//! [0x08] PhysicalOffset        (u64 LE) - relative to the base storage
//! [0x10] Size                  (u64 LE)
//! [0x18] Alignment             (u32 LE)
//! [0x1C] Reserved              (u32)
//! ```
//!
//! ## Invariants
//! * Entries are stored in virtual order and tile `[0, virtual_size)`
//!   exactly - no gaps, no overlaps.
//! * Physical extents lie inside the base storage and never overlap.
//! * Growth appends entries; an existing entry is never rewritten, so data
//!   already placed never moves.

use std::io::Cursor;

use log::debug;

use super::{Storage, check_range};
use crate::utils::{le_u32, le_u64, magic, pad_to, put_u32, put_u64, skip};
use crate::{Error, Result};

/// Header magic.
pub const REMAP_MAGIC: &[u8; 4] = b"RMAP";
/// Header version written by this crate.
pub const REMAP_VERSION: u32 = 0x10000;
/// Size of the header record.
pub const REMAP_HEADER_SIZE: u64 = 0x40;
/// Size of one entry record.
pub const REMAP_ENTRY_SIZE: u64 = 0x20;

/// One virtual-to-physical translation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEntry {
    pub virtual_offset: u64,
    pub physical_offset: u64,
    pub size: u64,
    pub alignment: u32,
}

impl RemapEntry {
    fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(buf);
        let virtual_offset = le_u64(&mut r)?;
        let physical_offset = le_u64(&mut r)?;
        let size = le_u64(&mut r)?;
        let alignment = le_u32(&mut r)?;
        Ok(Self {
            virtual_offset,
            physical_offset,
            size,
            alignment,
        })
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REMAP_ENTRY_SIZE as usize);
        put_u64(&mut out, self.virtual_offset);
        put_u64(&mut out, self.physical_offset);
        put_u64(&mut out, self.size);
        put_u32(&mut out, self.alignment);
        pad_to(out, REMAP_ENTRY_SIZE as usize)
    }

    pub fn virtual_end(&self) -> u64 {
        self.virtual_offset + self.size
    }

    pub fn physical_end(&self) -> u64 {
        self.physical_offset + self.size
    }
}

/// Remap storage over a header record `M`, an entry table `M` and the
/// physical base storage `B`.
#[derive(Debug)]
pub struct RemapStorage<M, B> {
    header: M,
    table: M,
    base: B,
    entries: Vec<RemapEntry>,
    capacity: u32,
}

impl<M: Storage, B: Storage> RemapStorage<M, B> {
    /// Write an empty header able to hold `capacity` entries.
    pub fn format(header: &mut M, table: &M, capacity: u32) -> Result<()> {
        if u64::from(capacity) * REMAP_ENTRY_SIZE > table.size()? {
            return Err(Error::InvalidRange);
        }
        header.write(0, &header_bytes(0, capacity))
    }

    /// Parse the header and entry table and validate the mapping.
    pub fn new(mut header: M, mut table: M, base: B) -> Result<Self> {
        let mut raw = vec![0u8; REMAP_HEADER_SIZE as usize];
        header.read(0, &mut raw)?;
        let mut r = Cursor::new(&raw);
        magic(&mut r, REMAP_MAGIC)?;
        let version = le_u32(&mut r)?;
        if version != REMAP_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let count = le_u32(&mut r)?;
        let capacity = le_u32(&mut r)?;
        skip(&mut r, 0x30)?;

        if count > capacity || u64::from(capacity) * REMAP_ENTRY_SIZE > table.size()? {
            return Err(Error::Corrupted("remap entry count exceeds table"));
        }

        let mut table_raw = vec![0u8; (u64::from(count) * REMAP_ENTRY_SIZE) as usize];
        table.read(0, &mut table_raw)?;
        let entries = table_raw
            .chunks_exact(REMAP_ENTRY_SIZE as usize)
            .map(RemapEntry::parse)
            .collect::<Result<Vec<_>>>()?;

        validate(&entries, base.size()?)?;
        debug!(
            "remap: {} entries, virtual size {:#x}",
            entries.len(),
            entries.last().map_or(0, RemapEntry::virtual_end)
        );

        Ok(Self {
            header,
            table,
            base,
            entries,
            capacity,
        })
    }

    pub fn entries(&self) -> &[RemapEntry] {
        &self.entries
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Size of the virtual address space.
    pub fn virtual_size(&self) -> u64 {
        self.entries.last().map_or(0, RemapEntry::virtual_end)
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn base_mut(&mut self) -> &mut B {
        &mut self.base
    }

    /// Lowest physical offset not covered by any entry's extent end.
    fn physical_high_water(&self) -> u64 {
        self.entries
            .iter()
            .map(RemapEntry::physical_end)
            .max()
            .unwrap_or(0)
    }

    /// Map the next `size` bytes of virtual space to `physical_offset`.
    ///
    /// Fails with [`Error::OutOfSpace`] if the entry table is full, and with
    /// [`Error::InvalidRange`] if the extent leaves the base storage or
    /// overlaps one already mapped.
    pub fn map_next(&mut self, physical_offset: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidRange);
        }
        if self.entries.len() as u32 >= self.capacity {
            return Err(Error::OutOfSpace);
        }
        let entry = RemapEntry {
            virtual_offset: self.virtual_size(),
            physical_offset,
            size,
            alignment: 1,
        };
        if entry.physical_end() > self.base.size()? {
            return Err(Error::InvalidRange);
        }
        if self.entries.iter().any(|e| {
            e.physical_offset < entry.physical_end() && entry.physical_offset < e.physical_end()
        }) {
            return Err(Error::InvalidRange);
        }

        let index = self.entries.len() as u64;
        self.table
            .write(index * REMAP_ENTRY_SIZE, &entry.to_bytes())?;
        self.entries.push(entry);
        self.header
            .write(0, &header_bytes(self.entries.len() as u32, self.capacity))?;
        debug!(
            "remap: mapped virtual {:#x}+{size:#x} to physical {physical_offset:#x}",
            entry.virtual_offset
        );
        Ok(())
    }

    /// Grow the virtual space by `size` bytes taken from unused physical
    /// space at the end of the base storage.
    pub fn extend(&mut self, size: u64) -> Result<()> {
        let physical = self.physical_high_water();
        let end = physical.checked_add(size).ok_or(Error::OutOfSpace)?;
        if end > self.base.size()? {
            return Err(Error::OutOfSpace);
        }
        self.map_next(physical, size)
    }

    /// Index of the entry containing virtual `offset`.
    fn locate(&self, offset: u64) -> Result<usize> {
        let index = self.entries.partition_point(|e| e.virtual_end() <= offset);
        if index >= self.entries.len() {
            return Err(Error::InvalidRange);
        }
        Ok(index)
    }

    /// Split `[offset, offset + len)` at entry boundaries, yielding
    /// `(physical_offset, buffer_start, chunk_len)`.
    fn extents(&self, offset: u64, len: usize) -> Result<Vec<(u64, usize, usize)>> {
        check_range(offset, len, self.virtual_size())?;
        let mut out = Vec::new();
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let entry = &self.entries[self.locate(pos)?];
            let within = pos - entry.virtual_offset;
            let n = (entry.size - within).min((len - done) as u64) as usize;
            out.push((entry.physical_offset + within, done, n));
            done += n;
        }
        Ok(out)
    }

    /// Consume the storage, returning its header, table and base.
    pub fn into_parts(self) -> (M, M, B) {
        (self.header, self.table, self.base)
    }
}

fn header_bytes(count: u32, capacity: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(REMAP_HEADER_SIZE as usize);
    out.extend_from_slice(REMAP_MAGIC);
    put_u32(&mut out, REMAP_VERSION);
    put_u32(&mut out, count);
    put_u32(&mut out, capacity);
    pad_to(out, REMAP_HEADER_SIZE as usize)
}

fn validate(entries: &[RemapEntry], base_size: u64) -> Result<()> {
    let mut expected = 0u64;
    for e in entries {
        if e.size == 0 {
            return Err(Error::Corrupted("remap entry has zero size"));
        }
        if e.virtual_offset != expected {
            return Err(Error::Corrupted("remap entries leave a gap or overlap"));
        }
        expected = e
            .virtual_offset
            .checked_add(e.size)
            .ok_or(Error::Corrupted("remap entry overflows"))?;
        if e.physical_offset.checked_add(e.size).is_none_or(|end| end > base_size) {
            return Err(Error::Corrupted("remap entry outside base storage"));
        }
    }

    let mut physical: Vec<_> = entries.iter().collect();
    physical.sort_by_key(|e| e.physical_offset);
    if physical
        .windows(2)
        .any(|w| w[0].physical_end() > w[1].physical_offset)
    {
        return Err(Error::Corrupted("remap entries overlap physically"));
    }
    Ok(())
}

impl<M: Storage, B: Storage> Storage for RemapStorage<M, B> {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        for (physical, start, n) in self.extents(offset, buf.len())? {
            self.base.read(physical, &mut buf[start..start + n])?;
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        for (physical, start, n) in self.extents(offset, buf.len())? {
            self.base.write(physical, &buf[start..start + n])?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.table.flush()?;
        self.header.flush()?;
        self.base.flush()
    }

    fn size(&self) -> Result<u64> {
        Ok(self.virtual_size())
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        let current = self.virtual_size();
        if size < current {
            return Err(Error::Unsupported("remap storage can only grow"));
        }
        if size > current {
            self.extend(size - current)?;
        }
        Ok(())
    }
}
