//! The save filesystem proper: directories and files over block chains.
//!
//! All file data, the directory table and the file table live in the
//! block-addressed base storage (the journaled data area); only the
//! allocation table lives elsewhere. Base storage is always accessed in
//! whole blocks.

use bitflags::bitflags;
use log::{debug, trace};

use super::allocation_table::{AllocationTable, ChainId, Run};
use super::tables::{
    DirectoryRecord, FileRecord, NO_RECORD, Name, RECORD_SIZE, ROOT_DIRECTORY, TableHeader,
    free_record, next_sibling, set_next_sibling,
};
use crate::storage::Storage;
use crate::utils::to_usize;
use crate::{Error, Result};

bitflags! {
    /// Access a [`SaveFile`] handle grants.
    pub struct OpenMode: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        /// Writes may extend the file.
        const APPEND = 1 << 2;
        const READ_WRITE = Self::READ.bits | Self::WRITE.bits;
        const ALL = Self::READ.bits | Self::WRITE.bits | Self::APPEND.bits;
    }
}

/// What a path names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Directory,
    File,
}

/// One entry yielded by [`SaveDataFileSystemCore::entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Absolute path, e.g. `/save/slot1.bin`.
    pub path: String,
    pub name: String,
    pub kind: EntryType,
    /// File size; zero for directories.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Found {
    Directory(u32),
    File(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Directory,
    File,
}

impl Table {
    fn chain(self) -> ChainId {
        match self {
            Table::Directory => ChainId::DirectoryTable,
            Table::File => ChainId::FileTable,
        }
    }
}

/// Split an absolute path into its components.
fn components(path: &str) -> Result<Vec<&str>> {
    let rest = path
        .strip_prefix('/')
        .ok_or(Error::InvalidPath("path must be absolute"))?;
    rest.split('/')
        .filter(|c| !c.is_empty())
        .map(|c| match c {
            "." | ".." => Err(Error::InvalidPath("relative components are not allowed")),
            c => Ok(c),
        })
        .collect()
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Directory and file operations over base storage `S` and allocation
/// table storage `F`.
#[derive(Debug)]
pub struct SaveDataFileSystemCore<S, F> {
    base: S,
    table: AllocationTable<F>,
    block_size: u64,
}

impl<S: Storage, F: Storage> SaveDataFileSystemCore<S, F> {
    /// Format an empty filesystem of `block_count` blocks: a fresh
    /// allocation table, both record tables and the root directory.
    pub fn format(base: &mut S, fat: &mut F, block_size: u64, block_count: u32) -> Result<()> {
        if block_size < RECORD_SIZE * 2 {
            return Err(Error::Parse("block size too small for table records"));
        }
        AllocationTable::format(fat, block_size, block_count)?;
        let mut core = SaveDataFileSystemCore::new(&mut *base, &mut *fat)?;
        let directories = TableHeader {
            free_head: NO_RECORD,
            allocated: 2,
        };
        core.write_raw(Table::Directory, 0, &directories.to_bytes())?;
        core.put_directory(ROOT_DIRECTORY, DirectoryRecord::new(NO_RECORD, Name::root()))?;
        let files = TableHeader {
            free_head: NO_RECORD,
            allocated: 1,
        };
        core.write_raw(Table::File, 0, &files.to_bytes())?;
        debug!("save fs: formatted {block_count} blocks");
        Ok(())
    }

    /// Open the filesystem over its base storage and allocation table.
    pub fn new(base: S, fat: F) -> Result<Self> {
        let table = AllocationTable::new(fat)?;
        let block_size = table.block_size();
        if base.size()? < u64::from(table.block_count()) * block_size {
            return Err(Error::Corrupted("data area smaller than the allocation table"));
        }
        Ok(Self {
            base,
            table,
            block_size,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn base_mut(&mut self) -> &mut S {
        &mut self.base
    }

    pub fn table(&self) -> &AllocationTable<F> {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut AllocationTable<F> {
        &mut self.table
    }

    pub fn into_parts(self) -> (S, AllocationTable<F>) {
        (self.base, self.table)
    }

    // Chain I/O

    /// `(base offset of block, offset in block, length)` for every block of
    /// the chain at `head` touched by `[offset, offset + len)`.
    fn extents(&self, head: u32, offset: u64, len: usize) -> Result<Vec<(u64, usize, usize)>> {
        let bs = self.block_size;
        let runs = self.table.runs(ChainId::Data(head))?;
        let mut runs = runs.iter();
        let mut current = runs.next();
        let mut first = 0u64;

        let end = offset + len as u64;
        let mut pos = offset;
        let mut out = Vec::new();
        while pos < end {
            let logical = pos / bs;
            let run = loop {
                let run = current.ok_or(Error::Corrupted("chain shorter than its data"))?;
                if logical < first + u64::from(run.len) {
                    break run;
                }
                first += u64::from(run.len);
                current = runs.next();
            };
            let physical = u64::from(run.start) + (logical - first);
            let within = pos % bs;
            let n = (bs - within).min(end - pos);
            out.push((physical * bs, to_usize(within)?, to_usize(n)?));
            pos += n;
        }
        Ok(out)
    }

    fn read_chain(&mut self, head: u32, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bs = to_usize(self.block_size)?;
        let mut scratch = Vec::new();
        let mut done = 0usize;
        for (block, within, n) in self.extents(head, offset, buf.len())? {
            let out = &mut buf[done..done + n];
            if n == bs {
                self.base.read(block, out)?;
            } else {
                scratch.resize(bs, 0);
                self.base.read(block, &mut scratch)?;
                out.copy_from_slice(&scratch[within..within + n]);
            }
            done += n;
        }
        Ok(())
    }

    fn write_chain(&mut self, head: u32, offset: u64, buf: &[u8]) -> Result<()> {
        let bs = to_usize(self.block_size)?;
        let mut scratch = Vec::new();
        let mut done = 0usize;
        for (block, within, n) in self.extents(head, offset, buf.len())? {
            let data = &buf[done..done + n];
            if n == bs {
                self.base.write(block, data)?;
            } else {
                scratch.resize(bs, 0);
                self.base.read(block, &mut scratch)?;
                scratch[within..within + n].copy_from_slice(data);
                self.base.write(block, &scratch)?;
            }
            done += n;
        }
        Ok(())
    }

    // Records

    fn table_head(&self, table: Table) -> Result<u32> {
        self.table
            .head(table.chain())
            .ok_or(Error::Corrupted("record table has no blocks"))
    }

    fn capacity(&self, table: Table) -> Result<u32> {
        let blocks = u64::from(self.table.chain_len(table.chain())?);
        Ok((blocks * self.block_size / RECORD_SIZE) as u32)
    }

    fn read_raw(&mut self, table: Table, index: u32) -> Result<[u8; RECORD_SIZE as usize]> {
        let head = self.table_head(table)?;
        let mut raw = [0u8; RECORD_SIZE as usize];
        self.read_chain(head, u64::from(index) * RECORD_SIZE, &mut raw)?;
        Ok(raw)
    }

    fn write_raw(&mut self, table: Table, index: u32, raw: &[u8; RECORD_SIZE as usize]) -> Result<()> {
        let head = self.table_head(table)?;
        self.write_chain(head, u64::from(index) * RECORD_SIZE, raw)
    }

    fn directory(&mut self, index: u32) -> Result<DirectoryRecord> {
        Ok(DirectoryRecord::parse(&self.read_raw(Table::Directory, index)?))
    }

    fn put_directory(&mut self, index: u32, rec: DirectoryRecord) -> Result<()> {
        self.write_raw(Table::Directory, index, &rec.to_bytes())
    }

    fn file(&mut self, index: u32) -> Result<FileRecord> {
        Ok(FileRecord::parse(&self.read_raw(Table::File, index)?))
    }

    fn put_file(&mut self, index: u32, rec: FileRecord) -> Result<()> {
        self.write_raw(Table::File, index, &rec.to_bytes())
    }

    /// Take a record slot, growing the table by a block when it is full.
    fn allocate_record(&mut self, table: Table) -> Result<u32> {
        let mut header = TableHeader::parse(&self.read_raw(table, 0)?);
        let index = if header.free_head != NO_RECORD {
            let index = header.free_head;
            header.free_head = next_sibling(&self.read_raw(table, index)?);
            index
        } else {
            if header.allocated >= self.capacity(table)? {
                let head = self.table_head(table)?;
                self.table.extend(head, 1)?;
                trace!("save fs: {table:?} table grown by one block");
            }
            header.allocated += 1;
            header.allocated - 1
        };
        self.write_raw(table, 0, &header.to_bytes())?;
        Ok(index)
    }

    fn release_record(&mut self, table: Table, index: u32) -> Result<()> {
        let mut header = TableHeader::parse(&self.read_raw(table, 0)?);
        self.write_raw(table, index, &free_record(header.free_head))?;
        header.free_head = index;
        self.write_raw(table, 0, &header.to_bytes())
    }

    /// Follow a sibling list, failing if it runs longer than the table.
    fn siblings(&mut self, table: Table, first: u32) -> Result<Vec<u32>> {
        let limit = self.capacity(table)? as usize;
        let mut out = Vec::new();
        let mut at = first;
        while at != NO_RECORD {
            if out.len() >= limit {
                return Err(Error::Corrupted("sibling list contains a cycle"));
            }
            out.push(at);
            at = next_sibling(&self.read_raw(table, at)?);
        }
        Ok(out)
    }

    fn child(&mut self, dir: u32, name: &Name) -> Result<Option<Found>> {
        let rec = self.directory(dir)?;
        for at in self.siblings(Table::Directory, rec.first_directory)? {
            if self.directory(at)?.name == *name {
                return Ok(Some(Found::Directory(at)));
            }
        }
        for at in self.siblings(Table::File, rec.first_file)? {
            if self.file(at)?.name == *name {
                return Ok(Some(Found::File(at)));
            }
        }
        Ok(None)
    }

    fn walk(&mut self, comps: &[&str]) -> Result<Found> {
        let mut current = Found::Directory(ROOT_DIRECTORY);
        for c in comps {
            let Found::Directory(dir) = current else {
                return Err(Error::NotFound);
            };
            current = self.child(dir, &Name::new(c)?)?.ok_or(Error::NotFound)?;
        }
        Ok(current)
    }

    fn find(&mut self, path: &str) -> Result<Found> {
        let comps = components(path)?;
        self.walk(&comps)
    }

    fn find_directory(&mut self, path: &str) -> Result<u32> {
        match self.find(path)? {
            Found::Directory(index) => Ok(index),
            Found::File(_) => Err(Error::NotFound),
        }
    }

    /// Resolve everything but the last component, which must not be the
    /// root.
    fn parent_and_name(&mut self, path: &str) -> Result<(u32, Name)> {
        let mut comps = components(path)?;
        let last = comps
            .pop()
            .ok_or(Error::InvalidPath("path names the root directory"))?;
        let name = Name::new(last)?;
        match self.walk(&comps)? {
            Found::Directory(parent) => Ok((parent, name)),
            Found::File(_) => Err(Error::NotFound),
        }
    }

    /// Remove record `index` from its parent's child list.
    fn unlink(&mut self, table: Table, parent: u32, index: u32, next: u32) -> Result<()> {
        let mut rec = self.directory(parent)?;
        let first = match table {
            Table::Directory => &mut rec.first_directory,
            Table::File => &mut rec.first_file,
        };
        if *first == index {
            *first = next;
            return self.put_directory(parent, rec);
        }
        let first = *first;
        for at in self.siblings(table, first)? {
            let mut raw = self.read_raw(table, at)?;
            if next_sibling(&raw) == index {
                set_next_sibling(&mut raw, next);
                return self.write_raw(table, at, &raw);
            }
        }
        Err(Error::Corrupted("entry missing from its parent"))
    }

    // Files

    fn resize(&mut self, index: u32, size: u64) -> Result<()> {
        let mut rec = self.file(index)?;
        let want = u32::try_from(size.div_ceil(self.block_size)).map_err(|_| Error::OutOfSpace)?;
        let start = rec.start_block;
        let have = match start {
            Some(head) => self.table.chain_len(ChainId::Data(head))?,
            None => 0,
        };
        match start {
            _ if want == have => {}
            None => rec.start_block = Some(self.table.allocate(want)?),
            Some(head) if want == 0 => {
                self.table.free(head)?;
                rec.start_block = None;
            }
            Some(head) if want > have => self.table.extend(head, want - have)?,
            Some(head) => self.table.truncate(head, want)?,
        }
        rec.size = size;
        self.put_file(index, rec)
    }

    /// Create an empty directory.
    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.parent_and_name(path)?;
        if self.child(parent, &name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let index = self.allocate_record(Table::Directory)?;
        let mut p = self.directory(parent)?;
        let mut rec = DirectoryRecord::new(parent, name);
        rec.next_sibling = p.first_directory;
        self.put_directory(index, rec)?;
        p.first_directory = index;
        self.put_directory(parent, p)?;
        debug!("save fs: created directory {path}");
        Ok(())
    }

    /// Create a file of `size` bytes. Its blocks are allocated but not
    /// cleared.
    pub fn create_file(&mut self, path: &str, size: u64) -> Result<()> {
        let (parent, name) = self.parent_and_name(path)?;
        if self.child(parent, &name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        let index = self.allocate_record(Table::File)?;
        let mut p = self.directory(parent)?;
        let mut rec = FileRecord::new(parent, name);
        rec.next_sibling = p.first_file;
        self.put_file(index, rec)?;
        p.first_file = index;
        self.put_directory(parent, p)?;

        if let Err(e) = self.resize(index, size) {
            self.unlink(Table::File, parent, index, rec.next_sibling)?;
            self.release_record(Table::File, index)?;
            return Err(e);
        }
        debug!("save fs: created file {path} ({size:#x} bytes)");
        Ok(())
    }

    /// Open a file for the operations `mode` allows.
    pub fn open_file(&mut self, path: &str, mode: OpenMode) -> Result<SaveFile<'_, S, F>> {
        if !mode.intersects(OpenMode::READ_WRITE) {
            return Err(Error::InvalidOpenMode);
        }
        let (parent, name) = self.parent_and_name(path)?;
        match self.child(parent, &name)? {
            Some(Found::File(index)) => Ok(SaveFile {
                fs: self,
                index,
                mode,
            }),
            _ => Err(Error::NotFound),
        }
    }

    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        let (parent, name) = self.parent_and_name(path)?;
        let Some(Found::File(index)) = self.child(parent, &name)? else {
            return Err(Error::NotFound);
        };
        let rec = self.file(index)?;
        if let Some(head) = rec.start_block {
            self.table.free(head)?;
        }
        self.unlink(Table::File, parent, index, rec.next_sibling)?;
        self.release_record(Table::File, index)?;
        debug!("save fs: deleted file {path}");
        Ok(())
    }

    /// Delete an empty directory.
    pub fn delete_directory(&mut self, path: &str) -> Result<()> {
        let index = self.find_directory(path)?;
        if index == ROOT_DIRECTORY {
            return Err(Error::InvalidPath("cannot delete the root directory"));
        }
        let rec = self.directory(index)?;
        if rec.first_directory != NO_RECORD || rec.first_file != NO_RECORD {
            return Err(Error::NotEmpty);
        }
        self.unlink(Table::Directory, rec.parent, index, rec.next_sibling)?;
        self.release_record(Table::Directory, index)?;
        debug!("save fs: deleted directory {path}");
        Ok(())
    }

    /// Delete a directory and everything below it.
    pub fn delete_directory_recursively(&mut self, path: &str) -> Result<()> {
        let index = self.find_directory(path)?;
        if index == ROOT_DIRECTORY {
            return Err(Error::InvalidPath("cannot delete the root directory"));
        }
        self.clean(index)?;
        self.delete_directory(path)
    }

    /// Delete everything below a directory, keeping the directory itself.
    pub fn clean_directory_recursively(&mut self, path: &str) -> Result<()> {
        let index = self.find_directory(path)?;
        self.clean(index)
    }

    fn clean(&mut self, dir: u32) -> Result<()> {
        loop {
            let mut rec = self.directory(dir)?;
            if rec.first_file != NO_RECORD {
                let index = rec.first_file;
                let file = self.file(index)?;
                if let Some(head) = file.start_block {
                    self.table.free(head)?;
                }
                rec.first_file = file.next_sibling;
                self.put_directory(dir, rec)?;
                self.release_record(Table::File, index)?;
            } else if rec.first_directory != NO_RECORD {
                let index = rec.first_directory;
                self.clean(index)?;
                rec.first_directory = self.directory(index)?.next_sibling;
                self.put_directory(dir, rec)?;
                self.release_record(Table::Directory, index)?;
            } else {
                return Ok(());
            }
        }
    }

    pub fn rename_file(&mut self, from: &str, to: &str) -> Result<()> {
        let (src_parent, src_name) = self.parent_and_name(from)?;
        let Some(Found::File(index)) = self.child(src_parent, &src_name)? else {
            return Err(Error::NotFound);
        };
        let (dst_parent, dst_name) = self.parent_and_name(to)?;
        if (src_parent, src_name) == (dst_parent, dst_name) {
            return Ok(());
        }
        if self.child(dst_parent, &dst_name)?.is_some() {
            return Err(Error::AlreadyExists);
        }

        let mut rec = self.file(index)?;
        self.unlink(Table::File, src_parent, index, rec.next_sibling)?;
        let mut p = self.directory(dst_parent)?;
        rec.parent = dst_parent;
        rec.name = dst_name;
        rec.next_sibling = p.first_file;
        self.put_file(index, rec)?;
        p.first_file = index;
        self.put_directory(dst_parent, p)?;
        debug!("save fs: renamed file {from} -> {to}");
        Ok(())
    }

    pub fn rename_directory(&mut self, from: &str, to: &str) -> Result<()> {
        let (src_parent, src_name) = self.parent_and_name(from)?;
        let Some(Found::Directory(index)) = self.child(src_parent, &src_name)? else {
            return Err(Error::NotFound);
        };
        let (dst_parent, dst_name) = self.parent_and_name(to)?;
        if (src_parent, src_name) == (dst_parent, dst_name) {
            return Ok(());
        }
        if self.child(dst_parent, &dst_name)?.is_some() {
            return Err(Error::AlreadyExists);
        }
        // The destination may not lie inside the directory being moved.
        let mut at = dst_parent;
        let mut hops = self.capacity(Table::Directory)?;
        while at != ROOT_DIRECTORY {
            if at == index {
                return Err(Error::InvalidPath("cannot move a directory into itself"));
            }
            if hops == 0 {
                return Err(Error::Corrupted("directory parent links form a cycle"));
            }
            hops -= 1;
            at = self.directory(at)?.parent;
        }

        let mut rec = self.directory(index)?;
        self.unlink(Table::Directory, src_parent, index, rec.next_sibling)?;
        let mut p = self.directory(dst_parent)?;
        rec.parent = dst_parent;
        rec.name = dst_name;
        rec.next_sibling = p.first_directory;
        self.put_directory(index, rec)?;
        p.first_directory = index;
        self.put_directory(dst_parent, p)?;
        debug!("save fs: renamed directory {from} -> {to}");
        Ok(())
    }

    pub fn get_entry_type(&mut self, path: &str) -> Result<EntryType> {
        Ok(match self.find(path)? {
            Found::Directory(_) => EntryType::Directory,
            Found::File(_) => EntryType::File,
        })
    }

    /// Everything below `path`, depth first, parents before children.
    pub fn entries(&mut self, path: &str) -> Result<Entries<'_, S, F>> {
        let comps = components(path)?;
        let Found::Directory(dir) = self.walk(&comps)? else {
            return Err(Error::NotFound);
        };
        let prefix = format!("/{}", comps.join("/"));
        let rec = self.directory(dir)?;
        let budget = self.capacity(Table::Directory)? + self.capacity(Table::File)?;

        let mut stack = Vec::new();
        if rec.first_directory != NO_RECORD {
            stack.push((prefix.clone(), Found::Directory(rec.first_directory)));
        }
        if rec.first_file != NO_RECORD {
            stack.push((prefix, Found::File(rec.first_file)));
        }
        Ok(Entries {
            fs: self,
            stack,
            budget,
        })
    }

    /// Bytes available for new data.
    pub fn free_space_size(&self) -> Result<u64> {
        Ok(u64::from(self.table.free_block_count()?) * self.block_size)
    }

    /// Bytes the data area holds in total, tables included.
    pub fn total_space_size(&self) -> u64 {
        u64::from(self.table.block_count()) * self.block_size
    }

    /// The runs of blocks a file occupies.
    pub fn file_chain_runs(&mut self, path: &str) -> Result<Vec<Run>> {
        let Found::File(index) = self.find(path)? else {
            return Err(Error::NotFound);
        };
        match self.file(index)?.start_block {
            Some(head) => self.table.runs(ChainId::Data(head)),
            None => Ok(Vec::new()),
        }
    }

    /// Runs of the directory and file tables.
    pub fn table_chain_runs(&self) -> Result<(Vec<Run>, Vec<Run>)> {
        Ok((
            self.table.runs(ChainId::DirectoryTable)?,
            self.table.runs(ChainId::FileTable)?,
        ))
    }
}

/// An open file. Borrows the filesystem for its lifetime.
pub struct SaveFile<'a, S, F> {
    fs: &'a mut SaveDataFileSystemCore<S, F>,
    index: u32,
    mode: OpenMode,
}

impl<S: Storage, F: Storage> SaveFile<'_, S, F> {
    fn require(&self, mode: OpenMode) -> Result<()> {
        if self.mode.contains(mode) {
            Ok(())
        } else {
            Err(Error::InvalidOpenMode)
        }
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn size(&mut self) -> Result<u64> {
        Ok(self.fs.file(self.index)?.size)
    }

    /// Read up to `buf.len()` bytes at `offset`; returns the count read,
    /// which is short only at end of file.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.require(OpenMode::READ)?;
        let rec = self.fs.file(self.index)?;
        if offset >= rec.size {
            return Ok(0);
        }
        let n = (rec.size - offset).min(buf.len() as u64) as usize;
        if let Some(head) = rec.start_block {
            self.fs.read_chain(head, offset, &mut buf[..n])?;
        }
        Ok(n)
    }

    /// Write all of `buf` at `offset`. Writing past the end needs
    /// [`OpenMode::APPEND`].
    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.require(OpenMode::WRITE)?;
        let end = offset.checked_add(buf.len() as u64).ok_or(Error::InvalidRange)?;
        if end > self.size()? {
            self.require(OpenMode::APPEND)?;
            self.fs.resize(self.index, end)?;
        }
        if buf.is_empty() {
            return Ok(());
        }
        let head = self
            .fs
            .file(self.index)?
            .start_block
            .ok_or(Error::Corrupted("sized file has no blocks"))?;
        self.fs.write_chain(head, offset, buf)
    }

    pub fn set_size(&mut self, size: u64) -> Result<()> {
        self.require(OpenMode::WRITE)?;
        self.fs.resize(self.index, size)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.fs.base.flush()
    }
}

/// Lazy depth-first walk returned by [`SaveDataFileSystemCore::entries`].
pub struct Entries<'a, S, F> {
    fs: &'a mut SaveDataFileSystemCore<S, F>,
    stack: Vec<(String, Found)>,
    budget: u32,
}

impl<S: Storage, F: Storage> Entries<'_, S, F> {
    fn step(&mut self, parent: String, found: Found) -> Result<DirectoryEntry> {
        if self.budget == 0 {
            return Err(Error::Corrupted("directory tree contains a cycle"));
        }
        self.budget -= 1;
        match found {
            Found::File(index) => {
                let rec = self.fs.file(index)?;
                let name = rec.name.decode();
                let path = join(&parent, &name);
                if rec.next_sibling != NO_RECORD {
                    self.stack.push((parent, Found::File(rec.next_sibling)));
                }
                Ok(DirectoryEntry {
                    path,
                    name,
                    kind: EntryType::File,
                    size: rec.size,
                })
            }
            Found::Directory(index) => {
                let rec = self.fs.directory(index)?;
                let name = rec.name.decode();
                let path = join(&parent, &name);
                if rec.next_sibling != NO_RECORD {
                    self.stack.push((parent, Found::Directory(rec.next_sibling)));
                }
                if rec.first_directory != NO_RECORD {
                    self.stack.push((path.clone(), Found::Directory(rec.first_directory)));
                }
                if rec.first_file != NO_RECORD {
                    self.stack.push((path.clone(), Found::File(rec.first_file)));
                }
                Ok(DirectoryEntry {
                    path,
                    name,
                    kind: EntryType::Directory,
                    size: 0,
                })
            }
        }
    }
}

impl<S: Storage, F: Storage> Iterator for Entries<'_, S, F> {
    type Item = Result<DirectoryEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let (parent, found) = self.stack.pop()?;
        let entry = self.step(parent, found);
        if entry.is_err() {
            self.stack.clear();
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::allocation_table::table_size;
    use crate::storage::MemoryStorage;

    const BS: u64 = 0x200;
    const BLOCKS: u32 = 32;

    type Core = SaveDataFileSystemCore<MemoryStorage, MemoryStorage>;

    fn core() -> Core {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut base = MemoryStorage::new((BS * u64::from(BLOCKS)) as usize);
        let mut fat = MemoryStorage::new(table_size(BLOCKS) as usize);
        SaveDataFileSystemCore::format(&mut base, &mut fat, BS, BLOCKS).unwrap();
        SaveDataFileSystemCore::new(base, fat).unwrap()
    }

    fn paths(fs: &mut Core, root: &str) -> Vec<String> {
        fs.entries(root)
            .unwrap()
            .map(|e| e.unwrap().path)
            .collect()
    }

    #[test]
    fn create_write_read() {
        let mut fs = core();
        fs.create_directory("/save").unwrap();
        fs.create_file("/save/slot1.bin", 0x500).unwrap();
        assert_eq!(fs.get_entry_type("/save").unwrap(), EntryType::Directory);
        assert_eq!(fs.get_entry_type("/save/slot1.bin").unwrap(), EntryType::File);

        let data: Vec<u8> = (0..0x500u32).map(|i| (i * 7) as u8).collect();
        let mut f = fs.open_file("/save/slot1.bin", OpenMode::READ_WRITE).unwrap();
        f.write(0, &data).unwrap();
        let mut back = vec![0u8; 0x600];
        assert_eq!(f.read(0, &mut back).unwrap(), 0x500);
        assert_eq!(&back[..0x500], &data[..]);
        assert_eq!(f.read(0x4F0, &mut back).unwrap(), 0x10);
        assert_eq!(f.read(0x500, &mut back).unwrap(), 0);

        assert_eq!(fs.file_chain_runs("/save/slot1.bin").unwrap().len(), 1);
        assert_eq!(fs.free_space_size().unwrap(), (u64::from(BLOCKS) - 2 - 3) * BS);
    }

    #[test]
    fn open_mode_is_enforced() {
        let mut fs = core();
        fs.create_file("/a", 0x10).unwrap();
        let mut ro = fs.open_file("/a", OpenMode::READ).unwrap();
        assert!(matches!(ro.write(0, &[1]), Err(Error::InvalidOpenMode)));

        let mut rw = fs.open_file("/a", OpenMode::READ_WRITE).unwrap();
        assert!(matches!(rw.write(0x8, &[1; 0x10]), Err(Error::InvalidOpenMode)));

        let mut append = fs.open_file("/a", OpenMode::ALL).unwrap();
        append.write(0x8, &[1; 0x400]).unwrap();
        assert_eq!(append.size().unwrap(), 0x408);

        assert!(matches!(fs.open_file("/a", OpenMode::APPEND), Err(Error::InvalidOpenMode)));
        assert!(matches!(fs.open_file("/missing", OpenMode::READ), Err(Error::NotFound)));
    }

    #[test]
    fn path_errors() {
        let mut fs = core();
        fs.create_directory("/d").unwrap();
        assert!(matches!(fs.create_directory("/d"), Err(Error::AlreadyExists)));
        assert!(matches!(fs.create_file("/d", 0), Err(Error::AlreadyExists)));
        assert!(matches!(fs.create_file("/x/y", 0), Err(Error::NotFound)));
        assert!(matches!(fs.create_file("relative", 0), Err(Error::InvalidPath(_))));
        assert!(matches!(fs.create_directory("/"), Err(Error::InvalidPath(_))));
        let long = format!("/{}", "n".repeat(0x41));
        assert!(matches!(fs.create_file(&long, 0), Err(Error::InvalidPath(_))));
        fs.create_file("/d/f", 0).unwrap();
        assert!(matches!(fs.create_file("/d/f/g", 0), Err(Error::NotFound)));
        assert!(matches!(fs.delete_directory("/d"), Err(Error::NotEmpty)));
        assert!(matches!(fs.delete_directory("/"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn delete_returns_blocks() {
        let mut fs = core();
        let free = fs.free_space_size().unwrap();
        fs.create_file("/big", 0x1000).unwrap();
        assert_eq!(fs.free_space_size().unwrap(), free - 0x1000);
        fs.delete_file("/big").unwrap();
        assert_eq!(fs.free_space_size().unwrap(), free);
        assert!(matches!(fs.get_entry_type("/big"), Err(Error::NotFound)));
        assert!(matches!(fs.create_file("/huge", 0x10_0000), Err(Error::OutOfSpace)));
        assert!(matches!(fs.get_entry_type("/huge"), Err(Error::NotFound)));
    }

    #[test]
    fn tables_grow_past_one_block() {
        let mut fs = core();
        for i in 0..20 {
            fs.create_file(&format!("/f{i}"), 0).unwrap();
        }
        for i in 0..12 {
            fs.create_directory(&format!("/d{i}")).unwrap();
        }
        let (dirs, files) = fs.table_chain_runs().unwrap();
        assert!(dirs.iter().map(|r| r.len).sum::<u32>() > 1);
        assert!(files.iter().map(|r| r.len).sum::<u32>() > 1);
        assert_eq!(fs.entries("/").unwrap().count(), 32);

        // Freed records are reused.
        fs.delete_file("/f3").unwrap();
        fs.create_file("/again", 0).unwrap();
        assert_eq!(fs.entries("/").unwrap().count(), 32);
    }

    #[test]
    fn recursive_delete_and_clean() {
        let mut fs = core();
        fs.create_directory("/a").unwrap();
        fs.create_directory("/a/b").unwrap();
        fs.create_directory("/a/b/c").unwrap();
        fs.create_file("/a/b/c/x", 0x300).unwrap();
        fs.create_file("/a/y", 0x10).unwrap();
        let free = fs.free_space_size().unwrap();

        fs.clean_directory_recursively("/a/b").unwrap();
        assert_eq!(paths(&mut fs, "/a"), vec!["/a/y", "/a/b"]);
        assert_eq!(fs.free_space_size().unwrap(), free + 2 * BS);

        fs.delete_directory_recursively("/a").unwrap();
        assert!(paths(&mut fs, "/").is_empty());
    }

    #[test]
    fn rename_rules() {
        let mut fs = core();
        fs.create_directory("/a").unwrap();
        fs.create_directory("/a/b").unwrap();
        fs.create_directory("/c").unwrap();
        fs.create_file("/a/f", 4).unwrap();
        fs.open_file("/a/f", OpenMode::WRITE).unwrap().write(0, b"abcd").unwrap();

        fs.rename_file("/a/f", "/c/g").unwrap();
        let mut buf = [0u8; 4];
        fs.open_file("/c/g", OpenMode::READ).unwrap().read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert!(matches!(fs.get_entry_type("/a/f"), Err(Error::NotFound)));

        assert!(matches!(fs.rename_directory("/a", "/c"), Err(Error::AlreadyExists)));
        assert!(matches!(fs.rename_directory("/a", "/a/b/z"), Err(Error::InvalidPath(_))));
        fs.rename_directory("/a", "/c/a2").unwrap();
        assert_eq!(paths(&mut fs, "/"), vec!["/c", "/c/g", "/c/a2", "/c/a2/b"]);
    }

    #[test]
    fn rename_stops_at_a_parent_cycle() {
        let mut fs = core();
        fs.create_directory("/a").unwrap();
        fs.create_directory("/a/b").unwrap();
        fs.create_directory("/c").unwrap();
        let Found::Directory(a) = fs.find("/a").unwrap() else {
            panic!("/a is a directory");
        };
        let Found::Directory(b) = fs.find("/a/b").unwrap() else {
            panic!("/a/b is a directory");
        };
        let mut rec = fs.directory(a).unwrap();
        rec.parent = b;
        fs.put_directory(a, rec).unwrap();

        assert!(matches!(
            fs.rename_directory("/c", "/a/b/z"),
            Err(Error::Corrupted(_))
        ));
        assert_eq!(fs.get_entry_type("/c").unwrap(), EntryType::Directory);
    }

    #[test]
    fn resize_shrinks_and_grows_chain() {
        let mut fs = core();
        fs.create_file("/f", 0).unwrap();
        assert!(fs.file_chain_runs("/f").unwrap().is_empty());
        let mut f = fs.open_file("/f", OpenMode::WRITE).unwrap();
        f.set_size(0x801).unwrap();
        f.set_size(0x200).unwrap();
        assert_eq!(fs.file_chain_runs("/f").unwrap(), vec![Run { start: 2, len: 1 }]);
        fs.open_file("/f", OpenMode::WRITE).unwrap().set_size(0).unwrap();
        assert!(fs.file_chain_runs("/f").unwrap().is_empty());
    }
}
