//! The assembled save container.
//!
//! [`SaveDataFileSystem`] parses the header, builds every storage layer in
//! dependency order and exposes the result as one filesystem rooted at `/`.
//!
//! ```text
//! container
//!  ├ data remap ── journal data ── journal ── hash tree ── sectors ── core
//!  │           └── duplex L1/data ── metadata remap
//!  │                                  ├ journal map + bitmaps
//!  │                                  ├ save tree hash levels
//!  │                                  └ allocation table [+ its hash levels]
//!  └ header: remap/journal headers, master hashes, duplex master bitmaps
//! ```
//!
//! The header region is staged in memory and only reaches the container
//! when [`commit`](SaveDataFileSystem::commit) writes it; that single write
//! is the commit point. Until then every other write lands where the
//! committed state does not look: journal shadows, and the duplex copies
//! the committed master bitmap does not select. Uncommitted writes go to
//! the inactive master bitmap, and the commit flips `duplex_index` to it.
//! A container dropped without a commit, or torn down by a crash, therefore
//! reopens in its last committed state, and
//! [`rollback`](SaveDataFileSystem::rollback) is a reload of that state.

use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use log::{debug, info, warn};

use super::allocation_table::{AllocationTable, ChainId, Run};
use super::core::{DirectoryEntry, Entries, EntryType, OpenMode, SaveDataFileSystemCore, SaveFile};
use super::create::{REMAP_CAPACITY, SaveDataCreateInfo};
use super::header::{
    DATA_REMAP_HEADER_OFFSET, ExtraData, FsLayout, HASHED_REGION_START, HEADER_SIZE,
    IvfcHeader, JOURNAL_HEADER_OFFSET, LAYOUT_OFFSET, LAYOUT_SIZE, META_REMAP_HEADER_OFFSET,
    SaveHeader,
};
use crate::crypto::{aes_cmac, sha256};
use crate::keys::KeySet;
use crate::storage::journal::{JOURNAL_HEADER_SIZE, JournalParts};
use crate::storage::remap::REMAP_HEADER_SIZE;
use crate::storage::{
    DynStorage, HierarchicalDuplexStorage, HierarchicalIntegrityVerificationStorage,
    IntegrityCheckLevel, JournalStorage, MemoryStorage, RemapStorage, SectorStorage,
    SharedStorage, Storage, SubStorage, Validity, fill_zero, read_vec,
};
use crate::utils::to_usize;
use crate::{Error, Result};

type Staged = SharedStorage<MemoryStorage>;
type DataRemap<S> = RemapStorage<DynStorage, SubStorage<SharedStorage<S>>>;
type DataSpace<S> = SharedStorage<DataRemap<S>>;
type MetaDuplex<S> = HierarchicalDuplexStorage<SubStorage<Staged>, SubStorage<DataSpace<S>>>;
type MetaRemap<S> = RemapStorage<DynStorage, MetaDuplex<S>>;
type MetaSpace<S> = SharedStorage<MetaRemap<S>>;

/// The journal over its physical blocks in the data remap space.
pub type SaveJournal = JournalStorage<DynStorage, DynStorage>;

/// Block-addressed storage the filesystem core runs on.
pub type SaveDataStorage = SectorStorage<HierarchicalIntegrityVerificationStorage<SaveJournal>>;

/// Storage holding the allocation table: plain before layout version
/// 0x50000, hash-verified from it on.
pub enum FatStorage {
    Plain(DynStorage),
    Verified(HierarchicalIntegrityVerificationStorage),
}

impl fmt::Debug for FatStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatStorage::Plain(_) => f.write_str("Plain"),
            FatStorage::Verified(tree) => f.debug_tuple("Verified").field(tree).finish(),
        }
    }
}

impl FatStorage {
    fn tree_mut(&mut self) -> Option<&mut HierarchicalIntegrityVerificationStorage> {
        match self {
            FatStorage::Plain(_) => None,
            FatStorage::Verified(tree) => Some(tree),
        }
    }
}

impl Storage for FatStorage {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            FatStorage::Plain(s) => s.read(offset, buf),
            FatStorage::Verified(s) => s.read(offset, buf),
        }
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            FatStorage::Plain(s) => s.write(offset, buf),
            FatStorage::Verified(s) => s.write(offset, buf),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match self {
            FatStorage::Plain(s) => s.flush(),
            FatStorage::Verified(s) => s.flush(),
        }
    }

    fn size(&self) -> Result<u64> {
        match self {
            FatStorage::Plain(s) => s.size(),
            FatStorage::Verified(s) => s.size(),
        }
    }

    fn set_size(&mut self, size: u64) -> Result<()> {
        match self {
            FatStorage::Plain(s) => s.set_size(size),
            FatStorage::Verified(s) => s.set_size(size),
        }
    }
}

/// Result of [`SaveDataFileSystem::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Layout hash over header `[0x300, 0x4000)`.
    pub header_hash: Validity,
    /// Save data tree, top hash level first, data level last.
    pub save_levels: Vec<Validity>,
    /// Allocation table tree, when the layout has one.
    pub fat_levels: Option<Vec<Validity>>,
}

impl VerifyReport {
    pub fn is_valid(&self) -> bool {
        self.header_hash == Validity::Valid
            && self.save_levels.iter().all(|&v| v == Validity::Valid)
            && self
                .fat_levels
                .iter()
                .flatten()
                .all(|&v| v == Validity::Valid)
    }
}

/// One raw layer of the storage stack, as written by
/// [`SaveDataFileSystem::export_debug`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawLayer {
    DataRemapHeader,
    DataRemapEntries,
    /// Physical bytes behind the data remap space.
    DataRemapBase,
    MetaRemapHeader,
    MetaRemapEntries,
    /// The duplex view the metadata remap space is carved from.
    MetaRemapBase,
    JournalHeader,
    JournalMap,
    JournalModifiedPhysical,
    JournalModifiedVirtual,
    JournalFree,
    /// Physical journal blocks, shadows included.
    JournalData,
    /// The journal's virtual blocks, as the filesystem core sees them.
    SaveData,
    SaveMasterHash,
    SaveL1Hash,
    SaveL2Hash,
    SaveL3Hash,
    AllocationTable,
    FatMasterHash,
    FatL1Hash,
    FatL2Hash,
    DuplexMasterA,
    DuplexMasterB,
    DuplexL1A,
    DuplexL1B,
    DuplexDataA,
    DuplexDataB,
}

impl RawLayer {
    pub const ALL: [RawLayer; 27] = [
        RawLayer::DataRemapHeader,
        RawLayer::DataRemapEntries,
        RawLayer::DataRemapBase,
        RawLayer::MetaRemapHeader,
        RawLayer::MetaRemapEntries,
        RawLayer::MetaRemapBase,
        RawLayer::JournalHeader,
        RawLayer::JournalMap,
        RawLayer::JournalModifiedPhysical,
        RawLayer::JournalModifiedVirtual,
        RawLayer::JournalFree,
        RawLayer::JournalData,
        RawLayer::SaveData,
        RawLayer::SaveMasterHash,
        RawLayer::SaveL1Hash,
        RawLayer::SaveL2Hash,
        RawLayer::SaveL3Hash,
        RawLayer::AllocationTable,
        RawLayer::FatMasterHash,
        RawLayer::FatL1Hash,
        RawLayer::FatL2Hash,
        RawLayer::DuplexMasterA,
        RawLayer::DuplexMasterB,
        RawLayer::DuplexL1A,
        RawLayer::DuplexL1B,
        RawLayer::DuplexDataA,
        RawLayer::DuplexDataB,
    ];

    /// `(directory, file)` the layer is dumped to.
    pub fn dump_path(self) -> (&'static str, &'static str) {
        match self {
            RawLayer::DataRemapHeader => ("data_remap", "header"),
            RawLayer::DataRemapEntries => ("data_remap", "entries"),
            RawLayer::DataRemapBase => ("data_remap", "base"),
            RawLayer::MetaRemapHeader => ("meta_remap", "header"),
            RawLayer::MetaRemapEntries => ("meta_remap", "entries"),
            RawLayer::MetaRemapBase => ("meta_remap", "base"),
            RawLayer::JournalHeader => ("journal", "header"),
            RawLayer::JournalMap => ("journal", "map"),
            RawLayer::JournalModifiedPhysical => ("journal", "modified_physical"),
            RawLayer::JournalModifiedVirtual => ("journal", "modified_virtual"),
            RawLayer::JournalFree => ("journal", "free"),
            RawLayer::JournalData => ("journal", "data"),
            RawLayer::SaveData => ("save", "data"),
            RawLayer::SaveMasterHash => ("save", "master_hash"),
            RawLayer::SaveL1Hash => ("save", "l1_hash"),
            RawLayer::SaveL2Hash => ("save", "l2_hash"),
            RawLayer::SaveL3Hash => ("save", "l3_hash"),
            RawLayer::AllocationTable => ("save", "allocation_table"),
            RawLayer::FatMasterHash => ("save", "fat_master_hash"),
            RawLayer::FatL1Hash => ("save", "fat_l1_hash"),
            RawLayer::FatL2Hash => ("save", "fat_l2_hash"),
            RawLayer::DuplexMasterA => ("duplex", "master_a"),
            RawLayer::DuplexMasterB => ("duplex", "master_b"),
            RawLayer::DuplexL1A => ("duplex", "l1_a"),
            RawLayer::DuplexL1B => ("duplex", "l1_b"),
            RawLayer::DuplexDataA => ("duplex", "data_a"),
            RawLayer::DuplexDataB => ("duplex", "data_b"),
        }
    }
}

fn dyn_slice<T>(shared: &SharedStorage<T>, offset: u64, len: u64) -> Result<DynStorage>
where
    T: Storage + Send + 'static,
{
    Ok(Box::new(shared.slice(offset, len)?))
}

/// Put the header region behind a handle, with the committed master bitmap
/// copied into the working slot.
fn stage(raw: Vec<u8>, layout: &FsLayout) -> Result<Staged> {
    let mut staged = SharedStorage::new(MemoryStorage::from_vec(raw));
    let master = read_vec(
        &mut staged,
        layout.active_duplex_master_offset(),
        to_usize(layout.duplex_master_size)?,
    )?;
    staged.write(layout.working_duplex_master_offset(), &master)?;
    Ok(staged)
}

fn data_remap<S>(container: &SharedStorage<S>, staged: &Staged, layout: &FsLayout) -> Result<DataRemap<S>>
where
    S: Storage + Send + 'static,
{
    RemapStorage::new(
        dyn_slice(staged, DATA_REMAP_HEADER_OFFSET, REMAP_HEADER_SIZE)?,
        dyn_slice(container, layout.file_map_entry_offset, layout.file_map_entry_size)?,
        container.slice(layout.file_map_data_offset, layout.file_map_data_size)?,
    )
}

fn meta_duplex<S>(staged: &Staged, data: &DataSpace<S>, header: &SaveHeader) -> Result<MetaDuplex<S>>
where
    S: Storage + Send + 'static,
{
    let layout = &header.layout;
    HierarchicalDuplexStorage::hierarchical(
        staged.slice(layout.working_duplex_master_offset(), layout.duplex_master_size)?,
        data.slice(layout.duplex_l1_offset_a, layout.duplex_l1_size)?,
        data.slice(layout.duplex_l1_offset_b, layout.duplex_l1_size)?,
        header.duplex.l1_block_size,
        data.slice(layout.duplex_data_offset_a, layout.duplex_data_size)?,
        data.slice(layout.duplex_data_offset_b, layout.duplex_data_size)?,
        header.duplex.data_block_size,
    )
}

fn meta_remap<S>(
    container: &SharedStorage<S>,
    staged: &Staged,
    layout: &FsLayout,
    duplex: MetaDuplex<S>,
) -> Result<MetaRemap<S>>
where
    S: Storage + Send + 'static,
{
    RemapStorage::new(
        dyn_slice(staged, META_REMAP_HEADER_OFFSET, REMAP_HEADER_SIZE)?,
        dyn_slice(container, layout.meta_map_entry_offset, layout.meta_map_entry_size)?,
        duplex,
    )
}

fn journal_parts<S>(staged: &Staged, meta: &MetaSpace<S>, layout: &FsLayout) -> Result<JournalParts<DynStorage>>
where
    S: Storage + Send + 'static,
{
    Ok(JournalParts {
        header: dyn_slice(staged, JOURNAL_HEADER_OFFSET, JOURNAL_HEADER_SIZE)?,
        map: dyn_slice(meta, layout.journal_map_table_offset, layout.journal_map_table_size)?,
        modified_physical: dyn_slice(
            meta,
            layout.journal_physical_bitmap_offset,
            layout.journal_physical_bitmap_size,
        )?,
        modified_virtual: dyn_slice(
            meta,
            layout.journal_virtual_bitmap_offset,
            layout.journal_virtual_bitmap_size,
        )?,
        free: dyn_slice(meta, layout.journal_free_bitmap_offset, layout.journal_free_bitmap_size)?,
    })
}

fn open_journal<S>(
    staged: &Staged,
    data: &DataSpace<S>,
    meta: &MetaSpace<S>,
    layout: &FsLayout,
) -> Result<SaveJournal>
where
    S: Storage + Send + 'static,
{
    JournalStorage::new(
        journal_parts(staged, meta, layout)?,
        dyn_slice(data, layout.journal_data_offset, layout.journal_data_size)?,
    )
}

/// A hash tree whose hash levels live in the metadata space.
fn hash_tree<S, D>(
    master: DynStorage,
    meta: &MetaSpace<S>,
    ivfc: &IvfcHeader,
    data: D,
    check: IntegrityCheckLevel,
) -> Result<HierarchicalIntegrityVerificationStorage<D>>
where
    S: Storage + Send + 'static,
    D: Storage,
{
    let Some((_, hash_levels)) = ivfc.levels.split_last() else {
        return Err(Error::Corrupted("hash tree without levels"));
    };
    let levels = hash_levels
        .iter()
        .map(|level| dyn_slice(meta, level.offset, level.size))
        .collect::<Result<Vec<_>>>()?;
    let block_sizes = ivfc.levels.iter().map(|l| l.block_size).collect::<Vec<_>>();
    HierarchicalIntegrityVerificationStorage::new(master, levels, data, &block_sizes, check)
}

/// The layers between the container and the filesystem core.
struct Stack<S> {
    data: DataSpace<S>,
    meta: MetaSpace<S>,
    storage: SaveDataStorage,
    fat: FatStorage,
}

fn open_stack<S>(
    container: &SharedStorage<S>,
    staged: &Staged,
    header: &SaveHeader,
    check: IntegrityCheckLevel,
) -> Result<Stack<S>>
where
    S: Storage + Send + 'static,
{
    let layout = &header.layout;
    let data = SharedStorage::new(data_remap(container, staged, layout)?);
    let duplex = meta_duplex(staged, &data, header)?;
    let meta = SharedStorage::new(meta_remap(container, staged, layout, duplex)?);

    let journal = open_journal(staged, &data, &meta, layout)?;
    let save_tree = hash_tree(
        dyn_slice(staged, layout.ivfc_master_hash_offset, layout.ivfc_master_hash_size)?,
        &meta,
        &header.save_ivfc,
        journal,
        check,
    )?;
    let block_size = save_tree.data().block_size();
    let storage = SectorStorage::new(save_tree, block_size)?;

    let fat = match &header.fat_ivfc {
        Some(ivfc) => FatStorage::Verified(hash_tree(
            dyn_slice(
                staged,
                layout.fat_ivfc_master_hash_offset,
                layout.fat_ivfc_master_hash_size,
            )?,
            &meta,
            ivfc,
            dyn_slice(&meta, layout.fat_offset, layout.fat_size)?,
            check,
        )?),
        None => FatStorage::Plain(dyn_slice(&meta, layout.fat_offset, layout.fat_size)?),
    };
    Ok(Stack {
        data,
        meta,
        storage,
        fat,
    })
}

fn header_hash_validity(raw: &[u8], header: &SaveHeader) -> Validity {
    if sha256(&raw[HASHED_REGION_START as usize..]) == header.layout.hash {
        Validity::Valid
    } else {
        Validity::Invalid
    }
}

/// Serialise `header` over the staged header region, refresh the layout
/// hash and, given a key, the CMAC, then write the region to the
/// container. Without a key the CMAC is zeroed.
fn write_header<S: Storage>(
    container: &mut SharedStorage<S>,
    staged: &Staged,
    header: &mut SaveHeader,
    key: Option<&[u8; 16]>,
) -> Result<()> {
    let mut raw = staged.lock().as_slice().to_vec();
    header.write_into(&mut raw);
    header.layout.hash = sha256(&raw[HASHED_REGION_START as usize..]);

    let layout = LAYOUT_OFFSET as usize..(LAYOUT_OFFSET + LAYOUT_SIZE) as usize;
    raw[layout.clone()].copy_from_slice(&header.layout.to_bytes());
    header.cmac = key.map_or([0; 16], |key| aes_cmac(key, &raw[layout]));
    raw[..16].copy_from_slice(&header.cmac);
    staged.lock().as_mut_slice().copy_from_slice(&raw);
    container.write(0, &raw)
}

/// An open save container.
pub struct SaveDataFileSystem<S> {
    container: SharedStorage<S>,
    /// Header region as the next commit will write it.
    staged: Staged,
    header: SaveHeader,
    data: DataSpace<S>,
    meta: MetaSpace<S>,
    core: SaveDataFileSystemCore<SaveDataStorage, FatStorage>,
    check: IntegrityCheckLevel,
    header_hash: Validity,
    /// Set by [`trim`](Self::trim): the next commit clears blocks the
    /// allocation table holds free.
    wipe_free_blocks: bool,
}

impl<S: Storage> fmt::Debug for SaveDataFileSystem<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaveDataFileSystem")
            .field("version", &format_args!("{:#x}", self.header.layout.version))
            .field("extra_data", &self.header.extra_data)
            .field("header_hash", &self.header_hash)
            .finish_non_exhaustive()
    }
}

impl<S: Storage + Send + 'static> SaveDataFileSystem<S> {
    /// Format a new, empty container over `storage`, growing it if needed.
    ///
    /// The header is written unsigned; the first [`commit`](Self::commit)
    /// signs it.
    pub fn create(storage: S, info: &SaveDataCreateInfo) -> Result<Self> {
        let plan = info.plan()?;
        let mut container = SharedStorage::new(storage);
        if container.size()? < plan.container_size {
            container.set_size(plan.container_size)?;
        }
        fill_zero(&mut container, 0, plan.container_size)?;

        let mut header = plan.header;
        let mut raw = vec![0u8; to_usize(HEADER_SIZE)?];
        header.write_into(&mut raw);
        let layout = header.layout.clone();
        let staged = stage(raw, &layout)?;

        let mut table_header = dyn_slice(&staged, DATA_REMAP_HEADER_OFFSET, REMAP_HEADER_SIZE)?;
        let table = dyn_slice(&container, layout.file_map_entry_offset, layout.file_map_entry_size)?;
        DataRemap::<S>::format(&mut table_header, &table, REMAP_CAPACITY)?;
        let mut data = data_remap(&container, &staged, &layout)?;
        let mut physical = 0;
        for &size in &plan.data_regions {
            data.map_next(physical, size)?;
            physical += size;
        }
        let data = SharedStorage::new(data);

        let mut table_header = dyn_slice(&staged, META_REMAP_HEADER_OFFSET, REMAP_HEADER_SIZE)?;
        let table = dyn_slice(&container, layout.meta_map_entry_offset, layout.meta_map_entry_size)?;
        MetaRemap::<S>::format(&mut table_header, &table, REMAP_CAPACITY)?;
        let mut meta = meta_remap(&container, &staged, &layout, meta_duplex(&staged, &data, &header)?)?;
        let mut physical = 0;
        for &size in &plan.meta_regions {
            meta.map_next(physical, size)?;
            physical += size;
        }
        let meta = SharedStorage::new(meta);

        let mut parts = journal_parts(&staged, &meta, &layout)?;
        SaveJournal::format(&mut parts, plan.journal)?;
        drop((parts, meta, data));

        let Stack {
            mut storage,
            mut fat,
            ..
        } = open_stack(&container, &staged, &header, IntegrityCheckLevel::IgnoreOnInvalid)?;
        SaveDataFileSystemCore::format(
            &mut storage,
            &mut fat,
            plan.journal.block_size,
            plan.journal.main_blocks,
        )?;
        storage.flush()?;
        fat.flush()?;
        storage.inner_mut().data_mut().commit()?;
        drop((storage, fat));
        container.flush()?;

        header.layout.duplex_index ^= 1;
        write_header(&mut container, &staged, &mut header, None)?;
        container.flush()?;
        info!(
            "save: created {:#x} byte container for title {:016x}",
            plan.container_size, header.extra_data.title_id
        );
        Self::load(container, IntegrityCheckLevel::IgnoreOnInvalid)
    }

    /// Open an existing container.
    ///
    /// A header whose layout hash does not match is reported through
    /// [`header_hash_validity`](Self::header_hash_validity), and rejected
    /// with [`IntegrityCheckLevel::ErrorOnInvalid`].
    pub fn open(storage: S, check: IntegrityCheckLevel) -> Result<Self> {
        let fs = Self::load(SharedStorage::new(storage), check)?;
        debug!(
            "save: opened version {:#x}, commit {}, title {:016x}",
            fs.header.layout.version, fs.header.extra_data.commit_id, fs.header.extra_data.title_id
        );
        Ok(fs)
    }

    /// Build the whole stack over the committed state of `container`.
    fn load(mut container: SharedStorage<S>, check: IntegrityCheckLevel) -> Result<Self> {
        let raw = read_vec(&mut container, 0, to_usize(HEADER_SIZE)?)?;
        let header = SaveHeader::parse(&raw)?;

        let header_hash = header_hash_validity(&raw, &header);
        if header_hash == Validity::Invalid {
            warn!("save: header hash does not match the layout");
            if check == IntegrityCheckLevel::ErrorOnInvalid {
                return Err(Error::Corrupted("header hash mismatch"));
            }
        }

        let staged = stage(raw, &header.layout)?;
        let Stack {
            data,
            meta,
            storage,
            fat,
        } = open_stack(&container, &staged, &header, check)?;
        let core = SaveDataFileSystemCore::new(storage, fat)?;
        Ok(Self {
            container,
            staged,
            header,
            data,
            meta,
            core,
            check,
            header_hash,
            wipe_free_blocks: false,
        })
    }

    /// Drop every layer and rebuild them over the committed state.
    fn reload(&mut self) -> Result<()> {
        let reloaded = Self::load(self.container.clone(), self.check)?;
        *self = reloaded;
        Ok(())
    }

    pub fn header(&self) -> &SaveHeader {
        &self.header
    }

    pub fn extra_data(&self) -> &ExtraData {
        &self.header.extra_data
    }

    /// Whether the layout hash matched when the container was opened.
    pub fn header_hash_validity(&self) -> Validity {
        self.header_hash
    }

    /// Whether anything was written since the last commit or rollback.
    pub fn has_uncommitted_changes(&mut self) -> bool {
        self.journal_mut().has_uncommitted_changes() || self.meta.lock().base().has_staged_blocks()
    }

    fn save_tree(&mut self) -> &mut HierarchicalIntegrityVerificationStorage<SaveJournal> {
        self.core.base_mut().inner_mut()
    }

    fn journal_mut(&mut self) -> &mut SaveJournal {
        self.save_tree().data_mut()
    }

    /// Walk every hash tree and the header hash without failing on
    /// mismatches.
    pub fn verify(&mut self) -> Result<VerifyReport> {
        let raw = read_vec(&mut self.container, 0, to_usize(HEADER_SIZE)?)?;
        let header_hash = header_hash_validity(&raw, &self.header);
        let save_levels = self.save_tree().verify_all()?;
        let fat_levels = match self.core.table_mut().storage_mut().tree_mut() {
            Some(tree) => Some(tree.verify_all()?),
            None => None,
        };
        let report = VerifyReport {
            header_hash,
            save_levels,
            fat_levels,
        };
        if report.is_valid() {
            info!("save: verification passed");
        } else {
            warn!("save: verification failed: {report:?}");
        }
        Ok(report)
    }

    /// Check the header CMAC with the slot-0 save MAC key.
    pub fn signature_validity(&mut self, keys: &KeySet) -> Result<Validity> {
        let key = keys.save_mac_key(0).ok_or(Error::Signing)?;
        let layout = read_vec(&mut self.container, LAYOUT_OFFSET, to_usize(LAYOUT_SIZE)?)?;
        let stored = read_vec(&mut self.container, 0, 16)?;
        Ok(if aes_cmac(key, &layout)[..] == stored[..] {
            Validity::Valid
        } else {
            Validity::Invalid
        })
    }

    /// Make every pending write durable and re-sign the header.
    ///
    /// Fails with [`Error::Signing`] before touching anything when `keys`
    /// has no slot-0 save MAC key. A failure before the header write
    /// leaves the container in its last committed state.
    pub fn commit(&mut self, keys: &KeySet) -> Result<()> {
        let key = keys.save_mac_key(0).ok_or(Error::Signing)?;

        let wiped = if self.wipe_free_blocks {
            self.forget_free_blocks()?
        } else {
            Vec::new()
        };
        self.core.base_mut().flush()?;
        self.core.table_mut().storage_mut().flush()?;
        self.journal_mut().commit()?;
        self.container.flush()?;

        self.header.extra_data.commit_id += 1;
        self.header.layout.duplex_index ^= 1;
        write_header(&mut self.container, &self.staged, &mut self.header, Some(key))?;
        self.container.flush()?;
        info!("save: commit {} written", self.header.extra_data.commit_id);

        // Past the commit point the free blocks read as zeros whatever
        // they hold, so clearing them in place is safe.
        for &block in &wiped {
            self.journal_mut().discard_block(block)?;
        }
        if !wiped.is_empty() {
            self.container.flush()?;
            info!("save: cleared {} free blocks", wiped.len());
        }
        self.reload()
    }

    /// Clear the stored hash of every block the allocation table holds
    /// free, returning those blocks.
    fn forget_free_blocks(&mut self) -> Result<Vec<u32>> {
        let bs = self.core.block_size();
        let runs = self.core.table().runs(ChainId::Free)?;
        let mut blocks = Vec::new();
        for run in runs {
            self.save_tree()
                .discard(u64::from(run.start) * bs, u64::from(run.len) * bs)?;
            blocks.extend(run.start..run.start + run.len);
        }
        Ok(blocks)
    }

    /// Discard every write since the last commit by rebuilding the stack
    /// over the committed state.
    pub fn rollback(&mut self) -> Result<()> {
        self.reload()?;
        info!("save: rolled back to commit {}", self.header.extra_data.commit_id);
        Ok(())
    }

    /// Zero every journal block not holding live data, and have the next
    /// commit clear every block the allocation table holds free. No mapped
    /// block moves.
    ///
    /// Returns the number of journal blocks cleared.
    pub fn trim(&mut self) -> Result<u32> {
        let cleared = self.journal_mut().trim()?;
        self.wipe_free_blocks = true;
        Ok(cleared)
    }

    /// Tear the stack down and return the container. Nothing is committed:
    /// a reopened container shows the last committed state.
    pub fn into_inner(self) -> Result<S> {
        let Self {
            container,
            mut core,
            data,
            meta,
            staged,
            ..
        } = self;
        core.base_mut().flush()?;
        core.table_mut().storage_mut().flush()?;
        drop((core, meta, data, staged));
        container
            .try_unwrap()
            .map_err(|_| Error::Unsupported("container handle is still shared"))
    }

    /// A raw view of one layer of the stack, reflecting uncommitted
    /// writes. `None` when the layout has no such layer.
    pub fn raw_layer(&self, layer: RawLayer) -> Result<Option<DynStorage>> {
        let layout = &self.header.layout;
        let staged = |offset, size| dyn_slice(&self.staged, offset, size);
        let container = |offset, size| dyn_slice(&self.container, offset, size);
        let data = |offset, size| dyn_slice(&self.data, offset, size);
        let meta = |offset, size| dyn_slice(&self.meta, offset, size);
        let fat_tree = layout.has_fat_integrity();

        let storage: DynStorage = match layer {
            RawLayer::DataRemapHeader => staged(DATA_REMAP_HEADER_OFFSET, REMAP_HEADER_SIZE)?,
            RawLayer::DataRemapEntries => {
                container(layout.file_map_entry_offset, layout.file_map_entry_size)?
            }
            RawLayer::DataRemapBase => {
                container(layout.file_map_data_offset, layout.file_map_data_size)?
            }
            RawLayer::MetaRemapHeader => staged(META_REMAP_HEADER_OFFSET, REMAP_HEADER_SIZE)?,
            RawLayer::MetaRemapEntries => {
                container(layout.meta_map_entry_offset, layout.meta_map_entry_size)?
            }
            RawLayer::MetaRemapBase => Box::new(meta_duplex(&self.staged, &self.data, &self.header)?),
            RawLayer::JournalHeader => staged(JOURNAL_HEADER_OFFSET, JOURNAL_HEADER_SIZE)?,
            RawLayer::JournalMap => {
                meta(layout.journal_map_table_offset, layout.journal_map_table_size)?
            }
            RawLayer::JournalModifiedPhysical => meta(
                layout.journal_physical_bitmap_offset,
                layout.journal_physical_bitmap_size,
            )?,
            RawLayer::JournalModifiedVirtual => meta(
                layout.journal_virtual_bitmap_offset,
                layout.journal_virtual_bitmap_size,
            )?,
            RawLayer::JournalFree => {
                meta(layout.journal_free_bitmap_offset, layout.journal_free_bitmap_size)?
            }
            RawLayer::JournalData => data(layout.journal_data_offset, layout.journal_data_size)?,
            RawLayer::SaveData => {
                Box::new(open_journal(&self.staged, &self.data, &self.meta, layout)?)
            }
            RawLayer::SaveMasterHash => {
                staged(layout.ivfc_master_hash_offset, layout.ivfc_master_hash_size)?
            }
            RawLayer::SaveL1Hash => meta(layout.ivfc_l1_offset, layout.ivfc_l1_size)?,
            RawLayer::SaveL2Hash => meta(layout.ivfc_l2_offset, layout.ivfc_l2_size)?,
            RawLayer::SaveL3Hash => meta(layout.ivfc_l3_offset, layout.ivfc_l3_size)?,
            RawLayer::AllocationTable => meta(layout.fat_offset, layout.fat_size)?,
            RawLayer::FatMasterHash if fat_tree => staged(
                layout.fat_ivfc_master_hash_offset,
                layout.fat_ivfc_master_hash_size,
            )?,
            RawLayer::FatL1Hash if fat_tree => {
                meta(layout.fat_ivfc_l1_offset, layout.fat_ivfc_l1_size)?
            }
            RawLayer::FatL2Hash if fat_tree => {
                meta(layout.fat_ivfc_l2_offset, layout.fat_ivfc_l2_size)?
            }
            RawLayer::FatMasterHash | RawLayer::FatL1Hash | RawLayer::FatL2Hash => return Ok(None),
            RawLayer::DuplexMasterA => {
                staged(layout.duplex_master_offset_a, layout.duplex_master_size)?
            }
            RawLayer::DuplexMasterB => {
                staged(layout.duplex_master_offset_b, layout.duplex_master_size)?
            }
            RawLayer::DuplexL1A => data(layout.duplex_l1_offset_a, layout.duplex_l1_size)?,
            RawLayer::DuplexL1B => data(layout.duplex_l1_offset_b, layout.duplex_l1_size)?,
            RawLayer::DuplexDataA => data(layout.duplex_data_offset_a, layout.duplex_data_size)?,
            RawLayer::DuplexDataB => data(layout.duplex_data_offset_b, layout.duplex_data_size)?,
        };
        Ok(Some(storage))
    }

    /// Dump every raw layer into files under `host`, one directory per
    /// subsystem. Returns the number of files written.
    pub fn export_debug(&mut self, host: &Path) -> Result<u32> {
        self.core.base_mut().flush()?;
        self.core.table_mut().storage_mut().flush()?;
        let mut files = 0;
        for layer in RawLayer::ALL {
            let Some(mut storage) = self.raw_layer(layer)? else {
                continue;
            };
            let (dir, name) = layer.dump_path();
            let dir = host.join(dir);
            fs::create_dir_all(&dir)?;
            dump(&mut storage, &dir.join(name))?;
            files += 1;
        }
        info!("save: dumped {files} layers to {}", host.display());
        Ok(files)
    }

    // Filesystem operations

    pub fn create_directory(&mut self, path: &str) -> Result<()> {
        self.core.create_directory(path)
    }

    pub fn create_file(&mut self, path: &str, size: u64) -> Result<()> {
        self.core.create_file(path, size)
    }

    pub fn open_file(
        &mut self,
        path: &str,
        mode: OpenMode,
    ) -> Result<SaveFile<'_, SaveDataStorage, FatStorage>> {
        self.core.open_file(path, mode)
    }

    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        self.core.delete_file(path)
    }

    pub fn delete_directory(&mut self, path: &str) -> Result<()> {
        self.core.delete_directory(path)
    }

    pub fn delete_directory_recursively(&mut self, path: &str) -> Result<()> {
        self.core.delete_directory_recursively(path)
    }

    pub fn clean_directory_recursively(&mut self, path: &str) -> Result<()> {
        self.core.clean_directory_recursively(path)
    }

    pub fn rename_file(&mut self, from: &str, to: &str) -> Result<()> {
        self.core.rename_file(from, to)
    }

    pub fn rename_directory(&mut self, from: &str, to: &str) -> Result<()> {
        self.core.rename_directory(from, to)
    }

    pub fn get_entry_type(&mut self, path: &str) -> Result<EntryType> {
        self.core.get_entry_type(path)
    }

    pub fn entries(&mut self, path: &str) -> Result<Entries<'_, SaveDataStorage, FatStorage>> {
        self.core.entries(path)
    }

    pub fn free_space_size(&self) -> Result<u64> {
        self.core.free_space_size()
    }

    pub fn total_space_size(&self) -> u64 {
        self.core.total_space_size()
    }

    /// The allocation table, for chain dumps.
    pub fn allocation_table(&self) -> &AllocationTable<FatStorage> {
        self.core.table()
    }

    /// Block runs backing a file.
    pub fn file_chain_runs(&mut self, path: &str) -> Result<Vec<Run>> {
        self.core.file_chain_runs(path)
    }

    /// Read a whole file into memory.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        let mut file = self.core.open_file(path, OpenMode::READ)?;
        let mut data = vec![0u8; to_usize(file.size()?)?];
        let n = file.read(0, &mut data)?;
        data.truncate(n);
        Ok(data)
    }

    /// Create `path` holding exactly `data`, replacing an existing file.
    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<()> {
        match self.core.create_file(path, 0) {
            Ok(()) | Err(Error::AlreadyExists) => {}
            Err(e) => return Err(e),
        }
        let mut file = self.core.open_file(path, OpenMode::ALL)?;
        file.set_size(data.len() as u64)?;
        file.write(0, data)
    }

    // Host import/export

    /// Copy the host directory tree under `host` into the root directory.
    ///
    /// `progress` is called as `(path, bytes_done, bytes_total)` while each
    /// file streams in.
    pub fn import_directory(
        &mut self,
        host: &Path,
        mut progress: impl FnMut(&str, u64, u64),
    ) -> Result<()> {
        let files = self.import_tree(host, "", &mut progress)?;
        info!("save: imported {files} files from {}", host.display());
        Ok(())
    }

    fn import_tree(
        &mut self,
        host: &Path,
        path: &str,
        progress: &mut impl FnMut(&str, u64, u64),
    ) -> Result<u32> {
        let mut children = fs::read_dir(host)?.collect::<std::io::Result<Vec<_>>>()?;
        children.sort_by_key(|entry| entry.file_name());

        let mut files = 0;
        for child in children {
            let name = child.file_name();
            let name = name
                .to_str()
                .ok_or(Error::InvalidPath("host name is not UTF-8"))?;
            let target = format!("{path}/{name}");
            if child.file_type()?.is_dir() {
                match self.core.create_directory(&target) {
                    Ok(()) | Err(Error::AlreadyExists) => {}
                    Err(e) => return Err(e),
                }
                files += self.import_tree(&child.path(), &target, progress)?;
            } else {
                self.import_file(&child.path(), &target, progress)?;
                files += 1;
            }
        }
        Ok(files)
    }

    fn import_file(
        &mut self,
        host: &Path,
        target: &str,
        progress: &mut impl FnMut(&str, u64, u64),
    ) -> Result<()> {
        let mut source = fs::File::open(host)?;
        let total = source.metadata()?.len();
        match self.core.create_file(target, total) {
            Ok(()) => {}
            Err(Error::AlreadyExists) => {
                self.core.open_file(target, OpenMode::WRITE)?.set_size(total)?;
            }
            Err(e) => return Err(e),
        }
        let mut file = self.core.open_file(target, OpenMode::WRITE)?;
        let mut buf = vec![0u8; to_usize(file_chunk(total))?];
        let mut done = 0u64;
        while done < total {
            let n = (total - done).min(buf.len() as u64) as usize;
            source.read_exact(&mut buf[..n])?;
            file.write(done, &buf[..n])?;
            done += n as u64;
            progress(target, done, total);
        }
        debug!("save: imported {target} ({total:#x} bytes)");
        Ok(())
    }

    /// Copy every directory and file into the host directory `host`,
    /// creating it if needed.
    pub fn export_directory(
        &mut self,
        host: &Path,
        mut progress: impl FnMut(&str, u64, u64),
    ) -> Result<()> {
        fs::create_dir_all(host)?;
        let entries = self.core.entries("/")?.collect::<Result<Vec<_>>>()?;
        let mut files = 0u32;
        for DirectoryEntry {
            path, kind, size, ..
        } in entries
        {
            let Some(relative) = path.strip_prefix('/').filter(|r| !r.is_empty()) else {
                continue;
            };
            let target = host.join(relative);
            match kind {
                EntryType::Directory => fs::create_dir_all(&target)?,
                EntryType::File => {
                    let mut sink = fs::File::create(&target)?;
                    let mut file = self.core.open_file(&path, OpenMode::READ)?;
                    let mut buf = vec![0u8; to_usize(file_chunk(size))?];
                    let mut done = 0u64;
                    while done < size {
                        let n = file.read(done, &mut buf)?;
                        if n == 0 {
                            break;
                        }
                        sink.write_all(&buf[..n])?;
                        done += n as u64;
                        progress(&path, done, size);
                    }
                    files += 1;
                }
            }
        }
        info!("save: exported {files} files to {}", host.display());
        Ok(())
    }
}

/// Streaming chunk for host copies.
fn file_chunk(total: u64) -> u64 {
    total.clamp(1, 0x10_0000)
}

/// Stream all of `storage` into a new host file.
fn dump(storage: &mut DynStorage, path: &Path) -> Result<()> {
    let mut sink = fs::File::create(path)?;
    let total = storage.size()?;
    let mut buf = vec![0u8; to_usize(file_chunk(total))?];
    let mut done = 0u64;
    while done < total {
        let n = (total - done).min(buf.len() as u64) as usize;
        storage.read(done, &mut buf[..n])?;
        sink.write_all(&buf[..n])?;
        done += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::save::header::LAYOUT_VERSION_4;
    use crate::storage::MemoryStorage;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn info() -> SaveDataCreateInfo {
        SaveDataCreateInfo::default()
            .with_block_size(0x200)
            .with_blocks(48, 24)
            .with_title_id(0x0100000000010000)
    }

    #[test]
    fn create_produces_an_openable_empty_container() {
        init();
        let fs = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
        let size = info().container_size().unwrap();
        let disk = fs.into_inner().unwrap();
        assert_eq!(disk.as_slice().len() as u64, size);
        assert_eq!(&disk.as_slice()[0x100..0x104], b"DISF");
        assert_eq!(&disk.as_slice()[..16], &[0u8; 16]);

        let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
        assert_eq!(fs.header_hash_validity(), Validity::Valid);
        assert_eq!(fs.extra_data().title_id, 0x0100000000010000);
        assert_eq!(fs.entries("/").unwrap().count(), 0);
        assert_eq!(fs.free_space_size().unwrap(), 46 * 0x200);
        assert!(fs.verify().unwrap().is_valid());
    }

    #[test]
    fn unsigned_header_fails_signature_check() {
        init();
        let keys = KeySet::with_save_mac_key([0x42; 16]);
        let mut fs = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
        assert_eq!(fs.signature_validity(&keys).unwrap(), Validity::Invalid);
        fs.commit(&keys).unwrap();
        assert_eq!(fs.signature_validity(&keys).unwrap(), Validity::Valid);
        assert_eq!(
            fs.signature_validity(&KeySet::with_save_mac_key([0x43; 16])).unwrap(),
            Validity::Invalid
        );
        assert!(matches!(fs.signature_validity(&KeySet::new()), Err(Error::Signing)));
    }

    #[test]
    fn pending_changes_survive_only_a_commit() {
        init();
        let keys = KeySet::with_save_mac_key([1; 16]);
        let mut fs = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
        fs.write_file("/a.bin", &[7; 700]).unwrap();
        assert!(fs.has_uncommitted_changes());
        fs.rollback().unwrap();
        assert!(!fs.has_uncommitted_changes());
        assert!(matches!(fs.get_entry_type("/a.bin"), Err(Error::NotFound)));
        assert_eq!(fs.free_space_size().unwrap(), 46 * 0x200);

        fs.write_file("/a.bin", &[7; 700]).unwrap();
        fs.commit(&keys).unwrap();
        assert_eq!(fs.extra_data().commit_id, 1);
        let disk = fs.into_inner().unwrap();
        let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
        assert_eq!(fs.read_file("/a.bin").unwrap(), vec![7; 700]);
    }

    #[test]
    fn version_4_keeps_the_table_unverified() {
        init();
        let mut fs = SaveDataFileSystem::create(
            MemoryStorage::new(0),
            &info().with_version(LAYOUT_VERSION_4),
        )
        .unwrap();
        fs.create_directory("/dir").unwrap();
        fs.commit(&KeySet::with_save_mac_key([2; 16])).unwrap();
        let report = fs.verify().unwrap();
        assert!(report.fat_levels.is_none());
        assert!(report.is_valid());
        assert_eq!(report.save_levels.len(), 4);
        assert!(fs.raw_layer(RawLayer::FatL1Hash).unwrap().is_none());
    }

    #[test]
    fn commit_flips_the_duplex_index() {
        init();
        let keys = KeySet::with_save_mac_key([3; 16]);
        let mut fs = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
        let before = fs.header().layout.duplex_index;
        fs.create_directory("/d").unwrap();
        fs.commit(&keys).unwrap();
        assert_eq!(fs.header().layout.duplex_index, before ^ 1);
        assert_eq!(fs.header_hash_validity(), Validity::Valid);
        assert!(!fs.has_uncommitted_changes());
    }

    #[test]
    fn uncommitted_writes_leave_the_header_alone() {
        init();
        let keys = KeySet::with_save_mac_key([4; 16]);
        let mut fs = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
        fs.commit(&keys).unwrap();
        let header = read_vec(&mut fs.container, 0, HEADER_SIZE as usize).unwrap();

        fs.write_file("/a.bin", &[9; 0x900]).unwrap();
        fs.core.base_mut().flush().unwrap();
        assert_eq!(read_vec(&mut fs.container, 0, HEADER_SIZE as usize).unwrap(), header);
        assert!(fs.verify().unwrap().is_valid());
    }

    #[test]
    fn raw_layers_follow_the_layout() {
        init();
        let fs = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
        let layout = fs.header().layout.clone();
        let size = |layer| fs.raw_layer(layer).unwrap().unwrap().size().unwrap();

        assert_eq!(size(RawLayer::JournalData), layout.journal_data_size);
        assert_eq!(size(RawLayer::SaveData), 48 * 0x200);
        assert_eq!(size(RawLayer::SaveL3Hash), layout.ivfc_l3_size);
        assert_eq!(size(RawLayer::AllocationTable), layout.fat_size);
        assert_eq!(size(RawLayer::FatL2Hash), layout.fat_ivfc_l2_size);
        assert_eq!(size(RawLayer::DuplexMasterB), layout.duplex_master_size);
        assert_eq!(size(RawLayer::DataRemapBase), layout.file_map_data_size);
        assert_eq!(size(RawLayer::JournalHeader), JOURNAL_HEADER_SIZE);

        let mut header = fs.raw_layer(RawLayer::JournalHeader).unwrap().unwrap();
        assert_eq!(read_vec(&mut header, 0, 4).unwrap(), b"JNGL");
    }
}
