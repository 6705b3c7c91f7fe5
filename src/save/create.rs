//! Parameters for new containers and the layout derived from them.
//!
//! A new container is laid out as
//!
//! ```text
//! [0x0000] header region
//! [0x4000] data remap entry table
//! [0x4200] metadata remap entry table
//! [0x4400] data remap base:
//!            journal data | duplex L1 A | duplex L1 B | duplex data A | duplex data B
//! ```
//!
//! and the duplex data (the metadata remap's base) holds the journal map,
//! the three journal bitmaps, the save tree's hash levels, the allocation
//! table and, from layout version 0x50000, the allocation table's hash
//! levels. Every region gets its own remap entry. The save tree covers the
//! journal's virtual blocks, so its data level has no region of its own.

use log::debug;

use super::allocation_table::table_size;
use super::header::{
    DUPLEX_MASTER_CAPACITY, DUPLEX_MASTER_OFFSET_A, DUPLEX_MASTER_OFFSET_B, DuplexHeader,
    ExtraData, FAT_MASTER_HASH_OFFSET, FsLayout, HEADER_SIZE, IvfcHeader, LAYOUT_VERSION_4,
    LAYOUT_VERSION_5, MASTER_HASH_CAPACITY, SAVE_MASTER_HASH_OFFSET, SaveDataType, SaveHeader,
};
use crate::storage::integrity::hash_level_sizes;
use crate::storage::journal::JournalGeometry;
use crate::storage::remap::REMAP_ENTRY_SIZE;
use crate::storage::IntegrityLevelInfo;
use crate::utils::align_up;
use crate::{Error, Result};

/// Block size of both duplex levels.
pub const DUPLEX_BLOCK_SIZE: u64 = 0x200;
/// Entries reserved in each remap table.
pub const REMAP_CAPACITY: u32 = 16;

const REGION_ALIGNMENT: u64 = 0x10;
const SAVE_HASH_LEVELS: usize = 3;
const FAT_HASH_LEVELS: usize = 2;

/// Everything needed to format a new container.
#[derive(Debug, Clone)]
pub struct SaveDataCreateInfo {
    /// Size of a filesystem block; a power of two of at least 0x200.
    pub block_size: u64,
    /// Blocks available to the filesystem, tables included.
    pub data_block_count: u32,
    /// Spare blocks for uncommitted writes.
    pub journal_block_count: u32,
    /// `0x40000` or `0x50000`.
    pub version: u32,
    pub title_id: u64,
    pub user_id: [u8; 16],
    pub save_id: u64,
    pub save_type: SaveDataType,
    pub owner_id: u64,
    pub timestamp: u64,
    pub flags: u32,
}

impl Default for SaveDataCreateInfo {
    fn default() -> Self {
        Self {
            block_size: 0x4000,
            data_block_count: 64,
            journal_block_count: 32,
            version: LAYOUT_VERSION_5,
            title_id: 0,
            user_id: [0; 16],
            save_id: 0,
            save_type: SaveDataType::Account,
            owner_id: 0,
            timestamp: 0,
            flags: 0,
        }
    }
}

impl SaveDataCreateInfo {
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_blocks(mut self, data_block_count: u32, journal_block_count: u32) -> Self {
        self.data_block_count = data_block_count;
        self.journal_block_count = journal_block_count;
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_title_id(mut self, title_id: u64) -> Self {
        self.title_id = title_id;
        self
    }

    pub fn with_user_id(mut self, user_id: [u8; 16]) -> Self {
        self.user_id = user_id;
        self
    }

    /// Bytes a container built from these parameters occupies.
    pub fn container_size(&self) -> Result<u64> {
        Ok(self.plan()?.container_size)
    }

    pub(crate) fn plan(&self) -> Result<Plan> {
        let bs = self.block_size;
        if !bs.is_power_of_two() || !(0x200..=0x10_0000).contains(&bs) {
            return Err(Error::Parse("block size must be a power of two in [0x200, 0x100000]"));
        }
        if self.data_block_count < 2 || self.journal_block_count == 0 {
            return Err(Error::Parse("need two data blocks and one journal block"));
        }
        if self.version != LAYOUT_VERSION_4 && self.version != LAYOUT_VERSION_5 {
            return Err(Error::UnsupportedVersion(self.version));
        }
        let journal = JournalGeometry {
            block_size: bs,
            main_blocks: self.data_block_count,
            journal_blocks: self.journal_block_count,
        };

        // The save tree hashes the journal's virtual blocks.
        let save_tree = hash_level_sizes(journal.virtual_size(), bs, SAVE_HASH_LEVELS);
        let fat_size = table_size(self.data_block_count);
        let fat_tree = hash_level_sizes(fat_size, bs, FAT_HASH_LEVELS);
        if save_tree[0] > MASTER_HASH_CAPACITY || fat_tree[0] > MASTER_HASH_CAPACITY {
            return Err(Error::Parse("container too large for its master hashes"));
        }

        // Metadata remap space.
        let mut meta = Regions::default();
        let map = meta.push(journal.map_size());
        let physical_bitmap = meta.push(journal.physical_bitmap_size());
        let virtual_bitmap = meta.push(journal.virtual_bitmap_size());
        let free_bitmap = meta.push(journal.physical_bitmap_size());
        let save_levels: Vec<_> = save_tree[1..].iter().map(|&s| meta.push(s)).collect();
        let fat = meta.push(fat_size);
        let fat_levels: Vec<_> = if self.version >= LAYOUT_VERSION_5 {
            fat_tree[1..].iter().map(|&s| meta.push(s)).collect()
        } else {
            Vec::new()
        };
        let meta_size = align_up(meta.end, DUPLEX_BLOCK_SIZE);

        // Duplex levels protecting the metadata.
        let l1_size = align_up((meta_size / DUPLEX_BLOCK_SIZE).div_ceil(8), REGION_ALIGNMENT);
        let master_size = align_up(l1_size.div_ceil(DUPLEX_BLOCK_SIZE).div_ceil(8), 8);
        if master_size > DUPLEX_MASTER_CAPACITY {
            return Err(Error::Parse("metadata too large for the duplex master bitmap"));
        }

        // Data remap space.
        let mut data = Regions::default();
        let journal_data = data.push(journal.data_size());
        let l1_a = data.push(l1_size);
        let l1_b = data.push(l1_size);
        let duplex_a = data.push(meta_size);
        let duplex_b = data.push(meta_size);

        let table_bytes = u64::from(REMAP_CAPACITY) * REMAP_ENTRY_SIZE;
        let data_base_offset = HEADER_SIZE + 2 * table_bytes;
        let container_size = data_base_offset + data.end;

        let level = |(offset, size): (u64, u64)| IntegrityLevelInfo {
            offset,
            size,
            block_size: bs,
        };
        let mut save_ivfc_levels: Vec<_> = save_levels.iter().copied().map(level).collect();
        save_ivfc_levels.push(level((0, journal.virtual_size())));
        let fat_ivfc = (!fat_levels.is_empty()).then(|| {
            let mut levels: Vec<_> = fat_levels.iter().copied().map(level).collect();
            levels.push(level(fat));
            IvfcHeader {
                master_hash_size: fat_tree[0] as u32,
                levels,
            }
        });

        let (fat_l1, fat_l2) = match fat_levels.as_slice() {
            [l1, l2] => (*l1, *l2),
            _ => ((0, 0), (0, 0)),
        };
        let layout = FsLayout {
            version: self.version,
            hash: [0; 32],
            file_map_entry_offset: HEADER_SIZE,
            file_map_entry_size: table_bytes,
            meta_map_entry_offset: HEADER_SIZE + table_bytes,
            meta_map_entry_size: table_bytes,
            file_map_data_offset: data_base_offset,
            file_map_data_size: data.end,
            duplex_l1_offset_a: l1_a.0,
            duplex_l1_offset_b: l1_b.0,
            duplex_l1_size: l1_size,
            duplex_data_offset_a: duplex_a.0,
            duplex_data_offset_b: duplex_b.0,
            duplex_data_size: meta_size,
            journal_data_offset: journal_data.0,
            journal_data_size: journal_data.1,
            journal_size: journal.journal_size(),
            duplex_master_offset_a: DUPLEX_MASTER_OFFSET_A,
            duplex_master_offset_b: DUPLEX_MASTER_OFFSET_B,
            duplex_master_size: master_size,
            ivfc_master_hash_offset: SAVE_MASTER_HASH_OFFSET,
            ivfc_master_hash_size: save_tree[0],
            journal_map_table_offset: map.0,
            journal_map_table_size: map.1,
            journal_physical_bitmap_offset: physical_bitmap.0,
            journal_physical_bitmap_size: physical_bitmap.1,
            journal_virtual_bitmap_offset: virtual_bitmap.0,
            journal_virtual_bitmap_size: virtual_bitmap.1,
            journal_free_bitmap_offset: free_bitmap.0,
            journal_free_bitmap_size: free_bitmap.1,
            ivfc_l1_offset: save_levels[0].0,
            ivfc_l1_size: save_levels[0].1,
            ivfc_l2_offset: save_levels[1].0,
            ivfc_l2_size: save_levels[1].1,
            ivfc_l3_offset: save_levels[2].0,
            ivfc_l3_size: save_levels[2].1,
            fat_offset: fat.0,
            fat_size: fat.1,
            duplex_index: 0,
            fat_ivfc_master_hash_offset: if fat_ivfc.is_some() { FAT_MASTER_HASH_OFFSET } else { 0 },
            fat_ivfc_master_hash_size: if fat_ivfc.is_some() { fat_tree[0] } else { 0 },
            fat_ivfc_l1_offset: fat_l1.0,
            fat_ivfc_l1_size: fat_l1.1,
            fat_ivfc_l2_offset: fat_l2.0,
            fat_ivfc_l2_size: fat_l2.1,
        };

        let header = SaveHeader {
            cmac: [0; 16],
            layout,
            duplex: DuplexHeader {
                l1_block_size: DUPLEX_BLOCK_SIZE,
                data_block_size: DUPLEX_BLOCK_SIZE,
            },
            save_ivfc: IvfcHeader {
                master_hash_size: save_tree[0] as u32,
                levels: save_ivfc_levels,
            },
            fat_ivfc,
            extra_data: ExtraData {
                title_id: self.title_id,
                user_id: self.user_id,
                save_id: self.save_id,
                save_type: self.save_type,
                owner_id: self.owner_id,
                timestamp: self.timestamp,
                flags: self.flags,
                data_size: journal.virtual_size(),
                journal_size: journal.journal_size(),
                commit_id: 0,
            },
        };

        debug!(
            "save layout: {:#x} bytes, metadata {meta_size:#x}, {} meta regions",
            container_size,
            meta.sizes.len()
        );
        Ok(Plan {
            header,
            journal,
            data_regions: data.sizes,
            meta_regions: meta.sizes,
            container_size,
        })
    }
}

/// Regions packed back to back in one address space.
#[derive(Debug, Default)]
struct Regions {
    sizes: Vec<u64>,
    end: u64,
}

impl Regions {
    /// Append a region, returning its `(offset, size)`.
    fn push(&mut self, size: u64) -> (u64, u64) {
        let offset = self.end;
        let padded = align_up(size, REGION_ALIGNMENT);
        self.sizes.push(padded);
        self.end += padded;
        (offset, size)
    }
}

/// A fully resolved layout.
#[derive(Debug)]
pub(crate) struct Plan {
    pub header: SaveHeader,
    pub journal: JournalGeometry,
    /// Padded region sizes of the data remap space, in order.
    pub data_regions: Vec<u64>,
    /// Padded region sizes of the metadata remap space, in order.
    pub meta_regions: Vec<u64>,
    pub container_size: u64,
}
