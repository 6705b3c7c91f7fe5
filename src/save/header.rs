//! Save container header records.
//!
//! ## Header region (0x4000 bytes)
//! ```text
//! [0x0000] Cmac              (0x10)  - AES-CMAC over [0x100, 0x300)
//! [0x0100] FsLayout          (0x200) - "DISF"
//! [0x0300] DuplexHeader      (0x20)  - "DPFS"
//! [0x0320] IvfcHeader        (0x80)  - "IVFC", save data tree
//! [0x03A0] IvfcHeader        (0x80)  - "IVFC", allocation table tree (0x50000+)
//! [0x0420] JournalHeader     (0x40)  - "JNGL"
//! [0x0460] RemapHeader       (0x40)  - "RMAP", data remap
//! [0x04A0] RemapHeader       (0x40)  - "RMAP", metadata remap
//! [0x0500] ExtraData         (0x100)
//! [0x0600] Save master hash  (up to 0x100)
//! [0x0700] FAT master hash   (up to 0x100)
//! [0x1000] Duplex master bitmap A (0x1000)
//! [0x2000] Duplex master bitmap B (0x1000)
//! ```
//!
//! The layout hash covers `[0x300, 0x4000)`; the CMAC covers the layout
//! itself, so signing the layout transitively signs the whole header.
//!
//! ## Address spaces
//! Layout offsets are relative to different storages:
//! * remap entry tables and the data remap base: the container
//! * duplex levels and journal data: the data remap's virtual space
//! * journal map, journal bitmaps, hash levels and the allocation table:
//!   the metadata remap's virtual space
//! * master bitmaps and master hashes: the header

use std::io::Cursor;

use crate::storage::IntegrityLevelInfo;
use crate::utils::{bytesa, le_u32, le_u64, magic, pad_to, put_u32, put_u64, skip, u8};
use crate::{Error, Result};

/// Size of the header region at the front of every container.
pub const HEADER_SIZE: u64 = 0x4000;

pub const CMAC_OFFSET: u64 = 0x0;
pub const LAYOUT_OFFSET: u64 = 0x100;
pub const LAYOUT_SIZE: u64 = 0x200;
pub const DUPLEX_HEADER_OFFSET: u64 = 0x300;
pub const SAVE_IVFC_HEADER_OFFSET: u64 = 0x320;
pub const FAT_IVFC_HEADER_OFFSET: u64 = 0x3A0;
pub const JOURNAL_HEADER_OFFSET: u64 = 0x420;
pub const DATA_REMAP_HEADER_OFFSET: u64 = 0x460;
pub const META_REMAP_HEADER_OFFSET: u64 = 0x4A0;
pub const EXTRA_DATA_OFFSET: u64 = 0x500;
pub const EXTRA_DATA_SIZE: u64 = 0x100;
pub const SAVE_MASTER_HASH_OFFSET: u64 = 0x600;
pub const FAT_MASTER_HASH_OFFSET: u64 = 0x700;
/// Largest master hash either tree may carry.
pub const MASTER_HASH_CAPACITY: u64 = 0x100;
pub const DUPLEX_MASTER_OFFSET_A: u64 = 0x1000;
pub const DUPLEX_MASTER_OFFSET_B: u64 = 0x2000;
pub const DUPLEX_MASTER_CAPACITY: u64 = 0x1000;

/// First byte covered by the layout hash.
pub const HASHED_REGION_START: u64 = DUPLEX_HEADER_OFFSET;

/// Layout version without allocation table integrity.
pub const LAYOUT_VERSION_4: u32 = 0x40000;
/// Layout version adding a hash tree over the allocation table.
pub const LAYOUT_VERSION_5: u32 = 0x50000;

const LAYOUT_MAGIC: &[u8; 4] = b"DISF";
const DUPLEX_MAGIC: &[u8; 4] = b"DPFS";
const DUPLEX_VERSION: u32 = 0x10000;
const IVFC_MAGIC: &[u8; 4] = b"IVFC";
const IVFC_VERSION: u32 = 0x20000;
const IVFC_HEADER_SIZE: usize = 0x80;
const IVFC_MAX_LEVELS: usize = 4;

/// Offsets and sizes of every structure in a container.
///
/// ## Layout (0x200 bytes)
/// ```text
/// [0x000] Magic "DISF"           (4 bytes)
/// [0x004] Version                (u32 LE)
/// [0x008] Hash                   (0x20) - SHA-256 of header [0x300, 0x4000)
/// [0x028] 36 u64 offset/size fields, in declaration order
/// [0x148] DuplexIndex            (u8) - active master bitmap (0 = A)
/// [0x150] 6 u64 allocation table tree fields (0x50000+ only)
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsLayout {
    pub version: u32,
    pub hash: [u8; 32],
    pub file_map_entry_offset: u64,
    pub file_map_entry_size: u64,
    pub meta_map_entry_offset: u64,
    pub meta_map_entry_size: u64,
    pub file_map_data_offset: u64,
    pub file_map_data_size: u64,
    pub duplex_l1_offset_a: u64,
    pub duplex_l1_offset_b: u64,
    pub duplex_l1_size: u64,
    pub duplex_data_offset_a: u64,
    pub duplex_data_offset_b: u64,
    pub duplex_data_size: u64,
    pub journal_data_offset: u64,
    pub journal_data_size: u64,
    pub journal_size: u64,
    pub duplex_master_offset_a: u64,
    pub duplex_master_offset_b: u64,
    pub duplex_master_size: u64,
    pub ivfc_master_hash_offset: u64,
    pub ivfc_master_hash_size: u64,
    pub journal_map_table_offset: u64,
    pub journal_map_table_size: u64,
    pub journal_physical_bitmap_offset: u64,
    pub journal_physical_bitmap_size: u64,
    pub journal_virtual_bitmap_offset: u64,
    pub journal_virtual_bitmap_size: u64,
    pub journal_free_bitmap_offset: u64,
    pub journal_free_bitmap_size: u64,
    pub ivfc_l1_offset: u64,
    pub ivfc_l1_size: u64,
    pub ivfc_l2_offset: u64,
    pub ivfc_l2_size: u64,
    pub ivfc_l3_offset: u64,
    pub ivfc_l3_size: u64,
    pub fat_offset: u64,
    pub fat_size: u64,
    pub duplex_index: u8,
    pub fat_ivfc_master_hash_offset: u64,
    pub fat_ivfc_master_hash_size: u64,
    pub fat_ivfc_l1_offset: u64,
    pub fat_ivfc_l1_size: u64,
    pub fat_ivfc_l2_offset: u64,
    pub fat_ivfc_l2_size: u64,
}

impl FsLayout {
    /// Whether the allocation table carries its own hash tree.
    pub fn has_fat_integrity(&self) -> bool {
        self.version >= LAYOUT_VERSION_5
    }

    /// Offset of the committed master bitmap.
    pub fn active_duplex_master_offset(&self) -> u64 {
        if self.duplex_index == 0 {
            self.duplex_master_offset_a
        } else {
            self.duplex_master_offset_b
        }
    }

    /// Offset of the master bitmap uncommitted writes go to. The next
    /// commit makes it the active one by flipping `duplex_index`.
    pub fn working_duplex_master_offset(&self) -> u64 {
        if self.duplex_index == 0 {
            self.duplex_master_offset_b
        } else {
            self.duplex_master_offset_a
        }
    }

    fn fields(&self) -> [u64; 36] {
        [
            self.file_map_entry_offset,
            self.file_map_entry_size,
            self.meta_map_entry_offset,
            self.meta_map_entry_size,
            self.file_map_data_offset,
            self.file_map_data_size,
            self.duplex_l1_offset_a,
            self.duplex_l1_offset_b,
            self.duplex_l1_size,
            self.duplex_data_offset_a,
            self.duplex_data_offset_b,
            self.duplex_data_size,
            self.journal_data_offset,
            self.journal_data_size,
            self.journal_size,
            self.duplex_master_offset_a,
            self.duplex_master_offset_b,
            self.duplex_master_size,
            self.ivfc_master_hash_offset,
            self.ivfc_master_hash_size,
            self.journal_map_table_offset,
            self.journal_map_table_size,
            self.journal_physical_bitmap_offset,
            self.journal_physical_bitmap_size,
            self.journal_virtual_bitmap_offset,
            self.journal_virtual_bitmap_size,
            self.journal_free_bitmap_offset,
            self.journal_free_bitmap_size,
            self.ivfc_l1_offset,
            self.ivfc_l1_size,
            self.ivfc_l2_offset,
            self.ivfc_l2_size,
            self.ivfc_l3_offset,
            self.ivfc_l3_size,
            self.fat_offset,
            self.fat_size,
        ]
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(buf);
        magic(&mut r, LAYOUT_MAGIC)?;
        let version = le_u32(&mut r)?;
        if version != LAYOUT_VERSION_4 && version != LAYOUT_VERSION_5 {
            return Err(Error::UnsupportedVersion(version));
        }
        let hash = bytesa::<32>(&mut r)?;
        let mut f = [0u64; 36];
        for v in &mut f {
            *v = le_u64(&mut r)?;
        }
        let duplex_index = u8(&mut r)?;
        if duplex_index > 1 {
            return Err(Error::Parse("duplex index must be 0 or 1"));
        }
        skip(&mut r, 7)?;

        let mut fat_tree = [0u64; 6];
        if version >= LAYOUT_VERSION_5 {
            for v in &mut fat_tree {
                *v = le_u64(&mut r)?;
            }
        }

        Ok(Self {
            version,
            hash,
            file_map_entry_offset: f[0],
            file_map_entry_size: f[1],
            meta_map_entry_offset: f[2],
            meta_map_entry_size: f[3],
            file_map_data_offset: f[4],
            file_map_data_size: f[5],
            duplex_l1_offset_a: f[6],
            duplex_l1_offset_b: f[7],
            duplex_l1_size: f[8],
            duplex_data_offset_a: f[9],
            duplex_data_offset_b: f[10],
            duplex_data_size: f[11],
            journal_data_offset: f[12],
            journal_data_size: f[13],
            journal_size: f[14],
            duplex_master_offset_a: f[15],
            duplex_master_offset_b: f[16],
            duplex_master_size: f[17],
            ivfc_master_hash_offset: f[18],
            ivfc_master_hash_size: f[19],
            journal_map_table_offset: f[20],
            journal_map_table_size: f[21],
            journal_physical_bitmap_offset: f[22],
            journal_physical_bitmap_size: f[23],
            journal_virtual_bitmap_offset: f[24],
            journal_virtual_bitmap_size: f[25],
            journal_free_bitmap_offset: f[26],
            journal_free_bitmap_size: f[27],
            ivfc_l1_offset: f[28],
            ivfc_l1_size: f[29],
            ivfc_l2_offset: f[30],
            ivfc_l2_size: f[31],
            ivfc_l3_offset: f[32],
            ivfc_l3_size: f[33],
            fat_offset: f[34],
            fat_size: f[35],
            duplex_index,
            fat_ivfc_master_hash_offset: fat_tree[0],
            fat_ivfc_master_hash_size: fat_tree[1],
            fat_ivfc_l1_offset: fat_tree[2],
            fat_ivfc_l1_size: fat_tree[3],
            fat_ivfc_l2_offset: fat_tree[4],
            fat_ivfc_l2_size: fat_tree[5],
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LAYOUT_SIZE as usize);
        out.extend_from_slice(LAYOUT_MAGIC);
        put_u32(&mut out, self.version);
        out.extend_from_slice(&self.hash);
        for v in self.fields() {
            put_u64(&mut out, v);
        }
        out.push(self.duplex_index);
        out.resize(out.len() + 7, 0);
        if self.has_fat_integrity() {
            for v in [
                self.fat_ivfc_master_hash_offset,
                self.fat_ivfc_master_hash_size,
                self.fat_ivfc_l1_offset,
                self.fat_ivfc_l1_size,
                self.fat_ivfc_l2_offset,
                self.fat_ivfc_l2_size,
            ] {
                put_u64(&mut out, v);
            }
        }
        pad_to(out, LAYOUT_SIZE as usize)
    }
}

/// Block sizes of the two duplex levels.
///
/// ```text
/// [0x00] Magic "DPFS"            (4 bytes)
/// [0x04] Version                 (u32 LE)
/// [0x08] Level1BlockSize         (u64 LE)
/// [0x10] DataBlockSize           (u64 LE)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DuplexHeader {
    pub l1_block_size: u64,
    pub data_block_size: u64,
}

impl DuplexHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(buf);
        magic(&mut r, DUPLEX_MAGIC)?;
        let version = le_u32(&mut r)?;
        if version != DUPLEX_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let l1_block_size = le_u64(&mut r)?;
        let data_block_size = le_u64(&mut r)?;
        if l1_block_size == 0 || data_block_size == 0 {
            return Err(Error::Parse("duplex block sizes must be non-zero"));
        }
        Ok(Self {
            l1_block_size,
            data_block_size,
        })
    }

    pub fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(0x20);
        out.extend_from_slice(DUPLEX_MAGIC);
        put_u32(&mut out, DUPLEX_VERSION);
        put_u64(&mut out, self.l1_block_size);
        put_u64(&mut out, self.data_block_size);
        pad_to(out, 0x20)
    }
}

/// Shape of one hash tree: master hash size plus every level below it.
///
/// ```text
/// [0x00] Magic "IVFC"            (4 bytes)
/// [0x04] Version                 (u32 LE)
/// [0x08] MasterHashSize          (u32 LE)
/// [0x0C] LevelCount              (u32 LE) - hash levels plus the data level
/// [0x10] Levels                  (4 x 0x18: offset u64, size u64, block size u32, pad)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvfcHeader {
    pub master_hash_size: u32,
    /// Top hash level first, data level last.
    pub levels: Vec<IntegrityLevelInfo>,
}

impl IvfcHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(buf);
        magic(&mut r, IVFC_MAGIC)?;
        let version = le_u32(&mut r)?;
        if version != IVFC_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let master_hash_size = le_u32(&mut r)?;
        let count = le_u32(&mut r)? as usize;
        if !(2..=IVFC_MAX_LEVELS).contains(&count) {
            return Err(Error::Parse("hash tree level count out of range"));
        }
        let mut levels = Vec::with_capacity(count);
        for _ in 0..count {
            let offset = le_u64(&mut r)?;
            let size = le_u64(&mut r)?;
            let block_size = u64::from(le_u32(&mut r)?);
            skip(&mut r, 4)?;
            levels.push(IntegrityLevelInfo {
                offset,
                size,
                block_size,
            });
        }
        Ok(Self {
            master_hash_size,
            levels,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IVFC_HEADER_SIZE);
        out.extend_from_slice(IVFC_MAGIC);
        put_u32(&mut out, IVFC_VERSION);
        put_u32(&mut out, self.master_hash_size);
        put_u32(&mut out, self.levels.len() as u32);
        for level in &self.levels {
            put_u64(&mut out, level.offset);
            put_u64(&mut out, level.size);
            put_u32(&mut out, level.block_size as u32);
            put_u32(&mut out, 0);
        }
        pad_to(out, IVFC_HEADER_SIZE)
    }
}

/// Save data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SaveDataType {
    #[default]
    System,
    Account,
    Bcat,
    Device,
    Temporary,
    Cache,
    SystemBcat,
    Unknown(u8),
}

impl From<u8> for SaveDataType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::System,
            1 => Self::Account,
            2 => Self::Bcat,
            3 => Self::Device,
            4 => Self::Temporary,
            5 => Self::Cache,
            6 => Self::SystemBcat,
            x => Self::Unknown(x),
        }
    }
}

impl From<SaveDataType> for u8 {
    fn from(v: SaveDataType) -> Self {
        match v {
            SaveDataType::System => 0,
            SaveDataType::Account => 1,
            SaveDataType::Bcat => 2,
            SaveDataType::Device => 3,
            SaveDataType::Temporary => 4,
            SaveDataType::Cache => 5,
            SaveDataType::SystemBcat => 6,
            SaveDataType::Unknown(x) => x,
        }
    }
}

/// Ownership and sizing metadata.
///
/// ```text
/// [0x00] TitleId                 (u64 LE)
/// [0x08] UserId                  (0x10)
/// [0x18] SaveId                  (u64 LE)
/// [0x20] Type                    (u8)
/// [0x21] Reserved                (0x1F)
/// [0x40] SaveOwnerId             (u64 LE)
/// [0x48] Timestamp               (u64 LE, UNIX seconds)
/// [0x50] Flags                   (u32 LE)
/// [0x54] Reserved                (4 bytes)
/// [0x58] DataSize                (u64 LE)
/// [0x60] JournalSize             (u64 LE)
/// [0x68] CommitId                (u64 LE)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtraData {
    pub title_id: u64,
    pub user_id: [u8; 16],
    pub save_id: u64,
    pub save_type: SaveDataType,
    pub owner_id: u64,
    pub timestamp: u64,
    pub flags: u32,
    pub data_size: u64,
    pub journal_size: u64,
    pub commit_id: u64,
}

impl ExtraData {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut r = Cursor::new(buf);
        let title_id = le_u64(&mut r)?;
        let user_id = bytesa::<16>(&mut r)?;
        let save_id = le_u64(&mut r)?;
        let save_type = SaveDataType::from(u8(&mut r)?);
        skip(&mut r, 0x1F)?;
        let owner_id = le_u64(&mut r)?;
        let timestamp = le_u64(&mut r)?;
        let flags = le_u32(&mut r)?;
        skip(&mut r, 4)?;
        let data_size = le_u64(&mut r)?;
        let journal_size = le_u64(&mut r)?;
        let commit_id = le_u64(&mut r)?;
        Ok(Self {
            title_id,
            user_id,
            save_id,
            save_type,
            owner_id,
            timestamp,
            flags,
            data_size,
            journal_size,
            commit_id,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EXTRA_DATA_SIZE as usize);
        put_u64(&mut out, self.title_id);
        out.extend_from_slice(&self.user_id);
        put_u64(&mut out, self.save_id);
        out.push(self.save_type.into());
        out.resize(0x40, 0);
        put_u64(&mut out, self.owner_id);
        put_u64(&mut out, self.timestamp);
        put_u32(&mut out, self.flags);
        put_u32(&mut out, 0);
        put_u64(&mut out, self.data_size);
        put_u64(&mut out, self.journal_size);
        put_u64(&mut out, self.commit_id);
        pad_to(out, EXTRA_DATA_SIZE as usize)
    }
}

/// The parsed header region.
#[derive(Debug, Clone)]
pub struct SaveHeader {
    pub cmac: [u8; 16],
    pub layout: FsLayout,
    pub duplex: DuplexHeader,
    pub save_ivfc: IvfcHeader,
    /// Present for layout version 0x50000 and later.
    pub fat_ivfc: Option<IvfcHeader>,
    pub extra_data: ExtraData,
}

impl SaveHeader {
    /// Parse the records out of a full header region.
    pub fn parse(header: &[u8]) -> Result<Self> {
        if (header.len() as u64) < HEADER_SIZE {
            return Err(Error::UnexpectedEof);
        }
        let at = |offset: u64, len: u64| &header[offset as usize..(offset + len) as usize];

        let mut cmac = [0u8; 16];
        cmac.copy_from_slice(at(CMAC_OFFSET, 0x10));
        let layout = FsLayout::parse(at(LAYOUT_OFFSET, LAYOUT_SIZE))?;
        let duplex = DuplexHeader::parse(at(DUPLEX_HEADER_OFFSET, 0x20))?;
        let save_ivfc = IvfcHeader::parse(at(SAVE_IVFC_HEADER_OFFSET, IVFC_HEADER_SIZE as u64))?;
        let fat_ivfc = if layout.has_fat_integrity() {
            Some(IvfcHeader::parse(at(FAT_IVFC_HEADER_OFFSET, IVFC_HEADER_SIZE as u64))?)
        } else {
            None
        };
        let extra_data = ExtraData::parse(at(EXTRA_DATA_OFFSET, EXTRA_DATA_SIZE))?;

        if layout.ivfc_master_hash_size > MASTER_HASH_CAPACITY
            || layout.fat_ivfc_master_hash_size > MASTER_HASH_CAPACITY
            || layout.duplex_master_size > DUPLEX_MASTER_CAPACITY
        {
            return Err(Error::Corrupted("header structure exceeds its slot"));
        }

        Ok(Self {
            cmac,
            layout,
            duplex,
            save_ivfc,
            fat_ivfc,
            extra_data,
        })
    }

    /// Write every record into a header region buffer. The CMAC and layout
    /// hash are copied as they are, not recomputed.
    pub fn write_into(&self, header: &mut [u8]) {
        let mut put = |offset: u64, bytes: &[u8]| {
            let start = offset as usize;
            header[start..start + bytes.len()].copy_from_slice(bytes);
        };
        put(CMAC_OFFSET, &self.cmac);
        put(LAYOUT_OFFSET, &self.layout.to_bytes());
        put(DUPLEX_HEADER_OFFSET, &self.duplex.to_bytes());
        put(SAVE_IVFC_HEADER_OFFSET, &self.save_ivfc.to_bytes());
        if let Some(fat) = &self.fat_ivfc {
            put(FAT_IVFC_HEADER_OFFSET, &fat.to_bytes());
        }
        put(EXTRA_DATA_OFFSET, &self.extra_data.to_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(version: u32) -> FsLayout {
        FsLayout {
            version,
            hash: [0x11; 32],
            file_map_entry_offset: 0x4000,
            file_map_entry_size: 0x200,
            journal_size: 0x4000,
            fat_offset: 0x1230,
            fat_size: 0x240,
            duplex_index: 1,
            duplex_master_offset_a: DUPLEX_MASTER_OFFSET_A,
            duplex_master_offset_b: DUPLEX_MASTER_OFFSET_B,
            fat_ivfc_l2_size: 0x40,
            ..FsLayout::default()
        }
    }

    #[test]
    fn layout_version_gates_fat_tree_fields() {
        let v5 = layout(LAYOUT_VERSION_5);
        let raw = v5.to_bytes();
        assert_eq!(raw.len(), LAYOUT_SIZE as usize);
        assert_eq!(&raw[..4], b"DISF");
        assert_eq!(raw[0x148], 1);
        assert_eq!(FsLayout::parse(&raw).unwrap(), v5);
        assert_eq!(v5.active_duplex_master_offset(), DUPLEX_MASTER_OFFSET_B);

        // Version 4 layouts carry no allocation table tree.
        let v4 = FsLayout::parse(&layout(LAYOUT_VERSION_4).to_bytes()).unwrap();
        assert!(!v4.has_fat_integrity());
        assert_eq!(v4.fat_ivfc_l2_size, 0);

        let mut bad = raw.clone();
        bad[4..8].copy_from_slice(&0x30000u32.to_le_bytes());
        assert!(matches!(FsLayout::parse(&bad), Err(Error::UnsupportedVersion(0x30000))));
    }

    #[test]
    fn extra_data_field_offsets() {
        let extra = ExtraData {
            title_id: 0x0100000000010000,
            user_id: [7; 16],
            save_type: SaveDataType::Account,
            owner_id: 0x0100000000010000,
            timestamp: 1_600_000_000,
            commit_id: 3,
            ..ExtraData::default()
        };
        let raw = extra.to_bytes();
        assert_eq!(raw[0x20], 1);
        assert_eq!(&raw[0x68..0x70], &3u64.to_le_bytes());
        assert_eq!(ExtraData::parse(&raw).unwrap(), extra);
        assert_eq!(SaveDataType::from(0x42), SaveDataType::Unknown(0x42));
    }

    #[test]
    fn ivfc_header_levels() {
        let header = IvfcHeader {
            master_hash_size: 0x20,
            levels: vec![
                IntegrityLevelInfo {
                    offset: 0x100,
                    size: 0x20,
                    block_size: 0x200,
                },
                IntegrityLevelInfo {
                    offset: 0,
                    size: 0x4000,
                    block_size: 0x200,
                },
            ],
        };
        let raw = header.to_bytes();
        assert_eq!(u32::from_le_bytes(raw[0xC..0x10].try_into().unwrap()), 2);
        assert_eq!(IvfcHeader::parse(&raw).unwrap(), header);
    }
}
