//! Save data containers.
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`header`]           | Header region records: layout, duplex, hash trees, extra data |
//! | [`allocation_table`] | Block chains over the data area |
//! | [`tables`]           | Directory and file table records |
//! | [`core`]             | Directories and files over the allocation table |
//! | [`create`]           | Parameters and layout of new containers |
//! | [`filesystem`]       | The assembled, signed container |

pub mod allocation_table;
pub mod core;
pub mod create;
pub mod filesystem;
pub mod header;
pub mod tables;

pub use allocation_table::{AllocationTable, ChainId, Run};
pub use self::core::{DirectoryEntry, EntryType, OpenMode, SaveDataFileSystemCore, SaveFile};
pub use create::SaveDataCreateInfo;
pub use filesystem::{FatStorage, RawLayer, SaveDataFileSystem, SaveDataStorage, VerifyReport};
pub use header::{ExtraData, FsLayout, SaveDataType, SaveHeader};
