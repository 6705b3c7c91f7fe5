use std::fs;
use std::path::PathBuf;

use savekit::Error;
use savekit::keys::KeySet;
use savekit::save::header::LAYOUT_VERSION_4;
use savekit::save::{
    ChainId, EntryType, OpenMode, RawLayer, SaveDataCreateInfo, SaveDataFileSystem,
};
use savekit::storage::{FileStorage, IntegrityCheckLevel, MemoryStorage, Validity};

const TITLE_ID: u64 = 0x0100000000010000;
const SLOT: &str = "/save/slot1.bin";

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn keys() -> KeySet {
    KeySet::with_save_mac_key([0x5A; 16])
}

fn info() -> SaveDataCreateInfo {
    SaveDataCreateInfo::default()
        .with_block_size(0x1000)
        .with_blocks(64, 32)
        .with_title_id(TITLE_ID)
}

fn slot_contents() -> Vec<u8> {
    (0..4096u32).map(|i| (i * 7 + 3) as u8).collect()
}

/// A committed container holding `/save/slot1.bin`.
fn saved(info: &SaveDataCreateInfo) -> MemoryStorage {
    let mut fs = SaveDataFileSystem::create(MemoryStorage::new(0), info).unwrap();
    fs.create_directory("/save").unwrap();
    fs.create_file(SLOT, 4096).unwrap();
    fs.open_file(SLOT, OpenMode::WRITE)
        .unwrap()
        .write(0, &slot_contents())
        .unwrap();
    fs.commit(&keys()).unwrap();
    fs.into_inner().unwrap()
}

fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("savekit-{tag}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
}

#[test]
fn committed_file_survives_reopen() {
    init();
    let disk = saved(&info());
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();

    assert_eq!(fs.extra_data().title_id, TITLE_ID);
    assert_eq!(fs.extra_data().commit_id, 1);
    assert_eq!(fs.get_entry_type("/save").unwrap(), EntryType::Directory);
    assert_eq!(fs.read_file(SLOT).unwrap(), slot_contents());

    let report = fs.verify().unwrap();
    assert!(report.is_valid(), "{report:?}");
    assert_eq!(report.save_levels.len(), 4);
    assert_eq!(report.fat_levels.as_ref().map(Vec::len), Some(3));
    assert_eq!(fs.signature_validity(&keys()).unwrap(), Validity::Valid);
}

#[test]
fn delete_trim_commit_frees_space() {
    init();
    let disk = saved(&info());
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    let before = fs.free_space_size().unwrap();

    fs.delete_file(SLOT).unwrap();
    let trimmed = fs.trim().unwrap();
    assert!(trimmed > 0);
    fs.commit(&keys()).unwrap();

    assert!(fs.free_space_size().unwrap() >= before + 4096);
    assert!(matches!(fs.get_entry_type(SLOT), Err(Error::NotFound)));

    let disk = fs.into_inner().unwrap();
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    assert!(matches!(fs.get_entry_type(SLOT), Err(Error::NotFound)));
    assert_eq!(fs.get_entry_type("/save").unwrap(), EntryType::Directory);
    assert!(fs.verify().unwrap().is_valid());
}

#[test]
fn tampered_data_fails_strict_reads() {
    init();
    let mut disk = saved(&info());
    let layout = {
        let fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::None).unwrap();
        let layout = fs.header().layout.clone();
        disk = fs.into_inner().unwrap();
        layout
    };

    let start = (layout.file_map_data_offset + layout.journal_data_offset) as usize;
    let end = start + layout.journal_data_size as usize;
    for byte in &mut disk.as_mut_slice()[start..end] {
        *byte ^= 0xA5;
    }

    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    assert!(matches!(
        fs.get_entry_type(SLOT),
        Err(Error::IntegrityMismatch { .. })
    ));
    let disk = fs.into_inner().unwrap();

    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::IgnoreOnInvalid).unwrap();
    let report = fs.verify().unwrap();
    assert!(!report.is_valid());
    assert_eq!(report.header_hash, Validity::Valid);
    assert_eq!(report.save_levels.last(), Some(&Validity::Invalid));
}

#[test]
fn tampered_header_is_rejected_in_strict_mode() {
    init();
    let mut disk = saved(&info());
    // A byte of the extra data, inside the hashed region.
    disk.as_mut_slice()[0x508] ^= 1;

    assert!(matches!(
        SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid),
        Err(Error::Corrupted(_))
    ));
}

#[test]
fn commit_needs_the_save_mac_key() {
    init();
    let mut fs = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
    fs.create_directory("/save").unwrap();

    assert!(matches!(fs.commit(&KeySet::new()), Err(Error::Signing)));
    assert!(fs.has_uncommitted_changes());
    assert_eq!(fs.extra_data().commit_id, 0);

    fs.commit(&keys()).unwrap();
    assert!(!fs.has_uncommitted_changes());
    assert_eq!(fs.extra_data().commit_id, 1);
}

#[test]
fn rollback_restores_last_commit() {
    init();
    let disk = saved(&info());
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    let free = fs.free_space_size().unwrap();

    fs.write_file("/save/slot2.bin", &[0xEE; 3 * 4096]).unwrap();
    fs.open_file(SLOT, OpenMode::WRITE)
        .unwrap()
        .write(100, b"overwritten")
        .unwrap();
    fs.rename_directory("/save", "/moved").unwrap();
    assert!(fs.free_space_size().unwrap() < free);

    fs.rollback().unwrap();
    assert_eq!(fs.free_space_size().unwrap(), free);
    assert_eq!(fs.read_file(SLOT).unwrap(), slot_contents());
    assert!(matches!(fs.get_entry_type("/save/slot2.bin"), Err(Error::NotFound)));
    assert!(matches!(fs.get_entry_type("/moved"), Err(Error::NotFound)));

    fs.commit(&keys()).unwrap();
    let disk = fs.into_inner().unwrap();
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    assert_eq!(fs.read_file(SLOT).unwrap(), slot_contents());
    assert!(fs.verify().unwrap().is_valid());
}

#[test]
fn dropped_session_reopens_at_last_commit() {
    init();
    let disk = saved(&info());
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    let free = fs.free_space_size().unwrap();

    fs.write_file("/a.bin", &[0x33; 0x4000]).unwrap();
    fs.open_file(SLOT, OpenMode::WRITE)
        .unwrap()
        .write(0, b"torn")
        .unwrap();
    fs.create_directory("/save/new").unwrap();
    // No commit: the session ends as if the process died here.
    let disk = fs.into_inner().unwrap();

    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    assert_eq!(fs.header_hash_validity(), Validity::Valid);
    assert_eq!(fs.extra_data().commit_id, 1);
    assert!(!fs.has_uncommitted_changes());
    assert!(matches!(fs.get_entry_type("/a.bin"), Err(Error::NotFound)));
    assert!(matches!(fs.get_entry_type("/save/new"), Err(Error::NotFound)));
    assert_eq!(fs.read_file(SLOT).unwrap(), slot_contents());
    assert_eq!(fs.free_space_size().unwrap(), free);
    assert!(fs.verify().unwrap().is_valid());
    assert_eq!(fs.signature_validity(&keys()).unwrap(), Validity::Valid);
}

#[test]
fn lenient_reopen_then_rollback_keeps_every_block() {
    init();
    let disk = saved(&info());
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::IgnoreOnInvalid).unwrap();
    let free = fs.free_space_size().unwrap();
    fs.write_file("/a.bin", &[0x44; 0x6000]).unwrap();
    let disk = fs.into_inner().unwrap();

    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::IgnoreOnInvalid).unwrap();
    fs.rollback().unwrap();
    assert_eq!(fs.free_space_size().unwrap(), free);
    assert!(matches!(fs.get_entry_type("/a.bin"), Err(Error::NotFound)));

    fs.write_file("/b.bin", &[0x55; 0x6000]).unwrap();
    assert_eq!(fs.free_space_size().unwrap(), free - 0x6000);
    fs.commit(&keys()).unwrap();

    let (free_runs, dirs, files) = {
        let table = fs.allocation_table();
        (
            table.runs(ChainId::Free).unwrap(),
            table.runs(ChainId::DirectoryTable).unwrap(),
            table.runs(ChainId::FileTable).unwrap(),
        )
    };
    let mut owners = vec![0u32; fs.allocation_table().block_count() as usize];
    let chains = [
        free_runs,
        dirs,
        files,
        fs.file_chain_runs(SLOT).unwrap(),
        fs.file_chain_runs("/b.bin").unwrap(),
    ];
    for run in chains.into_iter().flatten() {
        for block in run.start..run.start + run.len {
            owners[block as usize] += 1;
        }
    }
    assert!(owners.iter().all(|&n| n == 1), "{owners:?}");
}

#[test]
fn failed_journal_write_rolls_back_cleanly() {
    init();
    let disk = saved(&info());
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    let free = fs.free_space_size().unwrap();

    // More changed blocks than the journal has spares for.
    assert!(fs.write_file("/huge.bin", &[0x66; 40 * 0x1000]).is_err());

    fs.rollback().unwrap();
    assert!(!fs.has_uncommitted_changes());
    assert_eq!(fs.free_space_size().unwrap(), free);
    assert!(matches!(fs.get_entry_type("/huge.bin"), Err(Error::NotFound)));
    assert_eq!(fs.read_file(SLOT).unwrap(), slot_contents());

    fs.write_file("/small.bin", &[0x77; 2 * 0x1000]).unwrap();
    fs.commit(&keys()).unwrap();
    let disk = fs.into_inner().unwrap();
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    assert_eq!(fs.read_file("/small.bin").unwrap(), vec![0x77; 2 * 0x1000]);
    assert!(fs.verify().unwrap().is_valid());
}

#[test]
fn trim_wipes_deleted_contents() {
    init();
    let disk = saved(&info());
    let needle = slot_contents()[..64].to_vec();
    assert!(disk.as_slice().windows(64).any(|w| w == needle));

    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    fs.delete_file(SLOT).unwrap();
    fs.trim().unwrap();
    fs.commit(&keys()).unwrap();
    let disk = fs.into_inner().unwrap();
    assert!(!disk.as_slice().windows(64).any(|w| w == needle));

    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    fs.write_file("/after.bin", &[0x12; 3 * 0x1000]).unwrap();
    fs.commit(&keys()).unwrap();
    assert_eq!(fs.read_file("/after.bin").unwrap(), vec![0x12; 3 * 0x1000]);
    assert!(fs.verify().unwrap().is_valid());
}

#[test]
fn export_debug_dumps_every_layer() {
    init();
    let disk = saved(&info());
    let mut save = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    let layout = save.header().layout.clone();
    let dir = temp_dir("debug");

    assert_eq!(save.export_debug(&dir).unwrap(), RawLayer::ALL.len() as u32);
    let len = |path: &str| fs::metadata(dir.join(path)).unwrap().len();
    assert_eq!(len("journal/data"), layout.journal_data_size);
    assert_eq!(len("save/data"), 64 * 0x1000);
    assert_eq!(len("save/allocation_table"), layout.fat_size);
    assert_eq!(len("save/fat_l2_hash"), layout.fat_ivfc_l2_size);
    assert_eq!(len("duplex/data_b"), layout.duplex_data_size);
    assert_eq!(len("data_remap/base"), layout.file_map_data_size);
    assert!(fs::read(dir.join("journal/header")).unwrap().starts_with(b"JNGL"));
    assert!(fs::read(dir.join("meta_remap/header")).unwrap().starts_with(b"RMAP"));

    let save_data = fs::read(dir.join("save/data")).unwrap();
    assert!(save_data.windows(64).any(|w| w == &slot_contents()[..64]));
    fs::remove_dir_all(&dir).unwrap();

    let disk = saved(&info().with_version(LAYOUT_VERSION_4));
    let mut save = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    let dir = temp_dir("debug-v4");
    assert_eq!(save.export_debug(&dir).unwrap(), RawLayer::ALL.len() as u32 - 3);
    assert!(!dir.join("save/fat_master_hash").exists());
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn every_block_belongs_to_exactly_one_chain() {
    init();
    let mut fs = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
    fs.create_directory("/a").unwrap();
    fs.create_directory("/a/b").unwrap();
    for i in 0..6u64 {
        fs.create_file(&format!("/a/f{i}"), i * 0x1800).unwrap();
    }
    fs.delete_file("/a/f1").unwrap();
    fs.delete_file("/a/f4").unwrap();
    fs.create_file("/a/b/big", 9 * 0x1000).unwrap();
    fs.open_file("/a/f5", OpenMode::WRITE)
        .unwrap()
        .set_size(0x800)
        .unwrap();
    fs.commit(&keys()).unwrap();

    let files = fs
        .entries("/")
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| e.kind == EntryType::File)
        .map(|e| e.path)
        .collect::<Vec<_>>();
    assert_eq!(files.len(), 5);

    let mut chains = files
        .iter()
        .map(|path| fs.file_chain_runs(path).unwrap())
        .collect::<Vec<_>>();
    let table = fs.allocation_table();
    for chain in [ChainId::Free, ChainId::DirectoryTable, ChainId::FileTable] {
        chains.push(table.runs(chain).unwrap());
    }

    let mut owners = vec![0u32; table.block_count() as usize];
    for run in chains.into_iter().flatten() {
        for block in run.start..run.start + run.len {
            owners[block as usize] += 1;
        }
    }
    assert!(owners.iter().all(|&n| n == 1), "{owners:?}");
}

#[test]
fn version_4_container_round_trips() {
    init();
    let info = info().with_version(LAYOUT_VERSION_4);
    let disk = saved(&info);
    let mut fs = SaveDataFileSystem::open(disk, IntegrityCheckLevel::ErrorOnInvalid).unwrap();

    assert!(!fs.header().layout.has_fat_integrity());
    assert!(fs.header().fat_ivfc.is_none());
    assert_eq!(fs.read_file(SLOT).unwrap(), slot_contents());
    let report = fs.verify().unwrap();
    assert!(report.is_valid());
    assert!(report.fat_levels.is_none());
}

#[test]
fn keys_loaded_from_text_sign_the_header() {
    init();
    let mut keys = KeySet::new();
    keys.load_keys(
        "; test keys\nheader_key = 00\nsave_mac_key = 000102030405060708090a0b0c0d0e0f\n"
            .as_bytes(),
    )
    .unwrap();

    let mut fs = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
    fs.commit(&keys).unwrap();
    assert_eq!(fs.signature_validity(&keys).unwrap(), Validity::Valid);
    assert_eq!(fs.signature_validity(&self::keys()).unwrap(), Validity::Invalid);
}

#[test]
fn host_file_backed_container() {
    init();
    let dir = temp_dir("file");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join("save.bin");

    let storage = FileStorage::create(&path).unwrap();
    let mut save = SaveDataFileSystem::create(storage, &info()).unwrap();
    save.write_file("/data.bin", b"persisted").unwrap();
    save.commit(&keys()).unwrap();
    drop(save.into_inner().unwrap());

    assert_eq!(
        fs::metadata(&path).unwrap().len(),
        info().container_size().unwrap()
    );
    let storage = FileStorage::open(&path, false).unwrap();
    let mut save = SaveDataFileSystem::open(storage, IntegrityCheckLevel::ErrorOnInvalid).unwrap();
    assert_eq!(save.read_file("/data.bin").unwrap(), b"persisted");
    assert!(save.verify().unwrap().is_valid());

    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn import_then_export_reproduces_the_tree() {
    init();
    let source = temp_dir("import");
    fs::create_dir_all(source.join("save/sub")).unwrap();
    fs::write(source.join("save/slot1.bin"), slot_contents()).unwrap();
    fs::write(source.join("save/sub/config.txt"), b"volume=7").unwrap();
    fs::write(source.join("empty.bin"), b"").unwrap();

    let mut save = SaveDataFileSystem::create(MemoryStorage::new(0), &info()).unwrap();
    let mut reported = Vec::new();
    save.import_directory(&source, |path, done, total| {
        reported.push((path.to_string(), done, total));
    })
    .unwrap();
    assert!(reported.contains(&(SLOT.to_string(), 4096, 4096)));
    save.commit(&keys()).unwrap();

    assert_eq!(save.read_file("/save/sub/config.txt").unwrap(), b"volume=7");
    assert_eq!(save.get_entry_type("/empty.bin").unwrap(), EntryType::File);

    let target = temp_dir("export");
    save.export_directory(&target, |_, _, _| {}).unwrap();
    assert_eq!(fs::read(target.join("save/slot1.bin")).unwrap(), slot_contents());
    assert_eq!(fs::read(target.join("save/sub/config.txt")).unwrap(), b"volume=7");
    assert_eq!(fs::read(target.join("empty.bin")).unwrap(), b"");

    fs::remove_dir_all(&source).unwrap();
    fs::remove_dir_all(&target).unwrap();
}
