use std::env;
use std::fs::File;
use std::path::Path;

use savekit::keys::KeySet;
use savekit::save::SaveDataFileSystem;
use savekit::storage::{FileStorage, IntegrityCheckLevel};
use savekit::{Error, Result};

fn main() -> Result<()> {
    let path = env::args().nth(1).ok_or(Error::InvalidPath("usage: program <save file> [debug dir]"))?;

    let mut keys = KeySet::new();
    if let Ok(file) = File::open("prod.keys") {
        keys.load_keys(file)?;
    }

    let storage = FileStorage::open(&path, false)?;
    let mut save = SaveDataFileSystem::open(storage, IntegrityCheckLevel::IgnoreOnInvalid)?;

    let extra = save.extra_data();
    println!("title id:  {:016X}", extra.title_id);
    println!("commit id: {}", extra.commit_id);

    for entry in save.entries("/")? {
        let entry = entry?;
        println!("{:>10}  {}", entry.size, entry.path);
    }

    let report = save.verify()?;
    println!("header hash{}", report.header_hash.describe());
    for (level, validity) in report.save_levels.iter().enumerate() {
        println!("save level {}{}", level + 1, validity.describe());
    }
    if keys.save_mac_key(0).is_some() {
        println!("signature{}", save.signature_validity(&keys)?.describe());
    }
    println!("free space: {:#x} / {:#x}", save.free_space_size()?, save.total_space_size());

    if let Some(dir) = env::args().nth(2) {
        let files = save.export_debug(Path::new(&dir))?;
        println!("dumped {files} layers to {dir}");
    }

    Ok(())
}
