//! Key management for save container signing.
//!
//! A save container header is signed with a *device-unique save MAC key*.
//! Consoles carry one such key per key slot; slot 0 is the one used for
//! ordinary save data. This module is a plain data container - it performs
//! no key derivation. Callers load keys from a `prod.keys` / `console.keys`
//! style file and hand the [`KeySet`] to
//! [`crate::save::SaveDataFileSystem::commit`].
//!
//! ## Key file format
//! `name = hex_value` lines, comments prefixed with `;`. Recognised names:
//! `save_mac_key` (slot 0) and `save_mac_key_XX` (slot `XX`, hex).

use std::io::{BufRead, BufReader, Read};
use std::result::Result as StdResult;

use crate::{Error, Result};

/// Number of device-unique save MAC key slots.
pub const SAVE_MAC_KEY_SLOTS: usize = 2;

/// Keys consumed by the save stack.
#[derive(Debug, Default, Clone)]
pub struct KeySet {
    /// Device-unique save MAC keys, indexed by slot.
    pub device_unique_save_mac_keys: [Option<[u8; 16]>; SAVE_MAC_KEY_SLOTS],
}

impl KeySet {
    /// Create an empty key set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a key set holding a single slot-0 save MAC key.
    pub fn with_save_mac_key(key: [u8; 16]) -> Self {
        let mut keys = Self::new();
        keys.device_unique_save_mac_keys[0] = Some(key);
        keys
    }

    /// Load keys from a `prod.keys`-style reader.
    ///
    /// Unknown names and malformed values are skipped so that a key file
    /// full of unrelated keys still loads.
    pub fn load_keys<R: Read>(&mut self, reader: R) -> Result<()> {
        let buf = BufReader::new(reader);
        for line in buf.lines() {
            let line = line.map_err(Error::Io)?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let name = name.trim();
            let Ok(key) = decode_hex_16(value) else {
                continue;
            };

            let slot = if name == "save_mac_key" {
                Some(0)
            } else {
                name.strip_prefix("save_mac_key_")
                    .and_then(|s| usize::from_str_radix(s, 16).ok())
            };
            if let Some(slot) = slot
                && slot < SAVE_MAC_KEY_SLOTS
            {
                self.device_unique_save_mac_keys[slot] = Some(key);
            }
        }
        Ok(())
    }

    /// Look up the save MAC key in `slot`.
    pub fn save_mac_key(&self, slot: usize) -> Option<&[u8; 16]> {
        self.device_unique_save_mac_keys.get(slot)?.as_ref()
    }
}

fn decode_hex_16(s: &str) -> StdResult<[u8; 16], ()> {
    let s = s.trim();
    if s.len() != 32 {
        return Err(());
    }
    let mut out = [0u8; 16];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        out[i] = (hex_nibble(chunk[0])? << 4) | hex_nibble(chunk[1])?;
    }
    Ok(out)
}

fn hex_nibble(b: u8) -> StdResult<u8, ()> {
    match b {
        b'0'..=b'9' => Ok(b - b'0'),
        b'a'..=b'f' => Ok(b - b'a' + 10),
        b'A'..=b'F' => Ok(b - b'A' + 10),
        _ => Err(()),
    }
}
