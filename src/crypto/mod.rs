//! Cryptographic primitives for save containers.
//!
//! Save data is not encrypted; it is authenticated. The header carries an
//! AES-128-CMAC keyed with the console's device-unique save MAC key, and
//! the data itself is covered by SHA-256 hash trees (see
//! [`crate::storage::integrity`]). Key material is supplied already loaded
//! through [`crate::keys::KeySet`]; nothing here derives keys.
//!
//! ## Submodules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`aes`]  | AES-128 forward cipher (pure Rust, table based) |
//! | [`cmac`] | AES-CMAC per RFC 4493, used to sign the container header |

pub mod aes;
pub mod cmac;

pub use cmac::aes_cmac;

use sha2::{Digest, Sha256};

/// Plain SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}
