//! **savekit** - a Rust library for Nintendo Switch save data containers.
//!
//! A save container is one file holding a journaled, hash-verified,
//! CMAC-signed filesystem. [`save::SaveDataFileSystem`] opens or creates
//! one and exposes its directories and files; the layers it is built from
//! are usable on their own through [`storage`].
//!
//! # Modules
//! | Module | Contents |
//! |--------|----------|
//! | [`storage`] | The [`storage::Storage`] trait and every storage layer |
//! | [`save`]    | Header records, allocation table, filesystem, container |
//! | [`crypto`]  | AES-CMAC and SHA-256 |
//! | [`keys`]    | Save MAC key loading |

pub mod crypto;
pub mod error;
pub mod keys;
pub mod save;
pub mod storage;
pub mod utils;

pub use error::{Error, Result};
