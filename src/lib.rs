//! Async Rust driver for GnuPG key ring, signing and verification operations.
//!
//! This crate runs `gpg` as a subprocess for a fixed set of operations
//! (import, delete, fingerprint lookup, inline and detached verification,
//! inline and detached signing) and parses gpg's human-readable output into
//! Rust types.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use gpg_ring::Keyring;
//!
//! #[tokio::main]
//! async fn main() -> gpg_ring::Result<()> {
//!     let keyring = Keyring::new("/var/lib/app/gnupg");
//!
//!     let signer = keyring
//!         .verify_detached(Path::new("release.tar"), Path::new("release.tar.asc"))
//!         .await?;
//!     println!("signed by {:?}", signer.hex_ids);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Output parsing
//!
//! Results come from matching gpg's text output against a fixed pattern
//! table, so gpg is always run with `LC_ALL=C`. Key IDs are the 8 digit
//! short form printed by GnuPG 1.x style output. A change in gpg's wording
//! shows up as [`Error::UnverifiedSignature`] or [`Error::ImportNotConfirmed`]
//! rather than as a parse error.
//!
//! # Requirements
//!
//! - `gpg` on `PATH`, or [`GpgOptions::program`] pointing at it
//! - Write access to the home directory for import and delete

mod error;
mod keyring;
mod launch;
mod parse;
mod types;
mod validation;

pub use error::{Error, Result};
pub use keyring::{Keyring, ReadOnlyKeyring};
pub use parse::PATTERN_TABLE_VERSION;
pub use types::{GpgOptions, KeyData, KeyType};
pub use validation::{HexId, is_hex_id, validate_hex_id};
