//! Pure code for reading and writing FAT12, FAT16, and FAT32 volumes. Used in
//! our kernel, and by the `fat-debug` tool on the host.
//!
//! Everything hangs off [`FatVolume`], which owns the block device, the FAT
//! sector cache, and the open-file table. Higher layers only ever see
//! [`FileHandle`] indices.
//!
//! # Resources
//!
//! - <https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system>
//! - <https://academy.cba.mit.edu/classes/networking_communications/SD/FAT.pdf>
//! - <https://wiki.osdev.org/FAT>

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cargo_common_metadata,
    clippy::doc_markdown,
    clippy::implicit_hasher,
    clippy::implicit_return,
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::redundant_pub_crate,
    clippy::suboptimal_flops,
    clippy::wildcard_imports
)]

extern crate alloc;

mod block;
mod boot;
mod chain;
mod config;
mod dialect;
mod directory;
mod error;
mod file;
mod path;
mod sync;
mod table;
mod volume;

#[cfg(test)]
mod testing;

pub use block::*;
pub use boot::{BootSector, VolumeGeometry};
pub use config::*;
pub use dialect::*;
pub use directory::{Attributes, DirectoryEntry, ShortName};
pub use error::*;
pub use file::FileHandle;
pub use sync::*;
pub use table::FatEntry;
pub use volume::FatVolume;
