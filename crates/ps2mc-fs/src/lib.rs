//! A library for working with PlayStation 2 memory card images
//!
//! A memory card image is a raw dump of the on-card flash: fixed-size pages
//! grouped into erase blocks, each page optionally followed by a spare area
//! holding a Hamming-style ECC trailer and a bad-block marker. Pages are
//! grouped into clusters, and the clusters host the card filesystem: a
//! superblock, an indirectly addressed FAT, and a tree of 512-byte directory
//! entries.
//!
//! The layers, bottom up:
//!
//! - [`ecc`] computes and checks the per-128-byte-chunk ECC codes.
//! - [`Card`] reads and writes raw pages and clusters, applying ECC and the
//!   bad-block remap.
//! - [`structures`] defines the on-card records (superblock, FAT, directory
//!   entries) and their native-field counterparts.
//! - [`McFs`] is the filesystem proper: path resolution, file handles,
//!   directory operations, free-space accounting and consistency checking.
//!
//! All multibyte on-card integers are little endian.

pub mod ecc;
pub mod structures;
pub mod util;

mod card;
mod error;
mod format;
mod fs;

pub use card::Card;
pub use error::{Error, Result};
pub use format::FormatParams;
pub use fs::file::{McFile, OpenMode};
pub use fs::McFs;
pub use structures::dirent::{DirEntry, DirMode, Tod, DIRENT_SIZE};
pub use structures::superblock::Superblock;
