//! Byte-exact on-card records.
//!
//! Multibyte fields are kept as little-endian `[u8; N]` arrays so the
//! structs have alignment 1 and can be cast straight out of page buffers.

pub mod dirent;
pub mod superblock;
