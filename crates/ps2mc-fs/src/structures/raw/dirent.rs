/// A packed time-of-day stamp: calendar fields, little-endian year.
///
/// The year is stored absolute (2003, not an offset); the console never
/// writes dates before the year 2000.
#[repr(C, packed)]
#[derive(Clone, Copy, Default)]
pub struct RawTod {
    pub resv: u8,
    pub sec: u8,
    pub min: u8,
    pub hour: u8,
    pub mday: u8,
    pub month: u8,
    pub year: [u8; 2],
}

/// A 512-byte directory entry record.
///
/// Entry 0 of every directory is "." and entry 1 is "..". "." stores the
/// entry's own location in the parent directory (the parent's first cluster
/// in `cluster`, the slot index in `dir_entry`); ".." stores the directory's
/// own first cluster. Cluster numbers are relative to the superblock's
/// allocation offset.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RawDirEntry {
    /// Attribute bit-field; bit 15 distinguishes live entries from
    /// tombstones.
    pub mode: [u8; 2],
    pub unused: [u8; 2],
    /// Byte length for files; total entry slots (tombstones included) for
    /// directories.
    pub length: [u8; 4],
    pub created: RawTod,
    /// First cluster of the file or directory, relative to the allocation
    /// offset.
    pub cluster: [u8; 4],
    /// Index of this directory's entry within its parent (meaningful in "."
    /// entries only).
    pub dir_entry: [u8; 4],
    pub modified: RawTod,
    pub attr: [u8; 4],
    pub unused2: [u8; 28],
    /// NUL-padded raw name bytes; compared case sensitively.
    pub name: [u8; 32],
    pub padding: [u8; 416],
}

/// Size of a directory entry record in bytes.
pub const DIRENT_SIZE: usize = 512;

unsafe impl bytemuck::Zeroable for RawTod {}
unsafe impl bytemuck::NoUninit for RawTod {}
unsafe impl bytemuck::AnyBitPattern for RawTod {}

unsafe impl bytemuck::Zeroable for RawDirEntry {}
unsafe impl bytemuck::NoUninit for RawDirEntry {}
unsafe impl bytemuck::AnyBitPattern for RawDirEntry {}

impl RawDirEntry {
    pub fn from_bytes(bytes: &[u8; DIRENT_SIZE]) -> Self {
        bytemuck::pod_read_unaligned(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{align_of, offset_of, size_of};
    use static_assertions::const_assert_eq;

    const_assert_eq!(size_of::<RawTod>(), 8);
    const_assert_eq!(align_of::<RawTod>(), 1);

    const_assert_eq!(size_of::<RawDirEntry>(), DIRENT_SIZE);
    const_assert_eq!(align_of::<RawDirEntry>(), 1);

    const_assert_eq!(offset_of!(RawDirEntry, mode), 0);
    const_assert_eq!(offset_of!(RawDirEntry, length), 4);
    const_assert_eq!(offset_of!(RawDirEntry, created), 8);
    const_assert_eq!(offset_of!(RawDirEntry, cluster), 16);
    const_assert_eq!(offset_of!(RawDirEntry, dir_entry), 20);
    const_assert_eq!(offset_of!(RawDirEntry, modified), 24);
    const_assert_eq!(offset_of!(RawDirEntry, attr), 32);
    const_assert_eq!(offset_of!(RawDirEntry, name), 64);
    const_assert_eq!(offset_of!(RawDirEntry, padding), 96);
}
