/// The superblock, stored at the head of cluster 0 (and duplicated in
/// cluster 1 as a backup copy).
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct RawSuperblock {
    /// The 28-byte ASCII magic, "Sony PS2 Memory Card Format ".
    pub magic: [u8; 28],
    /// Format version string, zero padded ("1.2.0.0").
    pub version: [u8; 12],
    /// Size in bytes of a page's data area.
    pub page_size: [u8; 2],
    /// Pages per filesystem cluster.
    pub pages_per_cluster: [u8; 2],
    /// Pages per erase block.
    pub pages_per_block: [u8; 2],
    /// Unused; 0xFF00 on cards formatted by the console.
    pub unused: [u8; 2],
    /// Total clusters on the card, including reserved ones.
    pub clusters_per_card: [u8; 4],
    /// First cluster of the allocatable area. FAT entries and directory
    /// cluster numbers are relative to this.
    pub alloc_offset: [u8; 4],
    /// End (exclusive, absolute) of the allocatable area.
    pub alloc_end: [u8; 4],
    /// First cluster of the root directory, relative to `alloc_offset`.
    pub rootdir_cluster: [u8; 4],
    /// Erase block backing writes remapped from the first bad block.
    pub backup_block1: [u8; 4],
    /// Erase block backing writes remapped from the second bad block.
    pub backup_block2: [u8; 4],
    pub unused2: [u8; 8],
    /// Absolute cluster numbers of the indirect FAT table clusters;
    /// unused entries are zero.
    pub ifc_list: [[u8; 4]; 32],
    /// Erase blocks marked bad; unused entries are 0xFFFFFFFF.
    pub bad_block_list: [[u8; 4]; 32],
    /// Card type; 2 for a PS2 memory card.
    pub card_type: u8,
    pub card_flags: u8,
    pub unused3: [u8; 2],
}

/// Size of the superblock record in bytes.
pub const SUPERBLOCK_SIZE: usize = 340;

unsafe impl bytemuck::Zeroable for RawSuperblock {}
unsafe impl bytemuck::NoUninit for RawSuperblock {}
unsafe impl bytemuck::AnyBitPattern for RawSuperblock {}

impl RawSuperblock {
    pub fn from_bytes(bytes: &[u8; SUPERBLOCK_SIZE]) -> Self {
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

    const_assert_eq!(size_of::<RawSuperblock>(), SUPERBLOCK_SIZE);
    const_assert_eq!(align_of::<RawSuperblock>(), 1);

    const_assert_eq!(offset_of!(RawSuperblock, magic), 0);
    const_assert_eq!(offset_of!(RawSuperblock, version), 28);
    const_assert_eq!(offset_of!(RawSuperblock, page_size), 40);
    const_assert_eq!(offset_of!(RawSuperblock, pages_per_cluster), 42);
    const_assert_eq!(offset_of!(RawSuperblock, pages_per_block), 44);
    const_assert_eq!(offset_of!(RawSuperblock, clusters_per_card), 48);
    const_assert_eq!(offset_of!(RawSuperblock, alloc_offset), 52);
    const_assert_eq!(offset_of!(RawSuperblock, alloc_end), 56);
    const_assert_eq!(offset_of!(RawSuperblock, rootdir_cluster), 60);
    const_assert_eq!(offset_of!(RawSuperblock, backup_block1), 64);
    const_assert_eq!(offset_of!(RawSuperblock, backup_block2), 68);
    const_assert_eq!(offset_of!(RawSuperblock, ifc_list), 80);
    const_assert_eq!(offset_of!(RawSuperblock, bad_block_list), 208);
    const_assert_eq!(offset_of!(RawSuperblock, card_type), 336);
    const_assert_eq!(offset_of!(RawSuperblock, card_flags), 337);
}
