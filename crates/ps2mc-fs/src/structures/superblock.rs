use crate::error::{Error, Result};
use crate::structures::raw::superblock::{RawSuperblock, SUPERBLOCK_SIZE};
use crate::util::zero_terminate;

/// The 28-byte magic at the head of every formatted card.
pub const MAGIC: &[u8; 28] = b"Sony PS2 Memory Card Format ";

/// Format version written by this implementation.
pub const FORMAT_VERSION: &[u8] = b"1.2.0.0";

/// Card type byte for a PS2 memory card.
pub const CARD_TYPE_PS2: u8 = 2;

/// Flag byte the console writes on formatted cards.
pub const CARD_FLAGS: u8 = 0x52;

/// Native-field view of the superblock.
///
/// Cluster numbers in `ifc_list` are absolute; `rootdir_cluster` is relative
/// to `alloc_offset`, like every cluster number stored in the FAT and in
/// directory entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub version: [u8; 12],
    pub page_size: u16,
    pub pages_per_cluster: u16,
    pub pages_per_block: u16,
    pub clusters_per_card: u32,
    pub alloc_offset: u32,
    pub alloc_end: u32,
    pub rootdir_cluster: u32,
    pub backup_block1: u32,
    pub backup_block2: u32,
    pub ifc_list: [u32; 32],
    pub bad_block_list: [u32; 32],
    pub card_type: u8,
    pub card_flags: u8,
}

impl Superblock {
    /// Parses and validates a raw superblock record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SUPERBLOCK_SIZE {
            return Err(Error::Corrupt("image too small for a superblock".into()));
        }
        let raw = RawSuperblock::from_bytes(bytes[..SUPERBLOCK_SIZE].try_into().unwrap());
        if raw.magic != *MAGIC {
            return Err(Error::Corrupt("not a PS2 memory card image".into()));
        }
        let sb = Self {
            version: raw.version,
            page_size: u16::from_le_bytes(raw.page_size),
            pages_per_cluster: u16::from_le_bytes(raw.pages_per_cluster),
            pages_per_block: u16::from_le_bytes(raw.pages_per_block),
            clusters_per_card: u32::from_le_bytes(raw.clusters_per_card),
            alloc_offset: u32::from_le_bytes(raw.alloc_offset),
            alloc_end: u32::from_le_bytes(raw.alloc_end),
            rootdir_cluster: u32::from_le_bytes(raw.rootdir_cluster),
            backup_block1: u32::from_le_bytes(raw.backup_block1),
            backup_block2: u32::from_le_bytes(raw.backup_block2),
            ifc_list: raw.ifc_list.map(u32::from_le_bytes),
            bad_block_list: raw.bad_block_list.map(u32::from_le_bytes),
            card_type: raw.card_type,
            card_flags: raw.card_flags,
        };
        sb.validate()?;
        Ok(sb)
    }

    pub fn to_raw(&self) -> RawSuperblock {
        RawSuperblock {
            magic: *MAGIC,
            version: self.version,
            page_size: self.page_size.to_le_bytes(),
            pages_per_cluster: self.pages_per_cluster.to_le_bytes(),
            pages_per_block: self.pages_per_block.to_le_bytes(),
            unused: [0x00, 0xFF],
            clusters_per_card: self.clusters_per_card.to_le_bytes(),
            alloc_offset: self.alloc_offset.to_le_bytes(),
            alloc_end: self.alloc_end.to_le_bytes(),
            rootdir_cluster: self.rootdir_cluster.to_le_bytes(),
            backup_block1: self.backup_block1.to_le_bytes(),
            backup_block2: self.backup_block2.to_le_bytes(),
            unused2: [0; 8],
            ifc_list: self.ifc_list.map(u32::to_le_bytes),
            bad_block_list: self.bad_block_list.map(u32::to_le_bytes),
            card_type: self.card_type,
            card_flags: self.card_flags,
            unused3: [0; 2],
        }
    }

    fn validate(&self) -> Result<()> {
        let corrupt = |msg: &str| Err(Error::Corrupt(msg.into()));
        if self.page_size == 0 || self.page_size % 128 != 0 {
            return corrupt("unsupported page size");
        }
        if self.pages_per_cluster == 0
            || self.pages_per_block == 0
            || self.pages_per_block % self.pages_per_cluster != 0
        {
            return corrupt("invalid cluster geometry");
        }
        if self.alloc_offset >= self.alloc_end || self.alloc_end > self.clusters_per_card {
            return corrupt("invalid allocatable cluster range");
        }
        if self.rootdir_cluster >= self.alloc_end - self.alloc_offset {
            return corrupt("root directory outside the allocatable range");
        }
        if self.ifc_list.iter().all(|&c| c == 0) {
            return corrupt("empty indirect FAT list");
        }
        Ok(())
    }

    /// Version string with the zero padding stripped.
    pub fn version_str(&self) -> &[u8] {
        zero_terminate(&self.version)
    }

    pub fn cluster_size(&self) -> u32 {
        self.page_size as u32 * self.pages_per_cluster as u32
    }

    /// Spare-area bytes per page on an image carrying ECC.
    pub fn spare_size(&self) -> u32 {
        self.page_size as u32 / 32
    }

    pub fn pages_per_card(&self) -> u32 {
        self.clusters_per_card * self.pages_per_cluster as u32
    }

    pub fn clusters_per_block(&self) -> u32 {
        self.pages_per_block as u32 / self.pages_per_cluster as u32
    }

    /// Number of clusters the FAT addresses.
    pub fn allocatable_clusters(&self) -> u32 {
        self.alloc_end - self.alloc_offset
    }

    /// FAT entries held by one cluster.
    pub fn fat_entries_per_cluster(&self) -> u32 {
        self.cluster_size() / 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> Superblock {
        let mut version = [0u8; 12];
        version[..FORMAT_VERSION.len()].copy_from_slice(FORMAT_VERSION);
        let mut ifc_list = [0u32; 32];
        ifc_list[0] = 2;
        Superblock {
            version,
            page_size: 512,
            pages_per_cluster: 2,
            pages_per_block: 16,
            clusters_per_card: 8192,
            alloc_offset: 35,
            alloc_end: 8176,
            rootdir_cluster: 0,
            backup_block1: 1023,
            backup_block2: 1022,
            ifc_list,
            bad_block_list: [0xFFFF_FFFF; 32],
            card_type: CARD_TYPE_PS2,
            card_flags: CARD_FLAGS,
        }
    }

    #[test]
    fn round_trips_through_raw() {
        let sb = sample();
        let raw = sb.to_raw();
        let parsed = Superblock::from_bytes(raw.as_bytes()).unwrap();
        assert_eq!(parsed, sb);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().to_raw().as_bytes().to_vec();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Superblock::from_bytes(&bytes),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn derived_geometry() {
        let sb = sample();
        assert_eq!(sb.cluster_size(), 1024);
        assert_eq!(sb.spare_size(), 16);
        assert_eq!(sb.pages_per_card(), 16384);
        assert_eq!(sb.clusters_per_block(), 8);
        assert_eq!(sb.allocatable_clusters(), 8141);
        assert_eq!(sb.version_str(), FORMAT_VERSION);
    }
}
