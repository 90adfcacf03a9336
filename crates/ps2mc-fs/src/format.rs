//! Creation of well-formed empty images.

use std::io::{Read, Seek, Write};

use crate::card::Card;
use crate::error::{Error, Result};
use crate::fs::McFs;
use crate::structures::dirent::{DirEntry, Tod, DEFAULT_DIR_MODE, DIRENT_SIZE};
use crate::structures::fat::constants::{ALLOCATED, CHAIN_END, FREE};
use crate::structures::fat::Fat;
use crate::structures::superblock::{Superblock, CARD_FLAGS, CARD_TYPE_PS2, FORMAT_VERSION};
use crate::util::{div_round_up, round_down};

/// Filesystem cluster size; every supported card uses 1 KiB clusters.
pub const CLUSTER_SIZE: u32 = 1024;

/// Standard geometry of a retail 8 MB card.
pub const STANDARD_PAGE_SIZE: u16 = 512;
pub const STANDARD_PAGES_PER_BLOCK: u16 = 16;
pub const STANDARD_PAGES_PER_CARD: u32 = 16384;

/// Parameters for [`McFs::format`].
#[derive(Debug, Clone)]
pub struct FormatParams {
    /// Write ECC trailers (a real card always has them).
    pub with_ecc: bool,
    pub page_size: u16,
    pub pages_per_block: u16,
    pub pages_per_card: u32,
}

impl Default for FormatParams {
    fn default() -> Self {
        Self {
            with_ecc: true,
            page_size: STANDARD_PAGE_SIZE,
            pages_per_block: STANDARD_PAGES_PER_BLOCK,
            pages_per_card: STANDARD_PAGES_PER_CARD,
        }
    }
}

impl FormatParams {
    /// Standard geometry scaled to a card of `clusters` clusters.
    pub fn with_clusters(clusters: u32) -> Self {
        let pages_per_cluster = CLUSTER_SIZE / STANDARD_PAGE_SIZE as u32;
        Self {
            pages_per_card: clusters * pages_per_cluster,
            ..Self::default()
        }
    }
}

impl<T: Read + Write + Seek> McFs<T> {
    /// Synthesizes a fresh, empty image on `file`.
    ///
    /// The card is erased to 0xFF, the superblock is written to cluster 0
    /// and its backup copy to cluster 1, the indirect tables and the FAT are
    /// initialized free, the last two erase blocks are reserved as the
    /// backup block pair, and a root directory is allocated at relative
    /// cluster 0.
    pub fn format(file: T, params: &FormatParams) -> Result<Self> {
        let sb = layout(params)?;
        let blocks = sb.pages_per_card() / sb.pages_per_block as u32;
        let mut card = Card::create(file, sb.clone(), params.with_ecc);

        for block in 0..blocks {
            card.erase_block(block)?;
        }

        // Indirect tables: a list of the FAT table clusters.
        let epc = sb.fat_entries_per_cluster();
        let fat_cluster_count = div_round_up(sb.clusters_per_card, epc);
        let ifc_count = div_round_up(fat_cluster_count, epc);
        let first_fat_cluster = 2 + ifc_count;
        for i in 0..ifc_count {
            let mut buf = vec![0u8; CLUSTER_SIZE as usize];
            for k in 0..epc {
                let index = i * epc + k;
                if index >= fat_cluster_count {
                    break;
                }
                let fat_cluster = first_fat_cluster + index;
                buf[k as usize * 4..k as usize * 4 + 4]
                    .copy_from_slice(&fat_cluster.to_le_bytes());
            }
            card.write_cluster(2 + i, &buf)?;
        }

        // FAT tables: allocatable entries free, everything past the
        // allocatable range pre-allocated so it is never handed out.
        let allocatable = sb.allocatable_clusters();
        for i in 0..fat_cluster_count {
            let mut buf = vec![0u8; CLUSTER_SIZE as usize];
            for k in 0..epc {
                let index = i * epc + k;
                let value = if index < allocatable {
                    FREE
                } else {
                    ALLOCATED | CHAIN_END
                };
                buf[k as usize * 4..k as usize * 4 + 4].copy_from_slice(&value.to_le_bytes());
            }
            card.write_cluster(first_fat_cluster + i, &buf)?;
        }

        // Root directory: one cluster, "." and ".." both stamped now.
        let now = Tod::now();
        let mut dot = DirEntry::new(b".", DEFAULT_DIR_MODE)?;
        dot.length = 2;
        dot.cluster = sb.rootdir_cluster;
        dot.created = now;
        dot.modified = now;
        let mut dotdot = DirEntry::new(b"..", DEFAULT_DIR_MODE)?;
        dotdot.cluster = sb.rootdir_cluster;
        dotdot.created = now;
        dotdot.modified = now;
        let mut buf = vec![0u8; CLUSTER_SIZE as usize];
        buf[..DIRENT_SIZE].copy_from_slice(dot.to_raw().as_bytes());
        buf[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(dotdot.to_raw().as_bytes());
        card.write_cluster(sb.alloc_offset + sb.rootdir_cluster, &buf)?;

        card.write_superblock()?;

        // Claim the root's cluster in the freshly initialized FAT.
        let fat = Fat::load(&mut card)?;
        fat.write_entry(&mut card, sb.rootdir_cluster, ALLOCATED | CHAIN_END)?;

        McFs::from_card(card)
    }
}

/// Computes the layout for the requested geometry.
fn layout(params: &FormatParams) -> Result<Superblock> {
    let invalid = |msg: &str| Err(Error::InvalidArg(msg.into()));
    let page_size = params.page_size as u32;
    if page_size < 128 || page_size % 128 != 0 || CLUSTER_SIZE % page_size != 0 {
        return invalid("unsupported page size");
    }
    let pages_per_cluster = CLUSTER_SIZE / page_size;
    if params.pages_per_block == 0 || params.pages_per_block as u32 % pages_per_cluster != 0 {
        return invalid("pages per erase block must be a multiple of pages per cluster");
    }
    let pages_per_card = round_down(params.pages_per_card, params.pages_per_block as u32);
    let clusters_per_card = pages_per_card / pages_per_cluster;
    let clusters_per_block = params.pages_per_block as u32 / pages_per_cluster;
    let blocks = pages_per_card / params.pages_per_block as u32;

    let epc = CLUSTER_SIZE / 4;
    let fat_cluster_count = div_round_up(clusters_per_card, epc);
    let ifc_count = div_round_up(fat_cluster_count, epc);
    if ifc_count as usize > 32 {
        return invalid("card too large for the indirect FAT list");
    }

    // Clusters 0 and 1 hold the superblock and its backup, then the
    // indirect tables, then the FAT; the last two erase blocks are the
    // backup block pair.
    let alloc_offset = 2 + ifc_count + fat_cluster_count;
    let alloc_end = clusters_per_card.saturating_sub(2 * clusters_per_block);
    if blocks < 3 || alloc_end <= alloc_offset {
        return invalid("card too small");
    }

    let mut version = [0u8; 12];
    version[..FORMAT_VERSION.len()].copy_from_slice(FORMAT_VERSION);
    let mut ifc_list = [0u32; 32];
    for (i, slot) in ifc_list.iter_mut().take(ifc_count as usize).enumerate() {
        *slot = 2 + i as u32;
    }

    Ok(Superblock {
        version,
        page_size: params.page_size,
        pages_per_cluster: pages_per_cluster as u16,
        pages_per_block: params.pages_per_block,
        clusters_per_card,
        alloc_offset,
        alloc_end,
        rootdir_cluster: 0,
        backup_block1: blocks - 1,
        backup_block2: blocks - 2,
        ifc_list,
        bad_block_list: [0xFFFF_FFFF; 32],
        card_type: CARD_TYPE_PS2,
        card_flags: CARD_FLAGS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn standard_layout() {
        let sb = layout(&FormatParams::default()).unwrap();
        assert_eq!(sb.clusters_per_card, 8192);
        assert_eq!(sb.alloc_offset, 35);
        assert_eq!(sb.alloc_end, 8176);
        assert_eq!(sb.backup_block1, 1023);
        assert_eq!(sb.backup_block2, 1022);
        assert_eq!(sb.ifc_list[0], 2);
        assert_eq!(sb.ifc_list[1], 0);
    }

    #[test]
    fn tiny_cards_are_rejected() {
        let params = FormatParams {
            pages_per_card: 32,
            ..FormatParams::default()
        };
        assert!(matches!(
            McFs::format(std::io::Cursor::new(Vec::new()), &params),
            Err(Error::InvalidArg(_))
        ));
    }
}
