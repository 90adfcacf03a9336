use std::io::{Read, Seek, Write};

use crate::card::Card;
use crate::error::{Error, Result};
use crate::util::div_round_up;

pub mod constants {
    /// High bit of a FAT entry: the cluster belongs to a chain.
    pub const ALLOCATED: u32 = 0x8000_0000;
    /// Successor mask; a successor equal to the mask terminates the chain.
    pub const CHAIN_END: u32 = 0x7FFF_FFFF;
    /// Entry value of an unallocated cluster.
    pub const FREE: u32 = 0x7FFF_FFFF;
}

use constants::{ALLOCATED, CHAIN_END, FREE};

/// The cluster allocation table.
///
/// A virtual array of 32-bit entries over the allocatable clusters, stored
/// in FAT clusters that are reached through the superblock's indirect list:
/// entry `n` lives at word `n % epc` of FAT cluster `n / epc`, and the FAT
/// cluster numbers themselves are the words of the indirect table clusters.
/// The indirect tables never change after formatting, so they are read once
/// and cached here.
pub struct Fat {
    /// Absolute cluster number of each FAT table cluster.
    fat_clusters: Vec<u32>,
    /// Number of allocatable clusters the table addresses.
    entries: u32,
    entries_per_cluster: u32,
}

impl Fat {
    /// Reads the indirect tables and caches the FAT cluster list.
    pub fn load<T: Read + Write + Seek>(card: &mut Card<T>) -> Result<Self> {
        let sb = card.superblock().clone();
        let epc = sb.fat_entries_per_cluster();
        let entries = sb.allocatable_clusters();
        let fat_cluster_count = div_round_up(entries, epc);
        let ifc_count = div_round_up(fat_cluster_count, epc);

        let mut fat_clusters = Vec::with_capacity(fat_cluster_count as usize);
        'tables: for i in 0..ifc_count {
            let ifc_cluster = match sb.ifc_list.get(i as usize) {
                Some(&c) if c != 0 => c,
                _ => return Err(Error::Corrupt("indirect FAT list too short".into())),
            };
            let table = card.read_cluster(ifc_cluster)?;
            for word in table.chunks_exact(4) {
                if fat_clusters.len() as u32 == fat_cluster_count {
                    break 'tables;
                }
                let cluster = u32::from_le_bytes(word.try_into().unwrap());
                if cluster == 0 || cluster >= sb.clusters_per_card {
                    return Err(Error::Corrupt(format!(
                        "indirect FAT table points at invalid cluster {cluster:#x}"
                    )));
                }
                fat_clusters.push(cluster);
            }
        }

        Ok(Self {
            fat_clusters,
            entries,
            entries_per_cluster: epc,
        })
    }

    /// Number of allocatable clusters.
    pub fn entries(&self) -> u32 {
        self.entries
    }

    fn locate(&self, n: u32) -> Result<(u32, usize)> {
        if n >= self.entries {
            return Err(Error::Corrupt(format!("FAT index {n:#x} out of range")));
        }
        let cluster = self.fat_clusters[(n / self.entries_per_cluster) as usize];
        Ok((cluster, (n % self.entries_per_cluster) as usize * 4))
    }

    pub fn read_entry<T: Read + Write + Seek>(&self, card: &mut Card<T>, n: u32) -> Result<u32> {
        let (cluster, offset) = self.locate(n)?;
        let buf = card.read_cluster(cluster)?;
        Ok(u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()))
    }

    pub fn write_entry<T: Read + Write + Seek>(
        &self,
        card: &mut Card<T>,
        n: u32,
        value: u32,
    ) -> Result<()> {
        let (cluster, offset) = self.locate(n)?;
        let mut buf = card.read_cluster(cluster)?;
        buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        card.write_cluster(cluster, &buf)
    }

    /// Collects the cluster chain starting at `first`, rejecting chains that
    /// run through free clusters, leave the allocatable range, or cycle.
    pub fn chain<T: Read + Write + Seek>(
        &self,
        card: &mut Card<T>,
        first: u32,
    ) -> Result<Vec<u32>> {
        let mut chain = Vec::new();
        let mut cluster = first;
        loop {
            if chain.len() as u32 > self.entries {
                return Err(Error::Corrupt(format!(
                    "cluster chain starting at {first:#x} cycles"
                )));
            }
            let entry = self.read_entry(card, cluster)?;
            if entry & ALLOCATED == 0 {
                return Err(Error::Corrupt(format!(
                    "cluster chain starting at {first:#x} runs into free cluster {cluster:#x}"
                )));
            }
            chain.push(cluster);
            let next = entry & CHAIN_END;
            if next == CHAIN_END {
                return Ok(chain);
            }
            cluster = next;
        }
    }

    /// Allocates a chain of `count` clusters and returns its first cluster.
    ///
    /// Nothing is written unless enough free clusters exist, so a `NoSpace`
    /// failure leaves the table untouched. The links are written terminator
    /// first; an IO failure mid-way can only leave allocated-but-unreferenced
    /// entries behind, which `check` reports as lost clusters.
    pub fn allocate_chain<T: Read + Write + Seek>(
        &self,
        card: &mut Card<T>,
        count: u32,
    ) -> Result<u32> {
        if count == 0 {
            return Err(Error::InvalidArg("empty chain allocation".into()));
        }
        let mut found: Vec<u32> = Vec::with_capacity(count as usize);
        'scan: for (i, &fat_cluster) in self.fat_clusters.iter().enumerate() {
            let buf = card.read_cluster(fat_cluster)?;
            for (k, word) in buf.chunks_exact(4).enumerate() {
                let n = i as u32 * self.entries_per_cluster + k as u32;
                if n >= self.entries {
                    break 'scan;
                }
                let entry = u32::from_le_bytes(word.try_into().unwrap());
                if entry & ALLOCATED == 0 {
                    found.push(n);
                    if found.len() as u32 == count {
                        break 'scan;
                    }
                }
            }
        }
        if (found.len() as u32) < count {
            return Err(Error::NoSpace);
        }

        for (i, &n) in found.iter().enumerate().rev() {
            let next = found.get(i + 1).copied().unwrap_or(CHAIN_END);
            self.write_entry(card, n, ALLOCATED | next)?;
        }
        Ok(found[0])
    }

    /// Allocates `count` clusters and links them after `last`, which must be
    /// the final cluster of an existing chain.
    pub fn extend_chain<T: Read + Write + Seek>(
        &self,
        card: &mut Card<T>,
        last: u32,
        count: u32,
    ) -> Result<u32> {
        let first_new = self.allocate_chain(card, count)?;
        self.write_entry(card, last, ALLOCATED | first_new)?;
        Ok(first_new)
    }

    /// Frees an entire chain; returns the number of clusters released.
    pub fn free_chain<T: Read + Write + Seek>(
        &self,
        card: &mut Card<T>,
        first: u32,
    ) -> Result<u32> {
        let chain = self.chain(card, first)?;
        for &cluster in &chain {
            self.write_entry(card, cluster, FREE)?;
        }
        Ok(chain.len() as u32)
    }

    /// Shrinks a chain to its first cluster, freeing the rest.
    pub fn truncate_chain<T: Read + Write + Seek>(
        &self,
        card: &mut Card<T>,
        first: u32,
    ) -> Result<()> {
        let chain = self.chain(card, first)?;
        self.write_entry(card, first, ALLOCATED | CHAIN_END)?;
        for &cluster in &chain[1..] {
            self.write_entry(card, cluster, FREE)?;
        }
        Ok(())
    }

    /// Counts unallocated entries; backs the free-space report.
    pub fn count_free<T: Read + Write + Seek>(&self, card: &mut Card<T>) -> Result<u32> {
        let mut free = 0;
        'scan: for (i, &fat_cluster) in self.fat_clusters.iter().enumerate() {
            let buf = card.read_cluster(fat_cluster)?;
            for (k, word) in buf.chunks_exact(4).enumerate() {
                let n = i as u32 * self.entries_per_cluster + k as u32;
                if n >= self.entries {
                    break 'scan;
                }
                let entry = u32::from_le_bytes(word.try_into().unwrap());
                if entry & ALLOCATED == 0 {
                    free += 1;
                }
            }
        }
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatParams;
    use crate::fs::McFs;
    use std::io::Cursor;

    fn fat_and_card() -> (Fat, Card<Cursor<Vec<u8>>>) {
        let params = FormatParams::with_clusters(1024);
        let fs = McFs::format(Cursor::new(Vec::new()), &params).unwrap();
        let mut card = Card::open(fs.into_inner().unwrap(), false).unwrap();
        let fat = Fat::load(&mut card).unwrap();
        (fat, card)
    }

    #[test]
    fn fresh_card_has_only_the_root_allocated() {
        let (fat, mut card) = fat_and_card();
        assert_eq!(fat.read_entry(&mut card, 0).unwrap(), ALLOCATED | CHAIN_END);
        assert_eq!(fat.count_free(&mut card).unwrap(), fat.entries() - 1);
    }

    #[test]
    fn chains_link_and_terminate() {
        let (fat, mut card) = fat_and_card();
        let first = fat.allocate_chain(&mut card, 3).unwrap();
        let chain = fat.chain(&mut card, first).unwrap();
        assert_eq!(chain.len(), 3);
        // Every allocated entry points at the next, the last terminates.
        for w in chain.windows(2) {
            assert_eq!(fat.read_entry(&mut card, w[0]).unwrap(), ALLOCATED | w[1]);
        }
        assert_eq!(
            fat.read_entry(&mut card, chain[2]).unwrap(),
            ALLOCATED | CHAIN_END
        );
    }

    #[test]
    fn two_chains_never_share_clusters() {
        let (fat, mut card) = fat_and_card();
        let a = fat.allocate_chain(&mut card, 4).unwrap();
        let b = fat.allocate_chain(&mut card, 4).unwrap();
        let ca = fat.chain(&mut card, a).unwrap();
        let cb = fat.chain(&mut card, b).unwrap();
        assert!(ca.iter().all(|c| !cb.contains(c)));
    }

    #[test]
    fn free_then_reallocate() {
        let (fat, mut card) = fat_and_card();
        let free_before = fat.count_free(&mut card).unwrap();
        let first = fat.allocate_chain(&mut card, 5).unwrap();
        assert_eq!(fat.count_free(&mut card).unwrap(), free_before - 5);
        assert_eq!(fat.free_chain(&mut card, first).unwrap(), 5);
        assert_eq!(fat.count_free(&mut card).unwrap(), free_before);
    }

    #[test]
    fn allocation_failure_leaves_the_table_untouched() {
        let (fat, mut card) = fat_and_card();
        let free_before = fat.count_free(&mut card).unwrap();
        assert!(matches!(
            fat.allocate_chain(&mut card, free_before + 1),
            Err(Error::NoSpace)
        ));
        assert_eq!(fat.count_free(&mut card).unwrap(), free_before);
    }

    #[test]
    fn truncate_keeps_the_first_cluster() {
        let (fat, mut card) = fat_and_card();
        let first = fat.allocate_chain(&mut card, 6).unwrap();
        fat.truncate_chain(&mut card, first).unwrap();
        assert_eq!(fat.chain(&mut card, first).unwrap(), vec![first]);
    }
}
