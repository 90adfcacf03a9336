use std::io::{Read, Seek, SeekFrom, Write};

use crate::ecc::{ecc_calculate, ecc_check, EccCheck, ECC_CHUNK, ECC_SIZE};
use crate::error::{Error, Result};
use crate::structures::raw::superblock::SUPERBLOCK_SIZE;
use crate::structures::superblock::Superblock;

/// Raw page and cluster access to a memory card image.
///
/// A `Card` owns its backing file exclusively. Pages are addressed by their
/// logical number; pages that fall inside an erase block listed as bad are
/// transparently redirected to the superblock's backup block pair. When the
/// image carries ECC, reads verify and correct each 128-byte sub-chunk and
/// writes recompute the trailer.
pub struct Card<T> {
    file: T,
    sb: Superblock,
    has_ecc: bool,
    ignore_ecc: bool,
    corrected: u64,
}

impl<T: Read + Write + Seek> Card<T> {
    /// Opens an existing image, parsing and validating the superblock.
    ///
    /// ECC presence is detected from the file length: a card with ECC is
    /// `pages * (page_size + spare)` bytes, one without is
    /// `pages * page_size`.
    pub fn open(mut file: T, ignore_ecc: bool) -> Result<Self> {
        let mut head = [0u8; SUPERBLOCK_SIZE];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut head).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::Corrupt("image too small for a superblock".into())
            } else {
                Error::Io(e)
            }
        })?;
        let sb = Superblock::from_bytes(&head)?;

        let len = file.seek(SeekFrom::End(0))?;
        let pages = sb.pages_per_card() as u64;
        let has_ecc = if len == pages * (sb.page_size as u32 + sb.spare_size()) as u64 {
            true
        } else if len == pages * sb.page_size as u64 {
            false
        } else {
            return Err(Error::Corrupt(
                "image size does not match the superblock geometry".into(),
            ));
        };

        Ok(Self {
            file,
            sb,
            has_ecc,
            ignore_ecc,
            corrected: 0,
        })
    }

    /// Wraps a fresh backing file during formatting. The file is assumed to
    /// be empty; the caller erases every block before the first read.
    pub(crate) fn create(file: T, sb: Superblock, with_ecc: bool) -> Self {
        Self {
            file,
            sb,
            has_ecc: with_ecc,
            ignore_ecc: false,
            corrected: 0,
        }
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn has_ecc(&self) -> bool {
        self.has_ecc
    }

    /// Number of single-bit errors corrected since the card was opened.
    pub fn corrected(&self) -> u64 {
        self.corrected
    }

    pub fn cluster_size(&self) -> u32 {
        self.sb.cluster_size()
    }

    fn page_size(&self) -> u32 {
        self.sb.page_size as u32
    }

    /// Bytes one page occupies in the backing file.
    fn raw_page_size(&self) -> u32 {
        if self.has_ecc {
            self.page_size() + self.sb.spare_size()
        } else {
            self.page_size()
        }
    }

    fn ecc_bytes(&self) -> usize {
        (self.page_size() as usize / ECC_CHUNK) * ECC_SIZE
    }

    /// Applies the bad-block remap: a page inside a bad erase block lands at
    /// the same offset inside the matching backup block.
    fn physical_page(&self, page: u32) -> Result<u32> {
        let ppb = self.sb.pages_per_block as u32;
        let block = page / ppb;
        let bad = self
            .sb
            .bad_block_list
            .iter()
            .position(|&b| b != 0xFFFF_FFFF && b == block);
        let target = match bad {
            None => return Ok(page),
            Some(0) => self.sb.backup_block1,
            Some(1) => self.sb.backup_block2,
            Some(_) => {
                return Err(Error::Corrupt(format!(
                    "page {page:#x} lies in a bad erase block with no backup"
                )))
            }
        };
        Ok(target * ppb + page % ppb)
    }

    fn page_offset(&self, page: u32) -> Result<u64> {
        if page >= self.sb.pages_per_card() {
            return Err(Error::InvalidArg(format!("page {page:#x} out of range")));
        }
        let phys = self.physical_page(page)?;
        Ok(phys as u64 * self.raw_page_size() as u64)
    }

    /// Reads the data area of one page, verifying and correcting ECC.
    pub fn read_page(&mut self, page: u32) -> Result<Vec<u8>> {
        let offset = self.page_offset(page)?;
        let mut buf = vec![0u8; self.raw_page_size() as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        if !self.has_ecc {
            return Ok(buf);
        }

        let page_size = self.page_size() as usize;
        let ecc_bytes = self.ecc_bytes();
        // An erased page carries 0xFF across the whole spare; computed codes
        // never have their high bits set, so this cannot be a stored code.
        if buf[page_size..page_size + ecc_bytes].iter().all(|&b| b == 0xFF) {
            buf.truncate(page_size);
            return Ok(buf);
        }
        let (data, spare) = buf.split_at_mut(page_size);
        for (i, chunk) in data.chunks_exact_mut(ECC_CHUNK).enumerate() {
            let chunk: &mut [u8; ECC_CHUNK] = chunk.try_into().unwrap();
            let code: &[u8; ECC_SIZE] = spare[i * ECC_SIZE..(i + 1) * ECC_SIZE]
                .try_into()
                .unwrap();
            match ecc_check(chunk, code) {
                EccCheck::Ok => {}
                EccCheck::Corrected(_) => self.corrected += 1,
                EccCheck::Uncorrectable => {
                    if self.ignore_ecc {
                        log::warn!("ignoring uncorrectable ECC error on page {page:#x}");
                    } else {
                        return Err(Error::Ecc { page });
                    }
                }
            }
        }
        buf.truncate(self.page_size() as usize);
        Ok(buf)
    }

    /// Writes the data area of one page, recomputing the ECC trailer and
    /// preserving the bad-block marker bytes at the tail of the spare.
    pub fn write_page(&mut self, page: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size() as usize {
            return Err(Error::InvalidArg("page write must cover a full page".into()));
        }
        let offset = self.page_offset(page)?;
        if !self.has_ecc {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(data)?;
            return Ok(());
        }

        let spare_size = self.sb.spare_size() as usize;
        let ecc_bytes = self.ecc_bytes();
        let mut spare = vec![0xFFu8; spare_size];
        for (i, chunk) in data.chunks_exact(ECC_CHUNK).enumerate() {
            let chunk: &[u8; ECC_CHUNK] = chunk.try_into().unwrap();
            spare[i * ECC_SIZE..(i + 1) * ECC_SIZE].copy_from_slice(&ecc_calculate(chunk));
        }
        // Carry over the existing marker bytes so a block marked bad stays
        // marked.
        let marker_offset = offset + self.page_size() as u64 + ecc_bytes as u64;
        if self.file.seek(SeekFrom::Start(marker_offset)).is_ok() {
            let _ = self.file.read_exact(&mut spare[ecc_bytes..]);
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.file.write_all(&spare)?;
        Ok(())
    }

    /// Erases one block: 0xFF across every page, data and spare alike.
    pub fn erase_block(&mut self, block: u32) -> Result<()> {
        let ppb = self.sb.pages_per_block as u32;
        let offset = self.page_offset(block * ppb)?;
        let buf = vec![0xFFu8; (self.raw_page_size() * ppb) as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf)?;
        Ok(())
    }

    fn cluster_page(&self, cluster: u32) -> Result<u32> {
        if cluster >= self.sb.clusters_per_card {
            return Err(Error::InvalidArg(format!(
                "cluster {cluster:#x} out of range"
            )));
        }
        Ok(cluster * self.sb.pages_per_cluster as u32)
    }

    /// Reads one cluster (absolute cluster number).
    pub fn read_cluster(&mut self, cluster: u32) -> Result<Vec<u8>> {
        let first = self.cluster_page(cluster)?;
        let mut buf = Vec::with_capacity(self.cluster_size() as usize);
        for i in 0..self.sb.pages_per_cluster as u32 {
            buf.extend_from_slice(&self.read_page(first + i)?);
        }
        Ok(buf)
    }

    /// Writes one cluster (absolute cluster number).
    pub fn write_cluster(&mut self, cluster: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.cluster_size() as usize {
            return Err(Error::InvalidArg(
                "cluster write must cover a full cluster".into(),
            ));
        }
        let first = self.cluster_page(cluster)?;
        let page_size = self.page_size() as usize;
        for (i, page) in data.chunks_exact(page_size).enumerate() {
            self.write_page(first + i as u32, page)?;
        }
        Ok(())
    }

    /// Rewrites the superblock from in-memory state into cluster 0 and its
    /// backup copy in cluster 1, preserving the rest of both clusters.
    pub fn write_superblock(&mut self) -> Result<()> {
        let raw = self.sb.to_raw();
        for cluster in [0, 1] {
            let mut buf = self.read_cluster(cluster)?;
            buf[..SUPERBLOCK_SIZE].copy_from_slice(raw.as_bytes());
            self.write_cluster(cluster, &buf)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    /// Flushes and returns the backing file.
    pub fn into_inner(mut self) -> Result<T> {
        self.file.flush()?;
        Ok(self.file)
    }
}
