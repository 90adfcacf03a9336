use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::fs::{DirLoc, McFs};
use crate::structures::dirent::Tod;
use crate::util::div_round_up;

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing file, read only.
    Read,
    /// Create or truncate, write only.
    Write,
    /// Create or open, positioned at the end.
    Append,
    /// Existing file, read and write.
    ReadWrite,
}

impl OpenMode {
    pub(crate) fn writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    pub(crate) fn creates(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::Append)
    }
}

/// An open file on a memory card.
///
/// A handle does not borrow the filesystem; every operation takes the owning
/// [`McFs`] explicitly. The handle remembers the directory entry it belongs
/// to (parent cluster plus slot index) and flushes the entry's size and
/// modification time on [`close`](Self::close). Operations on a closed
/// handle fail with [`Error::BadHandle`].
#[derive(Debug)]
pub struct McFile {
    loc: DirLoc,
    /// Cluster chain of the file, relative cluster numbers.
    chain: Vec<u32>,
    length: u32,
    pos: u32,
    mode: OpenMode,
    dirty: bool,
    closed: bool,
}

impl McFile {
    pub(crate) fn new(loc: DirLoc, chain: Vec<u32>, length: u32, mode: OpenMode) -> Self {
        let pos = match mode {
            OpenMode::Append => length,
            _ => 0,
        };
        Self {
            loc,
            chain,
            length,
            pos,
            mode,
            dirty: false,
            closed: false,
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::BadHandle);
        }
        Ok(())
    }

    /// Current position.
    pub fn position(&self) -> u32 {
        self.pos
    }

    /// Current file length in bytes.
    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Reads up to `buf.len()` bytes; at end of file this returns 0.
    pub fn read<T: Read + Write + Seek>(
        &mut self,
        fs: &mut McFs<T>,
        buf: &mut [u8],
    ) -> Result<usize> {
        self.check_open()?;
        if self.pos >= self.length {
            return Ok(0);
        }
        let cs = fs.cluster_size();
        let want = buf.len().min((self.length - self.pos) as usize);
        let mut done = 0;
        while done < want {
            let idx = (self.pos / cs) as usize;
            let within = (self.pos % cs) as usize;
            let take = want - done;
            let take = take.min(cs as usize - within);
            let cluster = *self.chain.get(idx).ok_or_else(|| {
                Error::Corrupt("cluster chain shorter than the file length".into())
            })?;
            let data = fs.read_rel_cluster(cluster)?;
            buf[done..done + take].copy_from_slice(&data[within..within + take]);
            done += take;
            self.pos += take as u32;
        }
        Ok(done)
    }

    /// Reads from the current position to the end of the file.
    pub fn read_to_end<T: Read + Write + Seek>(&mut self, fs: &mut McFs<T>) -> Result<Vec<u8>> {
        self.check_open()?;
        let mut buf = vec![0u8; self.length.saturating_sub(self.pos) as usize];
        let n = self.read(fs, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Writes the whole buffer at the current position, extending the
    /// cluster chain as needed.
    ///
    /// A failed allocation leaves the chain and the directory entry exactly
    /// as they were. A position past the end of file (from
    /// [`seek`](Self::seek)) zero-fills the gap first.
    pub fn write<T: Read + Write + Seek>(&mut self, fs: &mut McFs<T>, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        if !self.mode.writable() {
            return Err(Error::InvalidArg("file is not open for writing".into()));
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = self
            .pos
            .checked_add(data.len() as u32)
            .ok_or_else(|| Error::InvalidArg("write would exceed the maximum file size".into()))?;
        self.ensure_capacity(fs, end)?;
        if self.pos > self.length {
            let (from, to) = (self.length, self.pos);
            self.overwrite(fs, from, &vec![0u8; (to - from) as usize])?;
        }
        self.overwrite(fs, self.pos, data)?;
        self.pos = end;
        self.length = self.length.max(end);
        self.dirty = true;
        Ok(data.len())
    }

    /// Extends the chain so it covers `end` bytes; fresh clusters are
    /// zeroed before they become reachable.
    fn ensure_capacity<T: Read + Write + Seek>(&mut self, fs: &mut McFs<T>, end: u32) -> Result<()> {
        let cs = fs.cluster_size();
        let needed = div_round_up(end.max(1), cs) as usize;
        if needed <= self.chain.len() {
            return Ok(());
        }
        let extra = (needed - self.chain.len()) as u32;
        let last = *self.chain.last().expect("open files always own a cluster");
        let first_new = fs.extend_chain(last, extra)?;
        let fresh = fs.chain_of(first_new)?;
        let zeros = vec![0u8; cs as usize];
        for &cluster in &fresh {
            fs.write_rel_cluster(cluster, &zeros)?;
        }
        self.chain.extend(fresh);
        Ok(())
    }

    /// Read-modify-writes `data` over the byte range starting at `at`; the
    /// chain must already cover it.
    fn overwrite<T: Read + Write + Seek>(
        &mut self,
        fs: &mut McFs<T>,
        at: u32,
        data: &[u8],
    ) -> Result<()> {
        let cs = fs.cluster_size();
        let mut pos = at;
        let mut done = 0;
        while done < data.len() {
            let idx = (pos / cs) as usize;
            let within = (pos % cs) as usize;
            let take = (data.len() - done).min(cs as usize - within);
            let cluster = self.chain[idx];
            if take == cs as usize {
                fs.write_rel_cluster(cluster, &data[done..done + take])?;
            } else {
                let mut buf = fs.read_rel_cluster(cluster)?;
                buf[within..within + take].copy_from_slice(&data[done..done + take]);
                fs.write_rel_cluster(cluster, &buf)?;
            }
            done += take;
            pos += take as u32;
        }
        Ok(())
    }

    /// Repositions the handle. Seeking past the end is permitted; the gap
    /// reads as empty and is zero-filled by the next write.
    pub fn seek(&mut self, from: SeekFrom) -> Result<u32> {
        self.check_open()?;
        let target = match from {
            SeekFrom::Start(n) => i64::try_from(n).unwrap_or(i64::MAX),
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.length as i64 + d,
        };
        if target < 0 || target > u32::MAX as i64 {
            return Err(Error::InvalidArg("seek out of range".into()));
        }
        self.pos = target as u32;
        Ok(self.pos)
    }

    /// Flushes the directory entry's size and modification time if the file
    /// was written to, and invalidates the handle.
    pub fn close<T: Read + Write + Seek>(&mut self, fs: &mut McFs<T>) -> Result<()> {
        self.check_open()?;
        if self.dirty {
            let mut ent = fs.read_dirent_at(self.loc.dir, self.loc.index)?;
            ent.length = self.length;
            ent.modified = Tod::now();
            fs.write_dirent_at(self.loc.dir, self.loc.index, &ent)?;
        }
        self.closed = true;
        Ok(())
    }
}
