//! The memory card filesystem.
//!
//! Paths are raw bytes with `/` separators; a leading `/` anchors at the
//! root, `.` and `..` mean the current and parent directory, and a trailing
//! `/` is permitted on directories. Every [`McFs`] instance keeps its own
//! current working directory.
//!
//! Directory bookkeeping follows the on-card convention: entry 0 of a
//! directory is ".", entry 1 is "..". The "." entry points back at the
//! directory's own slot in its parent (the ascend pointer used to resolve
//! `..`), and that slot — the root's own "." for the root — holds the
//! authoritative entry count. Slot counts only ever grow; removal clears the
//! EXISTS bit and leaves a tombstone that later creations may reuse.

pub mod file;

use std::io::{Read, Seek, Write};

use crate::card::Card;
use crate::error::{Error, Result};
use crate::structures::dirent::{
    DirEntry, DirMode, Tod, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, DIRENT_SIZE,
};
use crate::structures::fat::constants::{ALLOCATED, CHAIN_END};
use crate::structures::fat::Fat;
use crate::structures::superblock::Superblock;
use crate::util::{div_round_up, round_up};
use file::{McFile, OpenMode};

/// Location of a directory entry: first cluster of the directory holding it
/// plus the slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DirLoc {
    pub dir: u32,
    pub index: u32,
}

/// A resolved directory: its first cluster and the location of its
/// authoritative entry.
#[derive(Debug, Clone, Copy)]
struct DirRef {
    first: u32,
    loc: DirLoc,
}

/// Result of resolving a path to its parent directory and final component.
struct Lookup {
    parent: DirRef,
    name: Vec<u8>,
    found: Option<(u32, DirEntry)>,
}

/// A filesystem over a memory card image.
///
/// The `McFs` exclusively owns the backing file for as long as it lives;
/// file handles obtained from [`open_file`](Self::open_file) refer back to
/// it on every operation. All operations are synchronous and the type is not
/// meant to be shared across threads.
pub struct McFs<T: Read + Write + Seek> {
    card: Card<T>,
    fat: Fat,
    cwd: Vec<Vec<u8>>,
}

impl<T: Read + Write + Seek> McFs<T> {
    /// Opens an existing image.
    ///
    /// With `ignore_ecc`, uncorrectable ECC failures are logged and the raw
    /// page data is used instead of failing the read.
    pub fn open(file: T, ignore_ecc: bool) -> Result<Self> {
        let mut card = Card::open(file, ignore_ecc)?;
        let fat = Fat::load(&mut card)?;
        Ok(Self {
            card,
            fat,
            cwd: Vec::new(),
        })
    }

    pub(crate) fn from_card(mut card: Card<T>) -> Result<Self> {
        let fat = Fat::load(&mut card)?;
        Ok(Self {
            card,
            fat,
            cwd: Vec::new(),
        })
    }

    pub fn superblock(&self) -> &Superblock {
        self.card.superblock()
    }

    /// Number of single-bit ECC corrections applied since open.
    pub fn ecc_corrected(&self) -> u64 {
        self.card.corrected()
    }

    pub fn cluster_size(&self) -> u32 {
        self.card.cluster_size()
    }

    /// Rewrites the superblock (and its backup copy) from in-memory state.
    pub fn write_superblock(&mut self) -> Result<()> {
        self.card.write_superblock()
    }

    /// Flushes the backing file and consumes the filesystem, invalidating
    /// every outstanding handle.
    pub fn close(mut self) -> Result<()> {
        self.card.flush()
    }

    /// Flushes and returns the backing file.
    pub fn into_inner(self) -> Result<T> {
        self.card.into_inner()
    }

    /// Raw page read, exposed for diagnostics (the `ecc-check` scan).
    pub fn read_page(&mut self, page: u32) -> Result<Vec<u8>> {
        self.card.read_page(page)
    }

    pub fn pages_per_card(&self) -> u32 {
        self.superblock().pages_per_card()
    }

    // ---- cluster and dirent primitives ----------------------------------

    fn abs(&self, rel: u32) -> u32 {
        self.superblock().alloc_offset + rel
    }

    pub(crate) fn read_rel_cluster(&mut self, rel: u32) -> Result<Vec<u8>> {
        let abs = self.abs(rel);
        self.card.read_cluster(abs)
    }

    pub(crate) fn write_rel_cluster(&mut self, rel: u32, data: &[u8]) -> Result<()> {
        let abs = self.abs(rel);
        self.card.write_cluster(abs, data)
    }

    pub(crate) fn extend_chain(&mut self, last: u32, count: u32) -> Result<u32> {
        self.fat.extend_chain(&mut self.card, last, count)
    }

    pub(crate) fn chain_of(&mut self, first: u32) -> Result<Vec<u32>> {
        self.fat.chain(&mut self.card, first)
    }

    fn chain_next(&mut self, cluster: u32) -> Result<Option<u32>> {
        let entry = self.fat.read_entry(&mut self.card, cluster)?;
        if entry & ALLOCATED == 0 {
            return Err(Error::Corrupt(format!(
                "directory chain runs into free cluster {cluster:#x}"
            )));
        }
        let next = entry & CHAIN_END;
        Ok(if next == CHAIN_END { None } else { Some(next) })
    }

    fn entries_per_cluster(&self) -> u32 {
        self.cluster_size() / DIRENT_SIZE as u32
    }

    fn dirent_location(&mut self, dir_first: u32, index: u32) -> Result<(u32, usize)> {
        let per = self.entries_per_cluster();
        let mut cluster = dir_first;
        for _ in 0..index / per {
            cluster = self.chain_next(cluster)?.ok_or_else(|| {
                Error::Corrupt("directory chain shorter than its entry count".into())
            })?;
        }
        Ok((cluster, (index % per) as usize * DIRENT_SIZE))
    }

    pub(crate) fn read_dirent_at(&mut self, dir_first: u32, index: u32) -> Result<DirEntry> {
        let (cluster, offset) = self.dirent_location(dir_first, index)?;
        let buf = self.read_rel_cluster(cluster)?;
        Ok(DirEntry::from_bytes(
            buf[offset..offset + DIRENT_SIZE].try_into().unwrap(),
        ))
    }

    pub(crate) fn write_dirent_at(
        &mut self,
        dir_first: u32,
        index: u32,
        ent: &DirEntry,
    ) -> Result<()> {
        let (cluster, offset) = self.dirent_location(dir_first, index)?;
        let mut buf = self.read_rel_cluster(cluster)?;
        buf[offset..offset + DIRENT_SIZE].copy_from_slice(ent.to_raw().as_bytes());
        self.write_rel_cluster(cluster, &buf)
    }

    // ---- path resolution -------------------------------------------------

    fn root(&self) -> DirRef {
        let first = self.superblock().rootdir_cluster;
        DirRef {
            first,
            loc: DirLoc {
                dir: first,
                index: 0,
            },
        }
    }

    fn dir_ref(&mut self, first: u32) -> Result<DirRef> {
        let dot = self.read_dirent_at(first, 0)?;
        Ok(DirRef {
            first,
            loc: DirLoc {
                dir: dot.cluster,
                index: dot.dir_entry,
            },
        })
    }

    fn ascend(&mut self, cur: &DirRef) -> Result<DirRef> {
        let dot = self.read_dirent_at(cur.first, 0)?;
        self.dir_ref(dot.cluster)
    }

    fn components(path: &[u8]) -> (bool, Vec<&[u8]>) {
        let absolute = path.starts_with(b"/");
        let comps = path
            .split(|&b| b == b'/')
            .filter(|c| !c.is_empty())
            .collect();
        (absolute, comps)
    }

    fn dir_len(&mut self, dir: &DirRef) -> Result<u32> {
        Ok(self.read_dirent_at(dir.loc.dir, dir.loc.index)?.length)
    }

    /// Scans a directory for a live entry with the given name.
    fn find_entry(&mut self, dir: &DirRef, name: &[u8]) -> Result<Option<(u32, DirEntry)>> {
        let len = self.dir_len(dir)?;
        let per = self.entries_per_cluster();
        let mut cluster = dir.first;
        let mut index = 0u32;
        while index < len {
            let buf = self.read_rel_cluster(cluster)?;
            for slot in 0..per {
                if index >= len {
                    break;
                }
                let offset = slot as usize * DIRENT_SIZE;
                let ent =
                    DirEntry::from_bytes(buf[offset..offset + DIRENT_SIZE].try_into().unwrap());
                if ent.mode.is_live() && ent.name() == name {
                    return Ok(Some((index, ent)));
                }
                index += 1;
            }
            if index < len {
                cluster = self.chain_next(cluster)?.ok_or_else(|| {
                    Error::Corrupt("directory chain shorter than its entry count".into())
                })?;
            }
        }
        Ok(None)
    }

    fn walk_dir(&mut self, mut cur: DirRef, comps: &[&[u8]]) -> Result<DirRef> {
        for &comp in comps {
            match comp {
                b"." => {}
                b".." => cur = self.ascend(&cur)?,
                name => {
                    let (index, ent) = self
                        .find_entry(&cur, name)?
                        .ok_or_else(|| Error::not_found(name))?;
                    if !ent.mode.is_dir() {
                        return Err(Error::not_directory(name));
                    }
                    cur = DirRef {
                        first: ent.cluster,
                        loc: DirLoc {
                            dir: cur.first,
                            index,
                        },
                    };
                }
            }
        }
        Ok(cur)
    }

    fn cwd_ref(&mut self) -> Result<DirRef> {
        let cwd = self.cwd.clone();
        let comps: Vec<&[u8]> = cwd.iter().map(|c| c.as_slice()).collect();
        let root = self.root();
        self.walk_dir(root, &comps)
    }

    fn start_of(&mut self, absolute: bool) -> Result<DirRef> {
        if absolute {
            Ok(self.root())
        } else {
            self.cwd_ref()
        }
    }

    fn resolve_dir(&mut self, path: &[u8]) -> Result<DirRef> {
        let (absolute, comps) = Self::components(path);
        let start = self.start_of(absolute)?;
        self.walk_dir(start, &comps)
    }

    /// The directory's own authoritative entry, presented as a lookup.
    fn lookup_self(&mut self, dir: DirRef) -> Result<Lookup> {
        let ent = self.read_dirent_at(dir.loc.dir, dir.loc.index)?;
        let parent = self.dir_ref(dir.loc.dir)?;
        Ok(Lookup {
            parent,
            name: ent.name().to_vec(),
            found: Some((dir.loc.index, ent)),
        })
    }

    fn lookup(&mut self, path: &[u8]) -> Result<Lookup> {
        let (absolute, comps) = Self::components(path);
        let start = self.start_of(absolute)?;
        let Some((&last, init)) = comps.split_last() else {
            return self.lookup_self(start);
        };
        let cur = self.walk_dir(start, init)?;
        match last {
            b"." => self.lookup_self(cur),
            b".." => {
                let parent = self.ascend(&cur)?;
                self.lookup_self(parent)
            }
            name => {
                let found = self.find_entry(&cur, name)?;
                Ok(Lookup {
                    parent: cur,
                    name: name.to_vec(),
                    found,
                })
            }
        }
    }

    /// Re-tags name-carrying errors with the path the caller actually gave.
    fn with_path<R>(path: &[u8], r: Result<R>) -> Result<R> {
        r.map_err(|e| match e {
            Error::NotFound { .. } => Error::not_found(path),
            Error::Exists { .. } => Error::exists(path),
            Error::NotEmpty { .. } => Error::not_empty(path),
            Error::IsDirectory { .. } => Error::is_directory(path),
            Error::NotDirectory { .. } => Error::not_directory(path),
            other => other,
        })
    }

    // ---- slot management -------------------------------------------------

    /// Finds a slot for a new entry: the first tombstone, or one past the
    /// end. The returned flag says whether the slot count must grow.
    fn find_free_slot(&mut self, parent: &DirRef) -> Result<(u32, bool)> {
        let len = self.dir_len(parent)?;
        for index in 2..len {
            if !self.read_dirent_at(parent.first, index)?.mode.is_live() {
                return Ok((index, false));
            }
        }
        Ok((len, true))
    }

    /// Grows the directory chain when `slot` would land past its last
    /// cluster. Called before any other allocation so a full card fails
    /// without leaking clusters.
    fn reserve_slot(&mut self, parent: &DirRef, slot: u32) -> Result<()> {
        let per = self.entries_per_cluster();
        let chain = self.chain_of(parent.first)?;
        if slot as usize >= chain.len() * per as usize {
            let last = *chain.last().expect("directory chains are never empty");
            let fresh = self.extend_chain(last, 1)?;
            let zeros = vec![0u8; self.cluster_size() as usize];
            self.write_rel_cluster(fresh, &zeros)?;
        }
        Ok(())
    }

    /// Writes `ent` into `slot` of the parent, bumping the authoritative
    /// slot count when appending. The slot count update comes last.
    fn store_entry(
        &mut self,
        parent: &DirRef,
        slot: u32,
        append: bool,
        ent: &DirEntry,
    ) -> Result<()> {
        self.write_dirent_at(parent.first, slot, ent)?;
        if append {
            let mut auth = self.read_dirent_at(parent.loc.dir, parent.loc.index)?;
            auth.length = slot + 1;
            self.write_dirent_at(parent.loc.dir, parent.loc.index, &auth)?;
        }
        Ok(())
    }

    // ---- public operations ----------------------------------------------

    /// Opens a file, creating it for the writing modes.
    ///
    /// Opening an existing file with [`OpenMode::Write`] truncates it to
    /// zero bytes and shrinks its chain to a single cluster.
    pub fn open_file(&mut self, path: &[u8], mode: OpenMode) -> Result<McFile> {
        Self::with_path(path, self.open_file_inner(path, mode))
    }

    fn open_file_inner(&mut self, path: &[u8], mode: OpenMode) -> Result<McFile> {
        let lk = self.lookup(path)?;
        match lk.found {
            Some((index, mut ent)) => {
                if ent.mode.is_dir() {
                    return Err(Error::is_directory(path));
                }
                let loc = DirLoc {
                    dir: lk.parent.first,
                    index,
                };
                let chain = if mode == OpenMode::Write {
                    self.fat.truncate_chain(&mut self.card, ent.cluster)?;
                    ent.length = 0;
                    ent.modified = Tod::now();
                    self.write_dirent_at(loc.dir, loc.index, &ent)?;
                    vec![ent.cluster]
                } else {
                    self.chain_of(ent.cluster)?
                };
                Ok(McFile::new(loc, chain, ent.length, mode))
            }
            None => {
                if !mode.creates() {
                    return Err(Error::not_found(path));
                }
                let (slot, append) = self.find_free_slot(&lk.parent)?;
                if append {
                    self.reserve_slot(&lk.parent, slot)?;
                }
                let first = self.fat.allocate_chain(&mut self.card, 1)?;
                let zeros = vec![0u8; self.cluster_size() as usize];
                self.write_rel_cluster(first, &zeros)?;
                let mut ent = DirEntry::new(&lk.name, DEFAULT_FILE_MODE)?;
                ent.cluster = first;
                self.store_entry(&lk.parent, slot, append, &ent)?;
                let loc = DirLoc {
                    dir: lk.parent.first,
                    index: slot,
                };
                Ok(McFile::new(loc, vec![first], 0, mode))
            }
        }
    }

    /// Creates a directory.
    pub fn mkdir(&mut self, path: &[u8]) -> Result<()> {
        Self::with_path(path, self.mkdir_inner(path))
    }

    fn mkdir_inner(&mut self, path: &[u8]) -> Result<()> {
        let lk = self.lookup(path)?;
        if lk.found.is_some() {
            return Err(Error::exists(path));
        }
        let (slot, append) = self.find_free_slot(&lk.parent)?;
        if append {
            self.reserve_slot(&lk.parent, slot)?;
        }
        let first = self.fat.allocate_chain(&mut self.card, 1)?;

        let now = Tod::now();
        let mut dot = DirEntry::new(b".", DEFAULT_DIR_MODE)?;
        dot.length = 2;
        dot.cluster = lk.parent.first;
        dot.dir_entry = slot;
        dot.created = now;
        dot.modified = now;
        let mut dotdot = DirEntry::new(b"..", DEFAULT_DIR_MODE)?;
        dotdot.cluster = first;
        dotdot.created = now;
        dotdot.modified = now;

        let mut buf = vec![0u8; self.cluster_size() as usize];
        buf[..DIRENT_SIZE].copy_from_slice(dot.to_raw().as_bytes());
        buf[DIRENT_SIZE..2 * DIRENT_SIZE].copy_from_slice(dotdot.to_raw().as_bytes());
        self.write_rel_cluster(first, &buf)?;

        let mut ent = DirEntry::new(&lk.name, DEFAULT_DIR_MODE)?;
        ent.length = 2;
        ent.cluster = first;
        ent.created = now;
        ent.modified = now;
        self.store_entry(&lk.parent, slot, append, &ent)
    }

    /// Removes a file or an empty directory: the cluster chain is freed and
    /// the entry becomes a tombstone. Slot counts never shrink.
    pub fn remove(&mut self, path: &[u8]) -> Result<()> {
        Self::with_path(path, self.remove_inner(path))
    }

    fn remove_inner(&mut self, path: &[u8]) -> Result<()> {
        let lk = self.lookup(path)?;
        let (index, ent) = lk.found.ok_or_else(|| Error::not_found(path))?;
        if ent.is_dot() {
            return Err(Error::InvalidArg(
                "cannot remove a directory through . or ..".into(),
            ));
        }
        if ent.mode.is_dir() {
            let child = DirRef {
                first: ent.cluster,
                loc: DirLoc {
                    dir: lk.parent.first,
                    index,
                },
            };
            let len = self.dir_len(&child)?;
            for i in 2..len {
                if self.read_dirent_at(child.first, i)?.mode.is_live() {
                    return Err(Error::not_empty(path));
                }
            }
        }
        self.erase_entry(lk.parent.first, index, &ent)
    }

    /// Tombstones the entry first, then frees its chain; a failure in
    /// between leaves lost clusters for `check` to report rather than a live
    /// entry pointing at free space.
    fn erase_entry(&mut self, dir_first: u32, index: u32, ent: &DirEntry) -> Result<()> {
        let mut dead = ent.clone();
        dead.mode.remove(DirMode::EXISTS);
        self.write_dirent_at(dir_first, index, &dead)?;
        self.fat.free_chain(&mut self.card, ent.cluster)?;
        Ok(())
    }

    /// Recursively removes a directory and everything below it.
    pub fn rmdir_recursive(&mut self, path: &[u8]) -> Result<()> {
        Self::with_path(path, self.rmdir_recursive_inner(path))
    }

    fn rmdir_recursive_inner(&mut self, path: &[u8]) -> Result<()> {
        let lk = self.lookup(path)?;
        let (index, ent) = lk.found.ok_or_else(|| Error::not_found(path))?;
        if ent.is_dot() {
            return Err(Error::InvalidArg(
                "cannot remove a directory through . or ..".into(),
            ));
        }
        if !ent.mode.is_dir() {
            return Err(Error::not_directory(path));
        }
        self.remove_tree(ent.cluster, ent.length)?;
        self.erase_entry(lk.parent.first, index, &ent)
    }

    /// `len` is the authoritative slot count from the directory's entry in
    /// its parent; the "." copy is not kept up to date.
    fn remove_tree(&mut self, dir_first: u32, len: u32) -> Result<()> {
        for i in 2..len {
            let ent = self.read_dirent_at(dir_first, i)?;
            if !ent.mode.is_live() {
                continue;
            }
            if ent.mode.is_dir() {
                self.remove_tree(ent.cluster, ent.length)?;
            }
            self.erase_entry(dir_first, i, &ent)?;
        }
        Ok(())
    }

    /// Renames an entry within its directory. Moving between directories is
    /// not supported.
    pub fn rename(&mut self, old: &[u8], new: &[u8]) -> Result<()> {
        let lk_old = Self::with_path(old, self.lookup(old))?;
        let (index, mut ent) = lk_old.found.ok_or_else(|| Error::not_found(old))?;
        if ent.is_dot() {
            return Err(Error::InvalidArg("cannot rename . or ..".into()));
        }
        let lk_new = Self::with_path(new, self.lookup(new))?;
        if lk_new.parent.first != lk_old.parent.first {
            return Err(Error::InvalidArg(
                "renaming across directories is not supported".into(),
            ));
        }
        if lk_new.found.is_some() {
            return Err(Error::exists(new));
        }
        ent.set_name(&lk_new.name)?;
        self.write_dirent_at(lk_old.parent.first, index, &ent)
    }

    /// Changes the working directory of this filesystem instance.
    pub fn chdir(&mut self, path: &[u8]) -> Result<()> {
        Self::with_path(path, self.resolve_dir(path)).map(|_| ())?;
        let (absolute, comps) = Self::components(path);
        let mut cwd = if absolute { Vec::new() } else { self.cwd.clone() };
        for comp in comps {
            match comp {
                b"." => {}
                b".." => {
                    cwd.pop();
                }
                name => cwd.push(name.to_vec()),
            }
        }
        self.cwd = cwd;
        Ok(())
    }

    /// The current working directory as an absolute path.
    pub fn getcwd(&self) -> Vec<u8> {
        let mut path = vec![b'/'];
        for (i, comp) in self.cwd.iter().enumerate() {
            if i > 0 {
                path.push(b'/');
            }
            path.extend_from_slice(comp);
        }
        path
    }

    /// Reads every entry slot of a directory, tombstones included; callers
    /// filter on [`DirMode::EXISTS`].
    pub fn read_dir(&mut self, path: &[u8]) -> Result<Vec<DirEntry>> {
        Self::with_path(path, self.read_dir_inner(path))
    }

    fn read_dir_inner(&mut self, path: &[u8]) -> Result<Vec<DirEntry>> {
        let dir = self.resolve_dir(path)?;
        let len = self.dir_len(&dir)?;
        let mut entries = Vec::with_capacity(len as usize);
        for i in 0..len {
            entries.push(self.read_dirent_at(dir.first, i)?);
        }
        Ok(entries)
    }

    /// Total bytes a directory occupies: its own clusters plus the
    /// cluster-rounded size of everything below it.
    pub fn dir_size(&mut self, path: &[u8]) -> Result<u64> {
        let dir = Self::with_path(path, self.resolve_dir(path))?;
        let len = self.dir_len(&dir)?;
        self.tree_size(dir.first, len)
    }

    /// `len` is the authoritative slot count from the directory's entry in
    /// its parent; the "." copy is not kept up to date.
    fn tree_size(&mut self, dir_first: u32, len: u32) -> Result<u64> {
        let cs = self.cluster_size();
        let mut total = self.chain_of(dir_first)?.len() as u64 * cs as u64;
        for i in 2..len {
            let ent = self.read_dirent_at(dir_first, i)?;
            if !ent.mode.is_live() {
                continue;
            }
            if ent.mode.is_dir() {
                total += self.tree_size(ent.cluster, ent.length)?;
            } else {
                total += round_up(ent.length, cs) as u64;
            }
        }
        Ok(total)
    }

    /// Loads a single directory entry.
    pub fn get_dirent(&mut self, path: &[u8]) -> Result<DirEntry> {
        let lk = Self::with_path(path, self.lookup(path))?;
        lk.found
            .map(|(_, ent)| ent)
            .ok_or_else(|| Error::not_found(path))
    }

    /// Stores the caller-writable fields of a directory entry: mode, attr
    /// and both timestamps. Structural fields (name, size, cluster linkage)
    /// are preserved.
    pub fn set_dirent(&mut self, path: &[u8], ent: &DirEntry) -> Result<()> {
        let lk = Self::with_path(path, self.lookup(path))?;
        let (index, mut cur) = lk.found.ok_or_else(|| Error::not_found(path))?;
        cur.mode = ent.mode;
        cur.attr = ent.attr;
        cur.created = ent.created;
        cur.modified = ent.modified;
        self.write_dirent_at(lk.parent.first, index, &cur)
    }

    /// The mode of an entry, or `None` if the path does not resolve.
    pub fn get_mode(&mut self, path: &[u8]) -> Result<Option<DirMode>> {
        match self.lookup(path) {
            Ok(lk) => Ok(lk.found.map(|(_, ent)| ent.mode)),
            Err(Error::NotFound { .. }) | Err(Error::NotDirectory { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Expands `*` and `?` wildcards in the final component of `pattern`.
    /// Parent components are resolved literally. An unresolvable parent
    /// yields no matches.
    pub fn glob(&mut self, pattern: &[u8]) -> Result<Vec<Vec<u8>>> {
        let split = pattern.iter().rposition(|&b| b == b'/');
        let (dir_part, name_pat) = match split {
            Some(p) => (&pattern[..=p], &pattern[p + 1..]),
            None => (&pattern[..0], pattern),
        };
        let dir = match self.resolve_dir(dir_part) {
            Ok(dir) => dir,
            Err(Error::NotFound { .. }) | Err(Error::NotDirectory { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let len = self.dir_len(&dir)?;
        let mut matches = Vec::new();
        for i in 0..len {
            let ent = self.read_dirent_at(dir.first, i)?;
            if !ent.mode.is_live() || ent.is_dot() {
                continue;
            }
            if wild_match(name_pat, ent.name()) {
                let mut path = dir_part.to_vec();
                path.extend_from_slice(ent.name());
                matches.push(path);
            }
        }
        Ok(matches)
    }

    /// Free space in bytes.
    pub fn get_free_space(&mut self) -> Result<u64> {
        let free = self.fat.count_free(&mut self.card)?;
        Ok(free as u64 * self.cluster_size() as u64)
    }

    /// Verifies the filesystem invariants: well-formed chains, file sizes
    /// covered by their chains, no cluster in two chains, no allocated
    /// cluster unreachable from the root. Problems are logged and `false`
    /// is returned; the image is not modified.
    pub fn check(&mut self) -> Result<bool> {
        let sb = self.superblock().clone();
        let total = self.fat.entries();
        let mut refs = vec![0u32; total as usize];
        let mut ok = true;

        let bad_blocks = sb
            .bad_block_list
            .iter()
            .filter(|&&b| b != 0xFFFF_FFFF)
            .count();
        if bad_blocks > 2 {
            log::warn!("{bad_blocks} bad erase blocks but only two backup blocks");
            ok = false;
        }

        let root_len = self.read_dirent_at(sb.rootdir_cluster, 0)?.length;
        let mut stack = vec![(sb.rootdir_cluster, root_len, b"/".to_vec())];
        let mut visited = 0u32;
        while let Some((first, auth_len, path)) = stack.pop() {
            visited += 1;
            if visited > total {
                log::warn!("directory tree does not terminate");
                ok = false;
                break;
            }
            let name = String::from_utf8_lossy(&path).into_owned();
            let chain = match self.chain_of(first) {
                Ok(chain) => chain,
                Err(e) => {
                    log::warn!("{name}: bad directory chain: {e}");
                    ok = false;
                    continue;
                }
            };
            for &c in &chain {
                refs[c as usize] += 1;
                if refs[c as usize] > 1 {
                    log::warn!("{name}: cluster {c:#x} is cross-linked");
                    ok = false;
                }
            }

            match self.read_dirent_at(first, 0) {
                Ok(dot) if dot.name() == b"." => {}
                Ok(_) => {
                    log::warn!("{name}: first entry is not \".\"");
                    ok = false;
                }
                Err(e) => {
                    log::warn!("{name}: unreadable \".\" entry: {e}");
                    ok = false;
                }
            }
            let mut len = auth_len;
            let capacity = chain.len() as u32 * self.entries_per_cluster();
            if len > capacity {
                log::warn!("{name}: entry count {len} exceeds the directory's clusters");
                ok = false;
                len = capacity;
            }

            for i in 2..len {
                let ent = self.read_dirent_at(first, i)?;
                if !ent.mode.is_live() {
                    continue;
                }
                let ent_name = ent.name_lossy();
                if ent.mode.is_dir() == ent.mode.is_file() {
                    log::warn!("{name}{ent_name}: neither a file nor a directory");
                    ok = false;
                    continue;
                }
                if ent.mode.is_dir() {
                    let mut sub = path.clone();
                    sub.extend_from_slice(ent.name());
                    sub.push(b'/');
                    stack.push((ent.cluster, ent.length, sub));
                } else {
                    match self.chain_of(ent.cluster) {
                        Ok(chain) => {
                            for &c in &chain {
                                refs[c as usize] += 1;
                                if refs[c as usize] > 1 {
                                    log::warn!("{name}{ent_name}: cluster {c:#x} is cross-linked");
                                    ok = false;
                                }
                            }
                            let needed = div_round_up(ent.length, self.cluster_size());
                            if (chain.len() as u32) < needed {
                                log::warn!(
                                    "{name}{ent_name}: {} clusters cannot hold {} bytes",
                                    chain.len(),
                                    ent.length
                                );
                                ok = false;
                            }
                        }
                        Err(e) => {
                            log::warn!("{name}{ent_name}: bad cluster chain: {e}");
                            ok = false;
                        }
                    }
                }
            }
        }

        for n in 0..total {
            let entry = self.fat.read_entry(&mut self.card, n)?;
            if entry & ALLOCATED != 0 && refs[n as usize] == 0 {
                log::warn!("cluster {n:#x} is allocated but unreachable");
                ok = false;
            }
        }
        Ok(ok)
    }
}

/// `*`/`?` wildcard match over raw bytes.
fn wild_match(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.split_first(), name.split_first()) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some((&b'*', rest)), _) => {
            wild_match(rest, name) || (!name.is_empty() && wild_match(pattern, &name[1..]))
        }
        (Some((&b'?', prest)), Some((_, nrest))) => wild_match(prest, nrest),
        (Some((p, prest)), Some((n, nrest))) => p == n && wild_match(prest, nrest),
        (Some(_), None) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcards() {
        assert!(wild_match(b"*", b"anything"));
        assert!(wild_match(b"*", b""));
        assert!(wild_match(b"BE*GAME", b"BESLES-50001GAME"));
        assert!(wild_match(b"?????", b"ABCDE"));
        assert!(!wild_match(b"?????", b"ABCD"));
        assert!(!wild_match(b"BE*GAME", b"BESLES-50001DATA"));
        assert!(wild_match(b"a*b*c", b"aXbYbZc"));
    }

    #[test]
    fn path_components() {
        let (abs, comps) = McFs::<std::io::Cursor<Vec<u8>>>::components(b"/A/B/");
        assert!(abs);
        assert_eq!(comps, vec![&b"A"[..], &b"B"[..]]);
        let (abs, comps) = McFs::<std::io::Cursor<Vec<u8>>>::components(b"./A//B");
        assert!(!abs);
        assert_eq!(comps, vec![&b"."[..], &b"A"[..], &b"B"[..]]);
    }
}
