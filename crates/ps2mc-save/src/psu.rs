//! The EMS Memory Adapter `.psu` container.
//!
//! A `.psu` file is the save directory serialized as bare card records: the
//! directory's own 512-byte entry, the "." and ".." entries, then one entry
//! per file followed by its data padded with zeros to a 1024-byte boundary.
//! Timestamps, modes and attributes ride along unchanged, which is why this
//! is the lossless interchange format.

use std::io::{Read, Write};

use ps2mc_fs::{DirEntry, DIRENT_SIZE};

use crate::{Result, SaveEntry, SaveError, SaveFile};

/// File data is padded to this boundary.
const DATA_ALIGN: usize = 1024;

fn read_record(r: &mut impl Read) -> Result<DirEntry> {
    let mut buf = [0u8; DIRENT_SIZE];
    r.read_exact(&mut buf)?;
    Ok(DirEntry::from_bytes(&buf))
}

pub(crate) fn load(r: &mut impl Read) -> Result<SaveFile> {
    let root = read_record(r)?;
    let dot = read_record(r)?;
    let dotdot = read_record(r)?;
    if !root.mode.is_dir()
        || !dot.mode.is_dir()
        || !dotdot.mode.is_dir()
        || dot.name() != b"."
        || dotdot.name() != b".."
        || root.length < 2
    {
        return Err(SaveError::Corrupt("not an EMS (.psu) save file".into()));
    }

    let count = root.length - 2;
    let mut files = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let ent = read_record(r)?;
        if ent.mode.is_dir() {
            return Err(SaveError::Subdirectory);
        }
        if !ent.mode.is_file() {
            return Err(SaveError::Corrupt(format!(
                "{}: neither a file nor a directory",
                ent.name_lossy()
            )));
        }
        let mut data = vec![0u8; ent.length as usize];
        r.read_exact(&mut data)?;
        let padding = data.len().next_multiple_of(DATA_ALIGN) - data.len();
        std::io::copy(&mut r.by_ref().take(padding as u64), &mut std::io::sink())?;
        files.push(SaveEntry { ent, data });
    }
    Ok(SaveFile::new(root, files))
}

pub(crate) fn save(w: &mut impl Write, sf: &SaveFile) -> Result<()> {
    let mut root = sf.dir().clone();
    root.length = sf.files().len() as u32 + 2;
    root.cluster = 0;
    root.dir_entry = 0;
    w.write_all(root.to_raw().as_bytes())?;

    // "." and ".." carry the directory's own mode and stamps.
    for name in [&b"."[..], &b".."[..]] {
        let mut ent = DirEntry::new(name, root.mode)?;
        ent.created = root.created;
        ent.modified = root.modified;
        w.write_all(ent.to_raw().as_bytes())?;
    }

    for file in sf.files() {
        let mut ent = file.ent.clone();
        ent.length = file.data.len() as u32;
        ent.cluster = 0;
        ent.dir_entry = 0;
        w.write_all(ent.to_raw().as_bytes())?;
        w.write_all(&file.data)?;
        let padding = file.data.len().next_multiple_of(DATA_ALIGN) - file.data.len();
        w.write_all(&vec![0u8; padding])?;
    }
    Ok(())
}
