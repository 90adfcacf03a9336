//! Game-save archives for PS2 memory card images.
//!
//! Every supported container carries one save directory and its files; the
//! common in-memory form is [`SaveFile`]. The EMS `.psu` format — bare
//! directory-entry records plus padded file data — is read and written in
//! full. The MAX Drive, CodeBreaker and SharkPort containers wrap the same
//! payload in compressed or encrypted framing; they are recognized by
//! [`detect`] and refused, as are nPort saves.
//!
//! Importing and exporting goes through the public [`McFs`] file API only:
//! `mkdir`, `open_file`/`write`, and `set_dirent` for the attribute and
//! timestamp metadata.

pub mod icon;
pub mod psu;

use std::io::{Read, Seek, SeekFrom, Write};

use ps2mc_fs::{DirEntry, DirMode, McFs, OpenMode};

use icon::IconSys;

/// Errors from loading, saving, importing or exporting save archives.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error(transparent)]
    Fs(#[from] ps2mc_fs::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The input matches no known save archive format.
    #[error("save file format not recognized")]
    UnknownFormat,

    /// A recognized format this implementation does not decode.
    #[error("{0} save files are not supported")]
    Unsupported(&'static str),

    /// A save directory with a nested directory inside it.
    #[error("subdirectories are not supported in save files")]
    Subdirectory,

    #[error("{0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, SaveError>;

/// Recognized save archive containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// EMS Memory Adapter (.psu).
    Psu,
    /// MAX Drive / PowerSave (.max).
    Max,
    /// CodeBreaker Day 1 (.cbs).
    Cbs,
    /// SharkPort / X-Port (.sps / .xps).
    Sps,
    /// nPort (.npo).
    Npo,
}

impl SaveFormat {
    pub fn display_name(self) -> &'static str {
        match self {
            SaveFormat::Psu => "EMS",
            SaveFormat::Max => "MAX Drive",
            SaveFormat::Cbs => "CodeBreaker",
            SaveFormat::Sps => "SharkPort",
            SaveFormat::Npo => "nPort",
        }
    }
}

const MAX_MAGIC: &[u8] = b"Ps2PowerSave";
const CBS_MAGIC: &[u8] = b"CFU\0";
const NPO_MAGIC: &[u8] = b"nPort";
const SPS_MAGIC: &[u8] = b"SharkPortSave";

/// Sniffs the container format from the head of `r`, leaving the stream
/// rewound to the start.
pub fn detect(r: &mut (impl Read + Seek)) -> Result<SaveFormat> {
    let mut head = [0u8; 64];
    r.seek(SeekFrom::Start(0))?;
    let mut got = 0;
    while got < head.len() {
        let n = r.read(&mut head[got..])?;
        if n == 0 {
            break;
        }
        got += n;
    }
    r.seek(SeekFrom::Start(0))?;
    let head = &head[..got];

    if head.starts_with(MAX_MAGIC) {
        return Ok(SaveFormat::Max);
    }
    if head.starts_with(CBS_MAGIC) {
        return Ok(SaveFormat::Cbs);
    }
    if head.starts_with(NPO_MAGIC) {
        return Ok(SaveFormat::Npo);
    }
    if head.len() >= 4 + SPS_MAGIC.len() && &head[4..4 + SPS_MAGIC.len()] == SPS_MAGIC {
        return Ok(SaveFormat::Sps);
    }
    // A .psu file has no magic; its first record is the save directory's
    // entry, so sniff for a live directory mode and a plausible slot count.
    if head.len() >= 8 {
        let mode = DirMode::from_bits_retain(u16::from_le_bytes(head[0..2].try_into().unwrap()));
        let length = u32::from_le_bytes(head[4..8].try_into().unwrap());
        if mode.is_live() && mode.is_dir() && length >= 2 {
            return Ok(SaveFormat::Psu);
        }
    }
    Err(SaveError::UnknownFormat)
}

/// One file inside a save archive: the card directory entry (mode,
/// timestamps, attributes, name) and the raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveEntry {
    pub ent: DirEntry,
    pub data: Vec<u8>,
}

/// A save archive in memory: the save directory's entry plus its files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveFile {
    dir: DirEntry,
    files: Vec<SaveEntry>,
}

impl SaveFile {
    /// Builds a save file; the directory entry's slot count is normalized to
    /// the file count.
    pub fn new(mut dir: DirEntry, files: Vec<SaveEntry>) -> Self {
        dir.length = files.len() as u32 + 2;
        dir.cluster = 0;
        dir.dir_entry = 0;
        Self { dir, files }
    }

    /// Loads any recognized archive; refuses the formats whose codecs are
    /// not implemented.
    pub fn load(r: &mut (impl Read + Seek)) -> Result<Self> {
        let format = detect(r)?;
        log::debug!("detected a {} save file", format.display_name());
        match format {
            SaveFormat::Psu => psu::load(r),
            other => Err(SaveError::Unsupported(other.display_name())),
        }
    }

    /// Serializes as an EMS `.psu` archive.
    pub fn save_psu(&self, w: &mut impl Write) -> Result<()> {
        psu::save(w, self)
    }

    pub fn dir(&self) -> &DirEntry {
        &self.dir
    }

    /// Name of the save directory on the card.
    pub fn dir_name(&self) -> &[u8] {
        self.dir.name()
    }

    pub fn files(&self) -> &[SaveEntry] {
        &self.files
    }

    /// The save's icon.sys record, when present.
    pub fn icon_sys(&self) -> Option<IconSys> {
        self.files
            .iter()
            .find(|f| f.ent.name() == b"icon.sys")
            .and_then(|f| IconSys::parse(&f.data))
    }

    /// Installs the save into `fs` under `target` (default: the archive's
    /// own directory name).
    ///
    /// Returns `false` without touching the image when the directory already
    /// exists and `ignore_existing` is set; fails with `Exists` otherwise.
    /// Free space is checked up front so a doomed import does not leave a
    /// half-written directory behind.
    pub fn import<T: Read + Write + Seek>(
        &self,
        fs: &mut McFs<T>,
        ignore_existing: bool,
        target: Option<&[u8]>,
    ) -> Result<bool> {
        let dirname = target.unwrap_or_else(|| self.dir_name()).to_vec();
        if fs.get_mode(&dirname)?.is_some() {
            if ignore_existing {
                return Ok(false);
            }
            return Err(ps2mc_fs::Error::Exists {
                name: String::from_utf8_lossy(&dirname).into_owned(),
            }
            .into());
        }

        let cs = fs.cluster_size() as u64;
        let dirent_slots = self.files.len() as u64 + 2;
        let mut needed = (dirent_slots * 512).div_ceil(cs);
        for file in &self.files {
            needed += (file.data.len() as u64).div_ceil(cs).max(1);
        }
        if needed * cs > fs.get_free_space()? {
            return Err(ps2mc_fs::Error::NoSpace.into());
        }

        fs.mkdir(&dirname)?;
        for file in &self.files {
            let mut path = dirname.clone();
            path.push(b'/');
            path.extend_from_slice(file.ent.name());
            let mut handle = fs.open_file(&path, OpenMode::Write)?;
            handle.write(fs, &file.data)?;
            handle.close(fs)?;
            // Whatever the archive carried, the installed entry must stay
            // live.
            let mut meta = file.ent.clone();
            meta.mode |= DirMode::EXISTS;
            fs.set_dirent(&path, &meta)?;
        }
        let mut meta = self.dir.clone();
        meta.mode |= DirMode::EXISTS;
        fs.set_dirent(&dirname, &meta)?;
        Ok(true)
    }

    /// Reads the save directory `dirname` out of `fs`.
    pub fn export<T: Read + Write + Seek>(fs: &mut McFs<T>, dirname: &[u8]) -> Result<Self> {
        let dir = fs.get_dirent(dirname)?;
        if !dir.mode.is_dir() {
            return Err(ps2mc_fs::Error::NotDirectory {
                name: String::from_utf8_lossy(dirname).into_owned(),
            }
            .into());
        }
        let mut files = Vec::new();
        for ent in fs.read_dir(dirname)? {
            if !ent.mode.is_live() || ent.is_dot() {
                continue;
            }
            if ent.mode.is_dir() {
                return Err(SaveError::Subdirectory);
            }
            let mut path = dirname.to_vec();
            path.push(b'/');
            path.extend_from_slice(ent.name());
            let mut handle = fs.open_file(&path, OpenMode::Read)?;
            let data = handle.read_to_end(fs)?;
            handle.close(fs)?;
            let mut ent = ent;
            ent.cluster = 0;
            ent.dir_entry = 0;
            files.push(SaveEntry { ent, data });
        }
        Ok(Self::new(dir, files))
    }
}

/// Builds a longer, more descriptive host filename for an exported save:
/// the directory name followed by the icon title, reduced to filesystem-safe
/// characters.
pub fn make_longname(dirname: &[u8], sf: &SaveFile) -> String {
    let mut name = String::from_utf8_lossy(dirname).into_owned();
    if let Some(icon) = sf.icon_sys() {
        let (line0, line1) = icon.title();
        let title = format!("{line0} {line1}");
        let clean: String = title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let clean = clean.trim_matches('_');
        if !clean.is_empty() {
            name.push('_');
            name.push_str(clean);
        }
    }
    let mut end = name.len().min(64);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn detect_magics() {
        let mut max = Cursor::new(b"Ps2PowerSave\0\0\0\0rest".to_vec());
        assert_eq!(detect(&mut max).unwrap(), SaveFormat::Max);
        assert_eq!(max.position(), 0);

        let mut cbs = Cursor::new(b"CFU\0 more".to_vec());
        assert_eq!(detect(&mut cbs).unwrap(), SaveFormat::Cbs);

        let mut npo = Cursor::new(b"nPort stuff".to_vec());
        assert_eq!(detect(&mut npo).unwrap(), SaveFormat::Npo);

        let mut sps = Cursor::new(b"\x0d\0\0\0SharkPortSave etc".to_vec());
        assert_eq!(detect(&mut sps).unwrap(), SaveFormat::Sps);

        let mut garbage = Cursor::new(vec![0u8; 64]);
        assert!(matches!(detect(&mut garbage), Err(SaveError::UnknownFormat)));
    }

    #[test]
    fn unsupported_formats_are_refused_by_name() {
        let mut max = Cursor::new(b"Ps2PowerSave\0\0\0\0".to_vec());
        match SaveFile::load(&mut max) {
            Err(SaveError::Unsupported("MAX Drive")) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
