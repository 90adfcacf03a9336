use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{Error, Result};
use crate::structures::raw::dirent::{RawDirEntry, RawTod};
use crate::util::zero_terminate;

pub use crate::structures::raw::dirent::DIRENT_SIZE;

/// Maximum length of an entry name in bytes.
pub const NAME_MAX: usize = 32;

bitflags::bitflags! {
    /// Directory entry attribute bits
    ///
    /// The positions are the on-card ones and must not change. `F0400` is
    /// set on every entry the console creates; its meaning is unknown and
    /// the name follows the convention of the PS2 SDK headers.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DirMode: u16 {
        const READ      = 0x0001;
        const WRITE     = 0x0002;
        const EXECUTE   = 0x0004;
        const PROTECTED = 0x0008;
        const FILE      = 0x0010;
        const DIR       = 0x0020;
        const CLOSED    = 0x0080;
        const F0400     = 0x0400;
        const POCKETSTN = 0x0800;
        const PSX       = 0x1000;
        const HIDDEN    = 0x2000;
        const EXISTS    = 0x8000;
    }
}

/// Mode of a freshly created file.
pub const DEFAULT_FILE_MODE: DirMode = DirMode::READ
    .union(DirMode::WRITE)
    .union(DirMode::EXECUTE)
    .union(DirMode::FILE)
    .union(DirMode::CLOSED)
    .union(DirMode::F0400)
    .union(DirMode::EXISTS);

/// Mode of a freshly created directory.
pub const DEFAULT_DIR_MODE: DirMode = DirMode::READ
    .union(DirMode::WRITE)
    .union(DirMode::EXECUTE)
    .union(DirMode::DIR)
    .union(DirMode::F0400)
    .union(DirMode::EXISTS);

impl DirMode {
    pub fn is_file(self) -> bool {
        self.contains(DirMode::FILE)
    }

    pub fn is_dir(self) -> bool {
        self.contains(DirMode::DIR)
    }

    pub fn is_live(self) -> bool {
        self.contains(DirMode::EXISTS)
    }
}

/// A packed time-of-day stamp with an absolute year.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tod {
    pub sec: u8,
    pub min: u8,
    pub hour: u8,
    pub mday: u8,
    pub month: u8,
    pub year: u16,
}

impl Tod {
    /// The current wall-clock time in the writer's local time zone.
    pub fn now() -> Self {
        Self::from_datetime(Local::now().naive_local())
    }

    pub fn from_datetime(dt: NaiveDateTime) -> Self {
        Self {
            sec: dt.second() as u8,
            min: dt.minute() as u8,
            hour: dt.hour() as u8,
            mday: dt.day() as u8,
            month: dt.month() as u8,
            year: dt.year().clamp(0, u16::MAX as i32) as u16,
        }
    }

    /// Back to calendar time. The all-zero stamp (and any other stamp with
    /// out-of-range fields) maps to the card epoch, midnight 2000-01-01.
    pub fn to_datetime(self) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(self.year as i32, self.month as u32, self.mday as u32)
            .and_then(|d| d.and_hms_opt(self.hour as u32, self.min as u32, self.sec as u32))
            .unwrap_or_else(|| {
                NaiveDate::from_ymd_opt(2000, 1, 1)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
            })
    }

    pub(crate) fn from_raw(raw: &RawTod) -> Self {
        Self {
            sec: raw.sec,
            min: raw.min,
            hour: raw.hour,
            mday: raw.mday,
            month: raw.month,
            year: u16::from_le_bytes(raw.year),
        }
    }

    pub(crate) fn to_raw(self) -> RawTod {
        RawTod {
            resv: 0,
            sec: self.sec,
            min: self.min,
            hour: self.hour,
            mday: self.mday,
            month: self.month,
            year: self.year.to_le_bytes(),
        }
    }
}

/// Native-field view of a 512-byte directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub mode: DirMode,
    /// Byte length for files; total entry slots for directories.
    pub length: u32,
    pub created: Tod,
    /// First cluster, relative to the allocation offset.
    pub cluster: u32,
    /// Slot index within the parent (meaningful in "." entries).
    pub dir_entry: u32,
    pub modified: Tod,
    pub attr: u32,
    name: [u8; NAME_MAX],
}

impl DirEntry {
    pub fn new(name: &[u8], mode: DirMode) -> Result<Self> {
        let mut ent = Self {
            mode,
            length: 0,
            created: Tod::now(),
            cluster: 0,
            dir_entry: 0,
            modified: Tod::now(),
            attr: 0,
            name: [0; NAME_MAX],
        };
        ent.set_name(name)?;
        Ok(ent)
    }

    pub fn from_bytes(bytes: &[u8; DIRENT_SIZE]) -> Self {
        let raw = RawDirEntry::from_bytes(bytes);
        Self {
            mode: DirMode::from_bits_retain(u16::from_le_bytes(raw.mode)),
            length: u32::from_le_bytes(raw.length),
            created: Tod::from_raw(&raw.created),
            cluster: u32::from_le_bytes(raw.cluster),
            dir_entry: u32::from_le_bytes(raw.dir_entry),
            modified: Tod::from_raw(&raw.modified),
            attr: u32::from_le_bytes(raw.attr),
            name: raw.name,
        }
    }

    pub fn to_raw(&self) -> RawDirEntry {
        RawDirEntry {
            mode: self.mode.bits().to_le_bytes(),
            unused: [0; 2],
            length: self.length.to_le_bytes(),
            created: self.created.to_raw(),
            cluster: self.cluster.to_le_bytes(),
            dir_entry: self.dir_entry.to_le_bytes(),
            modified: self.modified.to_raw(),
            attr: self.attr.to_le_bytes(),
            unused2: [0; 28],
            name: self.name,
            padding: [0; 416],
        }
    }

    /// The name with its NUL padding stripped.
    pub fn name(&self) -> &[u8] {
        zero_terminate(&self.name)
    }

    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(self.name()).into_owned()
    }

    pub fn set_name(&mut self, name: &[u8]) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX {
            return Err(Error::InvalidArg(format!(
                "entry names must be 1 to {NAME_MAX} bytes"
            )));
        }
        if name.contains(&b'/') || name.contains(&0) {
            return Err(Error::InvalidArg("invalid character in entry name".into()));
        }
        self.name = [0; NAME_MAX];
        self.name[..name.len()].copy_from_slice(name);
        Ok(())
    }

    /// Whether this is one of the two bookkeeping entries at the head of
    /// every directory.
    pub fn is_dot(&self) -> bool {
        matches!(self.name(), b"." | b"..")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn entry_round_trips() {
        let mut ent = DirEntry::new(b"BESLES-50001GAME", DEFAULT_DIR_MODE).unwrap();
        ent.length = 2;
        ent.cluster = 17;
        ent.dir_entry = 4;
        ent.attr = 0xDEAD_BEEF;
        let raw = ent.to_raw();
        let bytes: &[u8; DIRENT_SIZE] = raw.as_bytes().try_into().unwrap();
        assert_eq!(DirEntry::from_bytes(bytes), ent);
    }

    #[test]
    fn tod_round_trips_at_second_precision() {
        let dt = NaiveDate::from_ymd_opt(2003, 11, 9)
            .unwrap()
            .and_hms_opt(23, 59, 58)
            .unwrap();
        assert_eq!(Tod::from_datetime(dt).to_datetime(), dt);

        let now = Local::now().naive_local();
        let tod = Tod::from_datetime(now);
        assert_eq!(tod.to_datetime().and_utc().timestamp(), {
            // Sub-second precision is not representable and must be the only
            // loss.
            now.and_utc().timestamp()
        });
    }

    #[test]
    fn zero_tod_is_the_card_epoch() {
        let dt = Tod::default().to_datetime();
        assert_eq!((dt.year(), dt.month(), dt.day()), (2000, 1, 1));
    }

    #[test]
    fn name_validation() {
        let mut ent = DirEntry::new(b"ok", DEFAULT_FILE_MODE).unwrap();
        assert!(ent.set_name(b"").is_err());
        assert!(ent.set_name(&[b'a'; 33]).is_err());
        assert!(ent.set_name(b"a/b").is_err());
        assert!(ent.set_name(&[b'a'; 32]).is_ok());
        assert_eq!(ent.name().len(), 32);
    }

    #[test]
    fn default_modes() {
        assert_eq!(DEFAULT_FILE_MODE.bits(), 0x8497);
        assert_eq!(DEFAULT_DIR_MODE.bits(), 0x8427);
        assert!(DEFAULT_FILE_MODE.is_file());
        assert!(DEFAULT_DIR_MODE.is_dir());
        assert!(DEFAULT_DIR_MODE.is_live());
    }
}
