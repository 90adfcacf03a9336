use std::borrow::Cow;

/// Errors that can occur when working with a memory card image
///
/// Filesystem errors carry the name of the entry they apply to where one is
/// known; callers that report errors to a user should prefix messages with
/// [`Error::name`] when it is present.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An IO error on the backing image file
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An uncorrectable ECC failure while reading a page
    #[error("uncorrectable ECC error on page {page:#x}")]
    Ecc { page: u32 },

    /// The image violates a filesystem invariant (bad magic, FAT cycle,
    /// cross-linked cluster, invalid directory entry)
    #[error("{0}")]
    Corrupt(String),

    #[error("file not found")]
    NotFound { name: String },

    #[error("file exists")]
    Exists { name: String },

    #[error("directory not empty")]
    NotEmpty { name: String },

    #[error("is a directory")]
    IsDirectory { name: String },

    #[error("not a directory")]
    NotDirectory { name: String },

    #[error("{0}")]
    InvalidArg(String),

    #[error("not enough free space")]
    NoSpace,

    /// Operation on a file handle that has already been closed
    #[error("file handle is closed")]
    BadHandle,
}

impl Error {
    pub(crate) fn not_found(name: &[u8]) -> Self {
        Error::NotFound { name: lossy(name) }
    }

    pub(crate) fn exists(name: &[u8]) -> Self {
        Error::Exists { name: lossy(name) }
    }

    pub(crate) fn not_empty(name: &[u8]) -> Self {
        Error::NotEmpty { name: lossy(name) }
    }

    pub(crate) fn is_directory(name: &[u8]) -> Self {
        Error::IsDirectory { name: lossy(name) }
    }

    pub(crate) fn not_directory(name: &[u8]) -> Self {
        Error::NotDirectory { name: lossy(name) }
    }

    /// The entry name the error applies to, when one is known.
    pub fn name(&self) -> Option<&str> {
        match self {
            Error::NotFound { name }
            | Error::Exists { name }
            | Error::NotEmpty { name }
            | Error::IsDirectory { name }
            | Error::NotDirectory { name } => Some(name),
            _ => None,
        }
    }
}

fn lossy(name: &[u8]) -> String {
    match String::from_utf8_lossy(name) {
        Cow::Borrowed(s) => s.to_owned(),
        Cow::Owned(s) => s,
    }
}

pub type Result<T> = std::result::Result<T, Error>;
