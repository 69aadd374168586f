use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported archive format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("failed to open archive '{}': {reason}", path.display())]
    ArchiveOpen { path: PathBuf, reason: String },

    #[error("failed to extract '{name}': {reason}")]
    EntryExtraction { name: String, reason: String },

    #[error("'{program}' failed: {reason}")]
    DriverProcess { program: String, reason: String },

    #[error("no such archive member: '{0}'")]
    UnknownMember(String),

    #[error("destination name escapes the extraction directory: '{0}'")]
    UnsafeDestination(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn entry(name: &str, reason: impl ToString) -> Self {
        Self::EntryExtraction {
            name: name.to_owned(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn open(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ArchiveOpen {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
