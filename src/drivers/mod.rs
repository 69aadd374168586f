//! Archive drivers for the extraction pipeline.
//!
//! This module provides:
//! - `ArchiveDriver` - The uniform contract the extractor consumes
//! - `DriverRegistry` - Probe-based selection of a driver for a file
//! - Drivers for zip, tar, 7z and PDF (through MuPDF)

pub mod names;
pub mod pdf;
pub mod process;
pub mod registry;
pub mod sevenzip;
pub mod tar;
pub mod zip;

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::error::{Error, Result};

pub use registry::{DriverFactory, DriverRegistry};

/// Archive families known to the shipped drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveKind {
    Zip,
    Tar,
    SevenZip,
    Pdf,
    /// A driver registered by the host application.
    Other(&'static str),
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveKind::Zip => f.write_str("zip"),
            ArchiveKind::Tar => f.write_str("tar"),
            ArchiveKind::SevenZip => f.write_str("7z"),
            ArchiveKind::Pdf => f.write_str("pdf"),
            ArchiveKind::Other(name) => f.write_str(name),
        }
    }
}

/// Options handed to a driver when it opens an archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveOptions {
    pub password: Option<String>,
}

/// One step of a bulk extraction, reported in archive order.
#[derive(Debug)]
pub enum BulkOutcome<'a> {
    /// The member is fully written to its destination.
    Written(&'a str),
    /// The member could not be written; the pass continues.
    Failed(&'a str, Error),
}

/// Format-specific access to one open archive.
///
/// A handle is used by one thread at a time. Extra handles for parallel
/// workers come from [`ArchiveDriver::reopen`].
pub trait ArchiveDriver: Send {
    fn kind(&self) -> ArchiveKind;

    /// Absolute path of the archive.
    fn path(&self) -> &Path;

    /// Whether members share one compressed stream.
    fn is_solid(&self) -> bool;

    /// Whether several handles may extract single members at the same time.
    fn supports_concurrent_extraction(&self) -> bool;

    /// Enumerate members in archive order. `visit` may break early.
    fn list(&mut self, visit: &mut dyn FnMut(String) -> ControlFlow<()>) -> Result<()>;

    /// Write exactly one member to `destination`.
    fn extract_one(&mut self, name: &str, destination: &Path) -> Result<()>;

    /// Write every member of `entries` to its mapped path, reporting each in
    /// archive-native order.
    ///
    /// The default makes one `extract_one` call per entry, which is fine for
    /// formats with random access.
    fn extract_many(
        &mut self,
        entries: &BTreeMap<String, PathBuf>,
        visit: &mut dyn FnMut(BulkOutcome<'_>) -> ControlFlow<()>,
    ) -> Result<()> {
        for (name, destination) in entries {
            let outcome = match self.extract_one(name, destination) {
                Ok(()) => BulkOutcome::Written(name),
                Err(e) => BulkOutcome::Failed(name, e),
            };
            if visit(outcome).is_break() {
                break;
            }
        }
        Ok(())
    }

    /// Open a fresh handle on the same archive, keeping the name mapping.
    fn reopen(&self) -> Result<Box<dyn ArchiveDriver>>;

    /// Release held resources. Called once at teardown.
    fn close(&mut self) {}
}

/// Copy `reader` into `destination` through a `.part` sibling so the final
/// path only ever holds a complete file.
pub(crate) fn write_entry(name: &str, reader: &mut dyn Read, destination: &Path) -> Result<()> {
    let partial = partial_path(destination);
    let result = copy_to(reader, destination, &partial);
    if let Err(e) = result {
        let _ = fs::remove_file(&partial);
        return Err(Error::entry(name, e));
    }
    trace!(name, ?destination, "Wrote archive member");
    Ok(())
}

fn copy_to(reader: &mut dyn Read, destination: &Path, partial: &Path) -> io::Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = File::create(partial)?;
    io::copy(reader, &mut file)?;
    file.sync_data()?;
    drop(file);
    fs::rename(partial, destination)
}

pub(crate) fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
