//! ZIP / CBZ driver. Members are independently compressed, so several
//! handles can extract in parallel.

use std::fs::File;
use std::io::BufReader;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use tracing::warn;
use zip::ZipArchive;

use super::names::NameMap;
use super::registry::{has_extension, DriverFactory};
use super::{write_entry, ArchiveDriver, ArchiveKind, ArchiveOptions};
use crate::error::{Error, Result};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";

pub struct ZipFactory;

impl DriverFactory for ZipFactory {
    fn name(&self) -> &'static str {
        "zip"
    }

    fn probe(&self, path: &Path, header: &[u8]) -> bool {
        header.starts_with(ZIP_MAGIC)
            || header.starts_with(ZIP_EMPTY_MAGIC)
            || (header.is_empty() && has_extension(path, &["zip", "cbz"]))
    }

    fn open(&self, path: &Path, options: &ArchiveOptions) -> Result<Box<dyn ArchiveDriver>> {
        Ok(Box::new(ZipDriver::open(path, options.password.clone())?))
    }
}

pub struct ZipDriver {
    path: PathBuf,
    archive: ZipArchive<BufReader<File>>,
    password: Option<String>,
    names: NameMap<String>,
}

impl ZipDriver {
    pub fn open(path: &Path, password: Option<String>) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::open(path, e))?;
        let archive = ZipArchive::new(BufReader::new(file)).map_err(|e| Error::open(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            archive,
            password,
            names: NameMap::new(),
        })
    }

    /// Build the name mapping without reporting anything.
    fn ensure_listed(&mut self) -> Result<()> {
        if self.names.is_empty() {
            self.list(&mut |_| ControlFlow::Continue(()))?;
        }
        Ok(())
    }
}

impl ArchiveDriver for ZipDriver {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Zip
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn is_solid(&self) -> bool {
        false
    }

    fn supports_concurrent_extraction(&self) -> bool {
        true
    }

    fn list(&mut self, visit: &mut dyn FnMut(String) -> ControlFlow<()>) -> Result<()> {
        let mut names = NameMap::new();
        for index in 0..self.archive.len() {
            let entry = self
                .archive
                .by_index_raw(index)
                .map_err(|e| Error::open(&self.path, e))?;
            if entry.is_dir() {
                continue;
            }
            if entry.enclosed_name().is_none() {
                warn!(name = entry.name(), "Skipping zip member with unsafe path");
                continue;
            }
            let raw = entry.name().to_owned();
            let safe = names.register(&raw, raw.clone());
            if visit(safe).is_break() {
                break;
            }
        }
        self.names = names;
        Ok(())
    }

    fn extract_one(&mut self, name: &str, destination: &Path) -> Result<()> {
        self.ensure_listed()?;
        let raw = self
            .names
            .original(name)
            .cloned()
            .ok_or_else(|| Error::UnknownMember(name.to_owned()))?;

        let mut entry = match &self.password {
            Some(password) => self.archive.by_name_decrypt(&raw, password.as_bytes()),
            None => self.archive.by_name(&raw),
        }
        .map_err(|e| Error::entry(name, e))?;

        write_entry(name, &mut entry, destination)
    }

    fn reopen(&self) -> Result<Box<dyn ArchiveDriver>> {
        let mut driver = ZipDriver::open(&self.path, self.password.clone())?;
        driver.names = self.names.clone();
        Ok(Box::new(driver))
    }
}
