//! 7z / CB7 driver backed by `sevenz-rust`.
//!
//! Solidity is read from the archive structure: when a folder (compressed
//! block) holds more than one stream, members have to be decoded in order.
//! Every pass decodes folder by folder with a [`BlockDecoder`], so a pass
//! only touches the folders holding wanted members and ends as soon as the
//! caller breaks.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use sevenz_rust::{Archive, BlockDecoder, Password};
use tracing::debug;

use super::names::NameMap;
use super::registry::{has_extension, DriverFactory};
use super::{write_entry, ArchiveDriver, ArchiveKind, ArchiveOptions, BulkOutcome};
use crate::error::{Error, Result};

const SEVENZ_MAGIC: &[u8] = &[b'7', b'z', 0xBC, 0xAF, 0x27, 0x1C];

type DecodeResult<T> = std::result::Result<T, sevenz_rust::Error>;

pub struct SevenZipFactory;

impl DriverFactory for SevenZipFactory {
    fn name(&self) -> &'static str {
        "7z"
    }

    fn probe(&self, path: &Path, header: &[u8]) -> bool {
        header.starts_with(SEVENZ_MAGIC) || (header.is_empty() && has_extension(path, &["7z", "cb7"]))
    }

    fn open(&self, path: &Path, options: &ArchiveOptions) -> Result<Box<dyn ArchiveDriver>> {
        Ok(Box::new(SevenZipDriver::open(path, options.password.as_deref())?))
    }
}

pub struct SevenZipDriver {
    path: PathBuf,
    /// UTF-16LE encoded, empty when unencrypted.
    password: Vec<u8>,
    archive: Archive,
    solid: bool,
    /// Safe name to index into `archive.files`.
    names: NameMap<usize>,
}

impl SevenZipDriver {
    pub fn open(path: &Path, password: Option<&str>) -> Result<Self> {
        let password = password.map(Password::from).unwrap_or_else(Password::empty).to_vec();
        let mut source = File::open(path).map_err(|e| Error::open(path, e))?;
        let len = source.metadata()?.len();
        let archive = Archive::read(&mut source, len, &password).map_err(|e| Error::open(path, e))?;

        let streams = archive.files.iter().filter(|f| f.has_stream()).count();
        let solid = streams > archive.folders.len();
        debug!(?path, streams, folders = archive.folders.len(), solid, "Opened 7z archive");
        Ok(Self {
            path: path.to_path_buf(),
            password,
            archive,
            solid,
            names: NameMap::new(),
        })
    }

    fn source(&self) -> Result<File> {
        File::open(&self.path).map_err(|e| Error::open(&self.path, e))
    }

    fn ensure_listed(&mut self) -> Result<()> {
        if self.names.is_empty() {
            self.list(&mut |_| ControlFlow::Continue(()))?;
        }
        Ok(())
    }

    /// Decodes one folder, handing `each` the file index and data of every
    /// member in it. Returns `false` once `each` asked to stop.
    fn decode_folder(
        &self,
        source: &mut File,
        folder_index: usize,
        each: &mut dyn FnMut(usize, &mut dyn Read) -> DecodeResult<bool>,
    ) -> DecodeResult<bool> {
        let mut file_index = self.archive.stream_map.folder_first_file_index[folder_index];
        BlockDecoder::new(folder_index, &self.archive, &self.password, source).for_each_entries(
            &mut |_entry, data| {
                let current = file_index;
                file_index += 1;
                each(current, data)
            },
        )
    }
}

/// Consume the rest of a member so the decoder stays aligned.
fn skip(reader: &mut dyn Read) {
    let _ = io::copy(reader, &mut io::sink());
}

impl ArchiveDriver for SevenZipDriver {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::SevenZip
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn is_solid(&self) -> bool {
        self.solid
    }

    fn supports_concurrent_extraction(&self) -> bool {
        !self.solid
    }

    fn list(&mut self, visit: &mut dyn FnMut(String) -> ControlFlow<()>) -> Result<()> {
        let mut names = NameMap::new();
        for (index, entry) in self.archive.files.iter().enumerate() {
            if entry.is_directory() {
                continue;
            }
            let safe = names.register(entry.name(), index);
            if visit(safe).is_break() {
                break;
            }
        }
        self.names = names;
        Ok(())
    }

    fn extract_one(&mut self, name: &str, destination: &Path) -> Result<()> {
        self.ensure_listed()?;
        let index = *self
            .names
            .original(name)
            .ok_or_else(|| Error::UnknownMember(name.to_owned()))?;

        let Some(folder_index) = self.archive.stream_map.file_folder_index[index] else {
            return write_entry(name, &mut io::empty(), destination);
        };

        let mut result = Err(Error::UnknownMember(name.to_owned()));
        let mut source = self.source()?;
        self.decode_folder(&mut source, folder_index, &mut |file_index, data| {
            if file_index != index {
                skip(data);
                return Ok(true);
            }
            result = write_entry(name, data, destination);
            Ok(false)
        })
        .map_err(|e| Error::entry(name, e))?;
        result
    }

    fn extract_many(
        &mut self,
        entries: &BTreeMap<String, PathBuf>,
        visit: &mut dyn FnMut(BulkOutcome<'_>) -> ControlFlow<()>,
    ) -> Result<()> {
        self.ensure_listed()?;

        let mut wanted: HashMap<usize, (&str, &Path)> = HashMap::new();
        for (name, destination) in entries {
            match self.names.original(name) {
                Some(&index) => {
                    wanted.insert(index, (name.as_str(), destination.as_path()));
                }
                None => {
                    let flow = visit(BulkOutcome::Failed(name, Error::UnknownMember(name.clone())));
                    if flow.is_break() {
                        return Ok(());
                    }
                }
            }
        }

        let file_folders = &self.archive.stream_map.file_folder_index;
        let mut folders: Vec<usize> = wanted.keys().filter_map(|&i| file_folders[i]).collect();
        folders.sort_unstable();
        folders.dedup();
        let mut remaining = wanted.keys().filter(|&&i| file_folders[i].is_some()).count();

        debug!(archive = ?self.path, count = wanted.len(), folders = folders.len(), "Starting 7z pass");
        let mut stopped = false;
        if !folders.is_empty() {
            let mut source = self.source()?;
            for folder_index in folders {
                self.decode_folder(&mut source, folder_index, &mut |file_index, data| {
                    let Some((name, destination)) = wanted.remove(&file_index) else {
                        skip(data);
                        return Ok(true);
                    };
                    remaining -= 1;
                    let outcome = match write_entry(name, data, destination) {
                        Ok(()) => BulkOutcome::Written(name),
                        Err(e) => {
                            skip(data);
                            BulkOutcome::Failed(name, e)
                        }
                    };
                    stopped = visit(outcome).is_break();
                    Ok(!stopped && remaining > 0)
                })
                .map_err(|e| Error::open(&self.path, e))?;
                if stopped || remaining == 0 {
                    break;
                }
            }
        }
        if stopped {
            return Ok(());
        }

        // Members without data live in no folder.
        let mut empty: Vec<(usize, (&str, &Path))> = wanted.into_iter().collect();
        empty.sort_unstable_by_key(|(index, _)| *index);
        for (_, (name, destination)) in empty {
            let outcome = match write_entry(name, &mut io::empty(), destination) {
                Ok(()) => BulkOutcome::Written(name),
                Err(e) => BulkOutcome::Failed(name, e),
            };
            if visit(outcome).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn reopen(&self) -> Result<Box<dyn ArchiveDriver>> {
        Ok(Box::new(SevenZipDriver {
            path: self.path.clone(),
            password: self.password.clone(),
            archive: self.archive.clone(),
            solid: self.solid,
            names: self.names.clone(),
        }))
    }
}
