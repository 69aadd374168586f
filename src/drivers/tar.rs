//! TAR / CBT driver, optionally gzip or xz compressed.
//!
//! Tar is a sequential format: every operation re-reads the stream from the
//! start, so it is treated as solid and extracted in one ordered pass.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::{debug, trace};
use xz2::read::XzDecoder;

use super::names::NameMap;
use super::registry::{has_extension, DriverFactory};
use super::{write_entry, ArchiveDriver, ArchiveKind, ArchiveOptions, BulkOutcome};
use crate::error::{Error, Result};

const GZIP_MAGIC: &[u8] = &[0x1F, 0x8B];
const XZ_MAGIC: &[u8] = &[0xFD, 0x37, 0x7A, 0x58, 0x5A, 0x00];

/// Outer compression of a tar stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    None,
    Gzip,
    Xz,
}

impl TarCompression {
    /// Detect from the leading bytes, falling back to the extension.
    pub fn detect(path: &Path, header: &[u8]) -> Option<Self> {
        if header.starts_with(GZIP_MAGIC) {
            Some(Self::Gzip)
        } else if header.starts_with(XZ_MAGIC) {
            Some(Self::Xz)
        } else if is_tar_header(header) || has_extension(path, &["tar", "cbt"]) {
            Some(Self::None)
        } else {
            None
        }
    }
}

fn is_tar_header(data: &[u8]) -> bool {
    data.len() >= 263 && data[257..262] == *b"ustar"
}

pub struct TarFactory;

impl DriverFactory for TarFactory {
    fn name(&self) -> &'static str {
        "tar"
    }

    fn probe(&self, path: &Path, header: &[u8]) -> bool {
        TarCompression::detect(path, header).is_some()
    }

    fn open(&self, path: &Path, _options: &ArchiveOptions) -> Result<Box<dyn ArchiveDriver>> {
        let mut header = Vec::new();
        File::open(path)
            .and_then(|f| f.take(super::registry::PROBE_LEN as u64).read_to_end(&mut header))
            .map_err(|e| Error::open(path, e))?;
        let compression = TarCompression::detect(path, &header)
            .ok_or_else(|| Error::UnsupportedFormat {
                path: path.to_path_buf(),
            })?;
        Ok(Box::new(TarDriver::new(path, compression)))
    }
}

pub struct TarDriver {
    path: PathBuf,
    compression: TarCompression,
    names: NameMap<Vec<u8>>,
}

impl TarDriver {
    pub fn new(path: &Path, compression: TarCompression) -> Self {
        Self {
            path: path.to_path_buf(),
            compression,
            names: NameMap::new(),
        }
    }

    fn stream(&self) -> Result<tar::Archive<Box<dyn Read>>> {
        let file = BufReader::new(File::open(&self.path).map_err(|e| Error::open(&self.path, e))?);
        let reader: Box<dyn Read> = match self.compression {
            TarCompression::None => Box::new(file),
            TarCompression::Gzip => Box::new(GzDecoder::new(file)),
            TarCompression::Xz => Box::new(XzDecoder::new(file)),
        };
        Ok(tar::Archive::new(reader))
    }

    fn ensure_listed(&mut self) -> Result<()> {
        if self.names.is_empty() {
            self.list(&mut |_| ControlFlow::Continue(()))?;
        }
        Ok(())
    }
}

impl ArchiveDriver for TarDriver {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Tar
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn is_solid(&self) -> bool {
        true
    }

    fn supports_concurrent_extraction(&self) -> bool {
        false
    }

    fn list(&mut self, visit: &mut dyn FnMut(String) -> ControlFlow<()>) -> Result<()> {
        let mut archive = self.stream()?;
        let mut names = NameMap::new();
        for entry in archive.entries()? {
            let entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let raw = entry.path_bytes().into_owned();
            let display = String::from_utf8_lossy(&raw).into_owned();
            let safe = names.register(&display, raw);
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

        let mut archive = self.stream()?;
        for entry in archive.entries()? {
            let mut entry = entry.map_err(|e| Error::entry(name, e))?;
            if *entry.path_bytes() == *raw.as_slice() {
                return write_entry(name, &mut entry, destination);
            }
        }
        Err(Error::UnknownMember(name.to_owned()))
    }

    fn extract_many(
        &mut self,
        entries: &BTreeMap<String, PathBuf>,
        visit: &mut dyn FnMut(BulkOutcome<'_>) -> ControlFlow<()>,
    ) -> Result<()> {
        self.ensure_listed()?;

        let mut wanted: HashMap<Vec<u8>, (&str, &PathBuf)> = HashMap::new();
        for (name, destination) in entries {
            match self.names.original(name) {
                Some(raw) => {
                    wanted.insert(raw.clone(), (name.as_str(), destination));
                }
                None => {
                    let flow = visit(BulkOutcome::Failed(name, Error::UnknownMember(name.clone())));
                    if flow.is_break() {
                        return Ok(());
                    }
                }
            }
        }

        debug!(archive = ?self.path, count = wanted.len(), "Starting tar pass");
        let mut archive = self.stream()?;
        for entry in archive.entries()? {
            if wanted.is_empty() {
                break;
            }
            let mut entry = entry?;
            let Some((name, destination)) = wanted.remove(&*entry.path_bytes()) else {
                continue;
            };
            trace!(name, "Extracting tar member");
            let outcome = match write_entry(name, &mut entry, destination) {
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
        Ok(Box::new(TarDriver {
            path: self.path.clone(),
            compression: self.compression,
            names: self.names.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn list_all(driver: &mut dyn ArchiveDriver) -> Vec<String> {
        let mut names = Vec::new();
        driver
            .list(&mut |name| {
                names.push(name);
                ControlFlow::Continue(())
            })
            .unwrap();
        names
    }

    #[test]
    fn test_detect_compression() {
        assert_eq!(
            TarCompression::detect(Path::new("a.bin"), &[0x1F, 0x8B, 0x08]),
            Some(TarCompression::Gzip)
        );
        assert_eq!(
            TarCompression::detect(Path::new("a.bin"), XZ_MAGIC),
            Some(TarCompression::Xz)
        );
        assert_eq!(
            TarCompression::detect(Path::new("a.cbt"), b""),
            Some(TarCompression::None)
        );
        assert_eq!(TarCompression::detect(Path::new("a.txt"), b"hello"), None);
    }

    #[test]
    fn test_ustar_header_is_detected() {
        let data = tar_bytes(&[("a.png", b"a")]);
        assert_eq!(
            TarCompression::detect(Path::new("noext"), &data[..512]),
            Some(TarCompression::None)
        );
    }

    #[test]
    fn test_extract_many_follows_archive_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.cbt");
        fs::write(
            &path,
            tar_bytes(&[("c.png", b"c"), ("a.png", b"a"), ("b.png", b"b")]),
        )
        .unwrap();

        let mut driver = TarDriver::new(&path, TarCompression::None);
        assert_eq!(list_all(&mut driver), vec!["c.png", "a.png", "b.png"]);
        assert!(driver.is_solid());

        let entries: BTreeMap<String, PathBuf> = ["a.png", "b.png", "c.png"]
            .iter()
            .map(|n| (n.to_string(), dir.path().join("out").join(n)))
            .collect();

        let mut order = Vec::new();
        driver
            .extract_many(&entries, &mut |outcome| {
                if let BulkOutcome::Written(name) = outcome {
                    order.push(name.to_string());
                }
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(order, vec!["c.png", "a.png", "b.png"]);
        assert_eq!(fs::read(dir.path().join("out/a.png")).unwrap(), b"a");
    }

    #[test]
    fn test_extract_many_stops_on_break() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.tar");
        fs::write(&path, tar_bytes(&[("1.png", b"1"), ("2.png", b"2")])).unwrap();

        let mut driver = TarDriver::new(&path, TarCompression::None);
        let entries: BTreeMap<String, PathBuf> = ["1.png", "2.png"]
            .iter()
            .map(|n| (n.to_string(), dir.path().join(n)))
            .collect();

        let mut seen = 0;
        driver
            .extract_many(&entries, &mut |_| {
                seen += 1;
                ControlFlow::Break(())
            })
            .unwrap();

        assert_eq!(seen, 1);
        assert!(dir.path().join("1.png").exists());
        assert!(!dir.path().join("2.png").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_member_is_listed_lossily() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.tar");
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, OsStr::from_bytes(b"p\xE4ge.png"), &b"page"[..])
            .unwrap();
        fs::write(&path, builder.into_inner().unwrap()).unwrap();

        let mut driver = TarDriver::new(&path, TarCompression::None);
        let names = list_all(&mut driver);
        assert_eq!(names, vec!["p\u{FFFD}ge.png"]);

        let dest = dir.path().join("page.png");
        driver.extract_one(&names[0], &dest).unwrap();
        assert_eq!(fs::read(dest).unwrap(), b"page");
    }

    #[test]
    fn test_gzip_extract_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.tar.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&tar_bytes(&[("x/1.png", b"first"), ("x/2.png", b"second")]))
            .unwrap();
        fs::write(&path, encoder.finish().unwrap()).unwrap();

        let factory = TarFactory;
        let mut driver = factory.open(&path, &ArchiveOptions::default()).unwrap();
        let dest = dir.path().join("2.png");
        driver.extract_one("x/2.png", &dest).unwrap();
        assert_eq!(fs::read(dest).unwrap(), b"second");
    }
}
