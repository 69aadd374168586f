//! In-memory fake archive for pipeline tests.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Cursor;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::drivers::registry::has_extension;
use crate::drivers::{
    write_entry, ArchiveDriver, ArchiveKind, ArchiveOptions, BulkOutcome, DriverFactory,
    DriverRegistry,
};
use crate::error::{Error, Result};

/// Contents and behaviour of a fake archive, shared with every handle.
#[derive(Default)]
pub struct FakeArchive {
    pub members: Vec<(String, Vec<u8>)>,
    pub solid: bool,
    pub concurrent: bool,
    /// Time spent decoding each member.
    pub delay: Duration,
    pub list_delay: Duration,
    pub fail_listing: bool,
    pub corrupt: HashSet<String>,
    /// Bulk passes return an error after writing this many members.
    pub fail_bulk_after: Option<usize>,
    /// Every member written, in order, across all handles.
    pub decoded: Mutex<Vec<String>>,
    pub bulk_passes: Mutex<usize>,
    pub closed: Mutex<usize>,
}

impl FakeArchive {
    pub fn new(names: &[&str]) -> Self {
        Self {
            members: names
                .iter()
                .map(|n| (n.to_string(), format!("data:{n}").into_bytes()))
                .collect(),
            concurrent: true,
            ..Default::default()
        }
    }

    pub fn solid(mut self) -> Self {
        self.solid = true;
        self.concurrent = false;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    pub fn corrupt(mut self, name: &str) -> Self {
        self.corrupt.insert(name.to_owned());
        self
    }

    pub fn failing_bulk_after(mut self, written: usize) -> Self {
        self.fail_bulk_after = Some(written);
        self
    }

    pub fn failing_listing(mut self) -> Self {
        self.fail_listing = true;
        self
    }

    pub fn expected_content(name: &str) -> Vec<u8> {
        format!("data:{name}").into_bytes()
    }

    fn decode(&self, name: &str, destination: &Path) -> Result<()> {
        thread::sleep(self.delay);
        if self.corrupt.contains(name) {
            return Err(Error::entry(name, "bad checksum"));
        }
        let data = self
            .members
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| Error::UnknownMember(name.to_owned()))?;
        write_entry(name, &mut Cursor::new(data), destination)?;
        self.decoded.lock().push(name.to_owned());
        Ok(())
    }
}

/// Claims files with a `.fake` extension.
pub struct FakeFactory(pub Arc<FakeArchive>);

impl DriverFactory for FakeFactory {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn probe(&self, path: &Path, _header: &[u8]) -> bool {
        has_extension(path, &["fake"])
    }

    fn open(&self, path: &Path, _options: &ArchiveOptions) -> Result<Box<dyn ArchiveDriver>> {
        Ok(Box::new(FakeDriver {
            path: path.to_path_buf(),
            archive: Arc::clone(&self.0),
        }))
    }
}

pub struct FakeDriver {
    path: PathBuf,
    archive: Arc<FakeArchive>,
}

impl ArchiveDriver for FakeDriver {
    fn kind(&self) -> ArchiveKind {
        ArchiveKind::Other("fake")
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn is_solid(&self) -> bool {
        self.archive.solid
    }

    fn supports_concurrent_extraction(&self) -> bool {
        self.archive.concurrent
    }

    fn list(&mut self, visit: &mut dyn FnMut(String) -> ControlFlow<()>) -> Result<()> {
        thread::sleep(self.archive.list_delay);
        if self.archive.fail_listing {
            return Err(Error::open(&self.path, "truncated header"));
        }
        for (name, _) in &self.archive.members {
            if visit(name.clone()).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn extract_one(&mut self, name: &str, destination: &Path) -> Result<()> {
        self.archive.decode(name, destination)
    }

    fn extract_many(
        &mut self,
        entries: &BTreeMap<String, PathBuf>,
        visit: &mut dyn FnMut(BulkOutcome<'_>) -> ControlFlow<()>,
    ) -> Result<()> {
        *self.archive.bulk_passes.lock() += 1;
        let mut written = 0;
        for (name, _) in &self.archive.members {
            let Some((name, destination)) = entries.get_key_value(name) else {
                continue;
            };
            if self.archive.fail_bulk_after == Some(written) {
                return Err(Error::open(&self.path, "corrupt solid block"));
            }
            written += 1;
            let outcome = match self.archive.decode(name, destination) {
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
        Ok(Box::new(FakeDriver {
            path: self.path.clone(),
            archive: Arc::clone(&self.archive),
        }))
    }

    fn close(&mut self) {
        *self.archive.closed.lock() += 1;
    }
}

/// A registry holding only `archive`, plus an empty `book.fake` in `dir`.
pub fn fake_setup(dir: &Path, archive: &Arc<FakeArchive>) -> (DriverRegistry, PathBuf) {
    let path = dir.join("book.fake");
    fs::write(&path, b"").expect("write fake archive");
    let registry = DriverRegistry::empty().with(FakeFactory(Arc::clone(archive)));
    (registry, path)
}
