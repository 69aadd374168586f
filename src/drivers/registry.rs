//! Probe-based driver selection.
//!
//! Each factory looks at the archive's leading bytes (and extension as a
//! fallback). The first factory that claims the file opens it.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, warn};

use super::pdf::PdfFactory;
use super::process::ToolProbe;
use super::sevenzip::SevenZipFactory;
use super::tar::TarFactory;
use super::zip::ZipFactory;
use super::{ArchiveDriver, ArchiveOptions};
use crate::error::{Error, Result};

/// Number of leading bytes handed to probes (covers the tar header).
pub const PROBE_LEN: usize = 512;

/// Capability probe and handle opener for one archive format.
pub trait DriverFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this driver can read the file.
    fn probe(&self, path: &Path, header: &[u8]) -> bool;

    fn open(&self, path: &Path, options: &ArchiveOptions) -> Result<Box<dyn ArchiveDriver>>;
}

/// Ordered list of driver factories.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: Vec<Arc<dyn DriverFactory>>,
}

impl DriverRegistry {
    /// A registry with no drivers.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The shipped drivers. PDF support is only registered when the probe
    /// found MuPDF.
    pub fn with_defaults(probe: &ToolProbe) -> Self {
        let mut registry = Self::empty()
            .with(ZipFactory)
            .with(SevenZipFactory)
            .with(TarFactory);
        if let Some(mupdf) = probe.mupdf() {
            registry = registry.with(PdfFactory::new(mupdf.clone()));
        }
        registry
    }

    /// Append a factory; earlier factories win.
    pub fn with<F: DriverFactory + 'static>(mut self, factory: F) -> Self {
        self.register(Arc::new(factory));
        self
    }

    pub fn register(&mut self, factory: Arc<dyn DriverFactory>) {
        debug!(driver = factory.name(), "Registered archive driver");
        self.factories.push(factory);
    }

    pub fn driver_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Find the factory that claims `path`.
    pub fn find(&self, path: &Path) -> Result<Arc<dyn DriverFactory>> {
        let header = read_header(path)?;
        self.factories
            .iter()
            .find(|f| f.probe(path, &header))
            .cloned()
            .ok_or_else(|| {
                warn!(?path, "Non-supported archive format");
                Error::UnsupportedFormat {
                    path: path.to_path_buf(),
                }
            })
    }

    /// Open `path` with the first driver whose probe succeeds.
    pub fn open(&self, path: &Path, options: &ArchiveOptions) -> Result<Box<dyn ArchiveDriver>> {
        let factory = self.find(path)?;
        debug!(?path, driver = factory.name(), "Opening archive");
        factory.open(path, options)
    }
}

fn read_header(path: &Path) -> Result<Vec<u8>> {
    let file = File::open(path).map_err(|e| Error::open(path, e))?;
    let mut header = Vec::with_capacity(PROBE_LEN);
    file.take(PROBE_LEN as u64)
        .read_to_end(&mut header)
        .map_err(|e| Error::open(path, e))?;
    Ok(header)
}

/// Case-insensitive extension check used as a probe fallback.
pub(crate) fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_ascii_lowercase())
        .unwrap_or_default();
    extensions
        .iter()
        .any(|ext| name.ends_with(&format!(".{ext}")))
}
