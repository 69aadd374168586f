//! Extractor configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::ProjectDirs;
use xxhash_rust::xxh3::xxh3_64;

use crate::drivers::ArchiveOptions;

/// Default number of extraction workers for non-solid archives.
pub const DEFAULT_EXTRACT_WORKERS: usize = 4;

/// Maximum number of extraction workers.
pub const MAX_EXTRACT_WORKERS: usize = 16;

/// Environment variable overriding the worker count.
pub const WORKERS_ENV: &str = "IDXD_EXTRACT_WORKERS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Upper bound on extraction threads; solid archives always use one.
    pub max_extract_workers: usize,
    /// Password for encrypted archives.
    pub password: Option<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            max_extract_workers: DEFAULT_EXTRACT_WORKERS,
            password: None,
        }
    }
}

impl ExtractorConfig {
    /// Defaults, with the worker count taken from `IDXD_EXTRACT_WORKERS`
    /// when it is set to a number.
    pub fn from_env() -> Self {
        Self::default().with_workers_override(std::env::var(WORKERS_ENV).ok().as_deref())
    }

    fn with_workers_override(mut self, value: Option<&str>) -> Self {
        if let Some(workers) = value.and_then(|v| v.trim().parse::<usize>().ok()) {
            self.max_extract_workers = workers;
        }
        self
    }

    /// Worker count clamped to `1..=MAX_EXTRACT_WORKERS`.
    pub fn workers(&self) -> usize {
        self.max_extract_workers.clamp(1, MAX_EXTRACT_WORKERS)
    }

    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            password: self.password.clone(),
        }
    }

    /// Per-archive scratch directory under the user cache dir.
    pub fn scratch_dir_for(archive: &Path) -> Result<PathBuf> {
        let proj_dirs =
            ProjectDirs::from("", "", "idxd").context("Failed to determine project directories")?;
        Ok(scratch_dir_in(proj_dirs.cache_dir(), archive))
    }
}

fn scratch_dir_in(cache_dir: &Path, archive: &Path) -> PathBuf {
    let hash = xxh3_64(archive.as_os_str().as_encoded_bytes());
    cache_dir.join("archives").join(format!("{hash:016x}"))
}
