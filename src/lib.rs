//! Concurrent archive extraction for image viewers.
//!
//! An [`Extractor`] lists an archive in the background, then extracts a
//! caller-ordered subset of its members with a worker count that depends on
//! whether the archive is solid. Callers block on individual members through
//! a [`ReadyHandle`] or receive [`ExtractorEvent`]s.

pub mod config;
pub mod drivers;
pub mod error;
pub mod pipeline;

#[cfg(test)]
mod testing;

pub use config::ExtractorConfig;
pub use drivers::process::ToolProbe;
pub use drivers::{ArchiveDriver, ArchiveKind, ArchiveOptions, DriverFactory, DriverRegistry};
pub use error::{Error, Result};
pub use pipeline::{
    ExtractRequest, Extractor, ExtractorBuilder, ExtractorEvent, Phase, ReadyHandle, Readiness,
};
