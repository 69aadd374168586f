//! Concurrent extraction pipeline.
//!
//! This module provides:
//! - `WorkerPool` - Bounded OS-thread pool over an ordered, replaceable backlog
//! - `Extractor` - Per-archive listing/extraction lifecycle
//! - `ReadyHandle` - Blocking waits on individual members
//! - `EventHub` - Callback and channel delivery of extractor events

pub mod events;
pub mod extractor;
pub mod pool;
pub mod state;

pub use events::{EventHub, ExtractorEvent};
pub use extractor::{Extractor, ExtractorBuilder, ReadyHandle};
pub use pool::{StopSignal, WorkerPool};
pub use state::{ExtractRequest, ExtractionState, Phase, Readiness};
