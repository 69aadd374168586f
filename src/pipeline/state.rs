//! Mutable state of one extraction session.
//!
//! Everything here is guarded by the session mutex, which also backs the
//! readiness condition variable.

use std::collections::HashSet;
use std::time::Instant;

/// Lifecycle of one archive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Listing,
    Listed,
    Extracting,
    Done,
    Stopped,
    /// Listing failed; nothing can be extracted.
    Failed,
}

impl Phase {
    /// Listing finished and the session is still usable.
    pub fn has_contents(self) -> bool {
        matches!(self, Phase::Listed | Phase::Extracting | Phase::Done)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Failed)
    }
}

/// One member to extract, and the name it gets under the destination
/// directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtractRequest {
    pub name: String,
    pub destination_name: String,
}

impl ExtractRequest {
    /// Extract `name` under its own name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            destination_name: name.clone(),
            name,
        }
    }

    pub fn with_destination(name: impl Into<String>, destination_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination_name: destination_name.into(),
        }
    }
}

impl From<&str> for ExtractRequest {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for ExtractRequest {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// What a waiter learns about one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Extraction of this member failed.
    Failed,
    /// The session stopped before the member was written.
    Stopped,
    TimedOut,
}

/// Bookkeeping for one session. Only touched with the session lock held.
#[derive(Debug)]
pub struct ExtractionState {
    pub phase: Phase,
    /// Listed member names in archive order, empty until `Listed`.
    pub contents: Vec<String>,
    /// Selected members not yet written or failed, in request order.
    pub pending: Vec<ExtractRequest>,
    /// Members fully written. Never shrinks during a session.
    pub extracted: HashSet<String>,
    /// Members whose extraction failed since they were last selected.
    pub failed: HashSet<String>,
    /// Set when the extraction pool first starts.
    pub started_at: Option<Instant>,
    /// Extraction thread count chosen for this archive.
    pub workers: usize,
}

impl Default for ExtractionState {
    fn default() -> Self {
        Self {
            phase: Phase::Uninitialized,
            contents: Vec::new(),
            pending: Vec::new(),
            extracted: HashSet::new(),
            failed: HashSet::new(),
            started_at: None,
            workers: 0,
        }
    }
}

impl ExtractionState {
    /// Replace the pending list. Extracted names are dropped, and re-selected
    /// failures get another try.
    pub fn replace_pending(&mut self, requests: Vec<ExtractRequest>) {
        let mut seen = HashSet::new();
        self.pending = requests
            .into_iter()
            .filter(|r| !self.extracted.contains(&r.name))
            .filter(|r| seen.insert(r.name.clone()))
            .collect();
        for request in &self.pending {
            self.failed.remove(&request.name);
        }
    }

    /// Still waiting to be written.
    pub fn is_wanted(&self, name: &str) -> bool {
        !self.extracted.contains(name) && self.pending.iter().any(|r| r.name == name)
    }

    /// Record a written member. Returns false if it was already recorded.
    pub fn mark_extracted(&mut self, name: &str) -> bool {
        self.pending.retain(|r| r.name != name);
        self.failed.remove(name);
        self.extracted.insert(name.to_owned())
    }

    pub fn mark_failed(&mut self, name: &str) {
        self.pending.retain(|r| r.name != name);
        if !self.extracted.contains(name) {
            self.failed.insert(name.to_owned());
        }
    }

    /// Move to `Done` once nothing is pending. Returns true on the transition.
    pub fn settle(&mut self) -> bool {
        if self.phase == Phase::Extracting && self.pending.is_empty() {
            self.phase = Phase::Done;
            return true;
        }
        false
    }

    /// Final answer for a waiter, if there is one yet.
    pub fn readiness(&self, name: &str) -> Option<Readiness> {
        if self.extracted.contains(name) {
            Some(Readiness::Ready)
        } else if self.failed.contains(name) {
            Some(Readiness::Failed)
        } else if self.phase.is_terminal() {
            Some(Readiness::Stopped)
        } else {
            None
        }
    }

    /// No extraction work is left to wait for.
    pub fn is_idle(&self) -> bool {
        match self.phase {
            Phase::Done | Phase::Stopped | Phase::Failed => true,
            Phase::Listed | Phase::Extracting => self.pending.is_empty(),
            Phase::Uninitialized | Phase::Listing => false,
        }
    }
}
