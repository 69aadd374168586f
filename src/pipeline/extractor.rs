//! Listing and extraction of one archive at a time.
//!
//! A session owns two worker pools: a single-thread listing pool and, once
//! extraction begins, an extraction pool sized by archive structure. All
//! mutable state sits behind one mutex whose condition variable wakes
//! readiness waiters.

use std::collections::{BTreeMap, HashMap};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

use super::events::{EventHub, ExtractorEvent};
use super::pool::{StopSignal, WorkerPool};
use super::state::{ExtractRequest, ExtractionState, Phase, Readiness};
use crate::config::ExtractorConfig;
use crate::drivers::names::resolve_destination;
use crate::drivers::process::ToolProbe;
use crate::drivers::{ArchiveDriver, ArchiveKind, BulkOutcome, DriverRegistry};
use crate::error::{Error, Result};

/// One unit of extraction work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ExtractJob {
    Single(ExtractRequest),
    /// Everything pending in a solid archive, decoded in one pass.
    Batch(Vec<ExtractRequest>),
}

struct HandleSlots {
    /// Handle used for listing, and the template for `reopen`.
    origin: Option<Box<dyn ArchiveDriver>>,
    idle: Vec<Box<dyn ArchiveDriver>>,
    closed: bool,
}

struct Shared {
    archive: PathBuf,
    destination: PathBuf,
    kind: ArchiveKind,
    solid: bool,
    concurrent: bool,
    encrypted: bool,
    state: Mutex<ExtractionState>,
    changed: Condvar,
    handles: Mutex<HandleSlots>,
    events: Arc<EventHub>,
}

impl Shared {
    fn checkout(&self) -> Result<Box<dyn ArchiveDriver>> {
        let mut handles = self.handles.lock();
        if handles.closed {
            return Err(Error::open(&self.archive, "archive is closed"));
        }
        if let Some(driver) = handles.idle.pop() {
            return Ok(driver);
        }
        match &handles.origin {
            Some(origin) => origin.reopen(),
            None => Err(Error::open(&self.archive, "archive handle is busy")),
        }
    }

    fn checkin(&self, mut driver: Box<dyn ArchiveDriver>) {
        let mut handles = self.handles.lock();
        if handles.closed {
            driver.close();
        } else {
            handles.idle.push(driver);
        }
    }

    fn return_origin(&self, mut driver: Box<dyn ArchiveDriver>) {
        let mut handles = self.handles.lock();
        if handles.closed {
            driver.close();
        } else {
            handles.origin = Some(driver);
        }
    }

    fn complete(&self, request: &ExtractRequest) {
        {
            let mut state = self.state.lock();
            if !state.mark_extracted(&request.name) {
                return;
            }
            trace!(name = %request.name, "Archive member ready");
            if state.settle() {
                self.log_summary(&state);
            }
            self.changed.notify_all();
        }
        self.events.emit(ExtractorEvent::FileReady {
            name: request.name.clone(),
            destination_name: request.destination_name.clone(),
        });
    }

    fn fail(&self, name: &str, e: &Error) {
        error!(archive = ?self.archive, name, error = %e, "Failed to extract archive member");
        let mut state = self.state.lock();
        state.mark_failed(name);
        if state.settle() {
            self.log_summary(&state);
        }
        self.changed.notify_all();
    }

    fn log_summary(&self, state: &ExtractionState) {
        let elapsed = state.started_at.map(|t| t.elapsed()).unwrap_or_default();
        info!(
            archive = ?self.archive,
            files = state.extracted.len(),
            failed = state.failed.len(),
            structure = if self.solid { "solid" } else { "normal" },
            encryption = if self.encrypted { "encrypted" } else { "clear" },
            elapsed = ?elapsed,
            workers = state.workers,
            "Extraction finished"
        );
    }

    fn wait<R>(
        &self,
        timeout: Duration,
        check: impl Fn(&ExtractionState) -> Option<R>,
    ) -> Option<R> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state: MutexGuard<'_, ExtractionState> = self.state.lock();
        loop {
            if let Some(result) = check(&*state) {
                return Some(result);
            }
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out() {
                        return check(&*state);
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
    }
}

/// Wait handle for one session, returned by [`Extractor::setup`].
#[derive(Clone)]
pub struct ReadyHandle {
    shared: Arc<Shared>,
}

impl ReadyHandle {
    /// Canonical path of the archive this session opened.
    pub fn archive(&self) -> &Path {
        &self.shared.archive
    }

    /// Absolute directory members are written under.
    pub fn destination(&self) -> &Path {
        &self.shared.destination
    }

    /// Current phase of this session, even after the extractor moved on.
    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.shared.state.lock().extracted.contains(name)
    }

    /// Block until `name` is written, fails, or the session stops.
    pub fn wait_for(&self, name: &str, timeout: Duration) -> Readiness {
        self.shared
            .wait(timeout, |state| state.readiness(name))
            .unwrap_or(Readiness::TimedOut)
    }

    /// Block until listing completes. `None` if it failed, was stopped or
    /// timed out.
    pub fn wait_for_listing(&self, timeout: Duration) -> Option<Vec<String>> {
        self.shared
            .wait(timeout, |state| {
                if state.phase.has_contents() {
                    Some(Some(state.contents.clone()))
                } else if state.phase.is_terminal() {
                    Some(None)
                } else {
                    None
                }
            })
            .flatten()
    }

    /// Block until nothing is pending. Returns false on timeout.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        self.shared
            .wait(timeout, |state| state.is_idle().then_some(()))
            .is_some()
    }
}

struct Session {
    shared: Arc<Shared>,
    listing: Arc<WorkerPool<()>>,
    extraction: Option<Arc<WorkerPool<ExtractJob>>>,
}

/// Concurrent extractor for one archive at a time.
pub struct Extractor {
    registry: DriverRegistry,
    config: ExtractorConfig,
    events: Arc<EventHub>,
    session: Mutex<Option<Session>>,
}

impl Extractor {
    pub fn new(registry: DriverRegistry, config: ExtractorConfig) -> Self {
        Self {
            registry,
            config,
            events: Arc::new(EventHub::new()),
            session: Mutex::new(None),
        }
    }

    pub fn builder() -> ExtractorBuilder {
        ExtractorBuilder::new()
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Open `archive` and start listing it in the background.
    ///
    /// Any previous session is closed first. Files are written under
    /// `destination`.
    pub fn setup(
        &self,
        archive: impl AsRef<Path>,
        destination: impl AsRef<Path>,
    ) -> Result<ReadyHandle> {
        let archive = archive.as_ref();
        let archive = archive
            .canonicalize()
            .map_err(|e| Error::open(archive, e))?;
        let destination = absolute(destination.as_ref())?;
        let driver = self
            .registry
            .open(&archive, &self.config.archive_options())?;

        self.close();

        let shared = Arc::new(Shared {
            kind: driver.kind(),
            solid: driver.is_solid(),
            concurrent: driver.supports_concurrent_extraction(),
            encrypted: self.config.password.is_some(),
            archive,
            destination,
            state: Mutex::new(ExtractionState {
                phase: Phase::Listing,
                ..Default::default()
            }),
            changed: Condvar::new(),
            handles: Mutex::new(HandleSlots {
                origin: Some(driver),
                idle: Vec::new(),
                closed: false,
            }),
            events: Arc::clone(&self.events),
        });
        debug!(
            archive = ?shared.archive,
            destination = ?shared.destination,
            kind = %shared.kind,
            solid = shared.solid,
            "Archive set up"
        );

        let listing = {
            let shared = Arc::clone(&shared);
            WorkerPool::start("idxd-list", 1, true, move |(), stop: &StopSignal| {
                run_listing(&shared, stop)
            })
        };
        listing.append(());

        *self.session.lock() = Some(Session {
            shared: Arc::clone(&shared),
            listing: Arc::new(listing),
            extraction: None,
        });
        Ok(ReadyHandle { shared })
    }

    /// Member names in archive order; empty until listing completes.
    pub fn get_contents(&self) -> Vec<String> {
        self.with_state(|state| state.contents.clone())
            .unwrap_or_default()
    }

    /// Names still waiting to be extracted, in request order.
    pub fn get_files(&self) -> Vec<String> {
        self.with_state(|state| state.pending.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get_directory(&self) -> Option<PathBuf> {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.shared.destination.clone())
    }

    pub fn phase(&self) -> Phase {
        self.with_state(|state| state.phase)
            .unwrap_or(Phase::Uninitialized)
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.with_state(|state| state.extracted.contains(name))
            .unwrap_or(false)
    }

    /// True while an extraction job is queued or running.
    ///
    /// Once this turns false with members still pending, nothing will
    /// extract them until the next `select` or `begin_extraction`.
    pub fn is_extracting(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .and_then(|s| s.extraction.as_ref())
            .is_some_and(|pool| pool.is_busy())
    }

    /// Set the ordered list of members to extract.
    ///
    /// Ignored before listing completes. Already extracted names are
    /// dropped. When extraction is running the queued work is re-planned.
    pub fn select<I, R>(&self, files: I)
    where
        I: IntoIterator<Item = R>,
        R: Into<ExtractRequest>,
    {
        let guard = self.session.lock();
        let Some(session) = guard.as_ref() else {
            return;
        };
        {
            let mut state = session.shared.state.lock();
            if !state.phase.has_contents() {
                debug!(phase = ?state.phase, "Ignoring selection before listing completed");
                return;
            }
            state.replace_pending(files.into_iter().map(Into::into).collect());
            trace!(pending = state.pending.len(), "Selection updated");
            if state.settle() {
                session.shared.log_summary(&state);
            }
            session.shared.changed.notify_all();
        }
        if session.extraction.is_some() {
            plan(session);
        }
    }

    /// Start (or re-plan) extraction of the selected members.
    pub fn begin_extraction(&self) {
        let mut guard = self.session.lock();
        let Some(session) = guard.as_mut() else {
            return;
        };
        if !session.shared.state.lock().phase.has_contents() {
            debug!("Ignoring extraction request before listing completed");
            return;
        }

        if session.extraction.is_none() {
            let shared = &session.shared;
            let workers = if shared.concurrent && !shared.solid {
                self.config.workers()
            } else {
                1
            };
            {
                let mut state = shared.state.lock();
                state.started_at = Some(Instant::now());
                state.workers = workers;
            }
            debug!(archive = ?shared.archive, workers, solid = shared.solid, "Starting extraction");

            let worker_shared = Arc::clone(shared);
            let pool = WorkerPool::start("idxd-extract", workers, true, move |job, stop: &StopSignal| {
                run_extraction(&worker_shared, job, stop)
            });
            session.extraction = Some(Arc::new(pool));
        }
        plan(session);
    }

    /// Stop listing and extraction. Files already written stay on disk.
    pub fn stop(&self) {
        let (shared, listing, extraction) = {
            let guard = self.session.lock();
            let Some(session) = guard.as_ref() else {
                return;
            };
            (
                Arc::clone(&session.shared),
                Arc::clone(&session.listing),
                session.extraction.clone(),
            )
        };

        {
            let mut state = shared.state.lock();
            if state.phase != Phase::Failed {
                state.phase = Phase::Stopped;
            }
            shared.changed.notify_all();
        }
        listing.stop();
        if let Some(extraction) = extraction {
            extraction.stop();
        }
        debug!(archive = ?shared.archive, "Extraction stopped");
    }

    /// Stop and release the archive handles.
    pub fn close(&self) {
        self.stop();
        let Some(session) = self.session.lock().take() else {
            return;
        };
        let mut handles = session.shared.handles.lock();
        handles.closed = true;
        if let Some(mut origin) = handles.origin.take() {
            origin.close();
        }
        for mut driver in handles.idle.drain(..) {
            driver.close();
        }
        debug!(archive = ?session.shared.archive, "Archive closed");
    }

    pub fn on_listing_complete<F>(&self, callback: F)
    where
        F: Fn(&[String]) + Send + Sync + 'static,
    {
        self.events.on_listing_complete(callback);
    }

    /// `callback(name, destination_name)` runs on an extraction thread.
    pub fn on_file_ready<F>(&self, callback: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.events.on_file_ready(callback);
    }

    pub fn subscribe(&self) -> flume::Receiver<ExtractorEvent> {
        self.events.subscribe()
    }

    fn with_state<R>(&self, read: impl FnOnce(&ExtractionState) -> R) -> Option<R> {
        let guard = self.session.lock();
        let session = guard.as_ref()?;
        let state = session.shared.state.lock();
        Some(read(&*state))
    }
}

impl Drop for Extractor {
    fn drop(&mut self) {
        self.close();
    }
}

/// Replace queued extraction work with the current pending list.
fn plan(session: &Session) {
    let Some(pool) = &session.extraction else {
        return;
    };
    let shared = &session.shared;
    let pending = {
        let mut state = shared.state.lock();
        if !state.phase.has_contents() {
            return;
        }
        state.phase = Phase::Extracting;
        if state.settle() {
            shared.log_summary(&state);
            shared.changed.notify_all();
            return;
        }
        state.pending.clone()
    };

    pool.clear();
    if shared.solid {
        let mut batch = pending;
        batch.sort_by(|a, b| a.name.cmp(&b.name));
        pool.append(ExtractJob::Batch(batch));
    } else {
        pool.extend(pending.into_iter().map(ExtractJob::Single));
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn run_listing(shared: &Shared, stop: &StopSignal) -> anyhow::Result<()> {
    let mut driver = shared
        .handles
        .lock()
        .origin
        .take()
        .context("Archive handle is not available for listing")?;

    let started = Instant::now();
    let mut contents = Vec::new();
    let listed = driver.list(&mut |name| {
        if stop.must_stop() {
            return ControlFlow::Break(());
        }
        contents.push(name);
        ControlFlow::Continue(())
    });
    shared.return_origin(driver);

    if let Err(e) = listed {
        let mut state = shared.state.lock();
        if state.phase == Phase::Listing {
            state.phase = Phase::Failed;
        }
        shared.changed.notify_all();
        return Err(e).with_context(|| format!("Failed to list {}", shared.archive.display()));
    }

    {
        let mut state = shared.state.lock();
        if state.phase != Phase::Listing {
            debug!(phase = ?state.phase, "Listing interrupted");
            return Ok(());
        }
        state.contents = contents.clone();
        state.phase = Phase::Listed;
        shared.changed.notify_all();
    }
    debug!(
        archive = ?shared.archive,
        files = contents.len(),
        elapsed = ?started.elapsed(),
        "Listing complete"
    );
    shared
        .events
        .emit(ExtractorEvent::ListingComplete { contents });
    Ok(())
}

fn run_extraction(shared: &Shared, job: ExtractJob, stop: &StopSignal) -> anyhow::Result<()> {
    match job {
        ExtractJob::Single(request) => {
            extract_single(shared, request, stop);
            Ok(())
        }
        ExtractJob::Batch(requests) => extract_batch(shared, requests, stop),
    }
}

fn extract_single(shared: &Shared, request: ExtractRequest, stop: &StopSignal) {
    if stop.must_stop() || !shared.state.lock().is_wanted(&request.name) {
        return;
    }
    let destination = match resolve_destination(&shared.destination, &request.destination_name) {
        Ok(path) => path,
        Err(e) => return shared.fail(&request.name, &e),
    };
    let mut driver = match shared.checkout() {
        Ok(driver) => driver,
        Err(e) => return shared.fail(&request.name, &e),
    };

    trace!(name = %request.name, ?destination, "Extracting archive member");
    match driver.extract_one(&request.name, &destination) {
        Ok(()) => shared.complete(&request),
        Err(e) => shared.fail(&request.name, &e),
    }
    shared.checkin(driver);
}

fn extract_batch(
    shared: &Shared,
    requests: Vec<ExtractRequest>,
    stop: &StopSignal,
) -> anyhow::Result<()> {
    let wanted: Vec<ExtractRequest> = {
        let state = shared.state.lock();
        requests
            .into_iter()
            .filter(|r| state.is_wanted(&r.name))
            .collect()
    };

    let mut entries = BTreeMap::new();
    let mut requests_by_name = HashMap::new();
    for request in wanted {
        match resolve_destination(&shared.destination, &request.destination_name) {
            Ok(path) => {
                entries.insert(request.name.clone(), path);
                requests_by_name.insert(request.name.clone(), request);
            }
            Err(e) => shared.fail(&request.name, &e),
        }
    }
    if entries.is_empty() {
        trace!("Nothing left to extract in batch");
        return Ok(());
    }

    let mut driver = shared.checkout()?;
    debug!(archive = ?shared.archive, count = entries.len(), "Extracting solid batch");
    let result = driver.extract_many(&entries, &mut |outcome| {
        match outcome {
            BulkOutcome::Written(name) => {
                if let Some(request) = requests_by_name.get(name) {
                    shared.complete(request);
                }
            }
            BulkOutcome::Failed(name, e) => shared.fail(name, &e),
        }
        if stop.must_stop() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });

    match result {
        Ok(()) => {
            shared.checkin(driver);
            Ok(())
        }
        Err(e) => {
            driver.close();
            Err(e).with_context(|| format!("Bulk extraction from {} failed", shared.archive.display()))
        }
    }
}

/// Builder for [`Extractor`].
pub struct ExtractorBuilder {
    config: ExtractorConfig,
    registry: Option<DriverRegistry>,
}

impl ExtractorBuilder {
    pub fn new() -> Self {
        Self {
            config: ExtractorConfig::default(),
            registry: None,
        }
    }

    pub fn config(mut self, config: ExtractorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, count: usize) -> Self {
        self.config.max_extract_workers = count;
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    pub fn registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Without an explicit registry the shipped drivers are used, with
    /// external tools probed once per process.
    pub fn build(self) -> Extractor {
        let registry = self
            .registry
            .unwrap_or_else(|| DriverRegistry::with_defaults(ToolProbe::shared()));
        Extractor::new(registry, self.config)
    }
}

impl Default for ExtractorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
