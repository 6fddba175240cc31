use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogStore;
use crate::convert::{Converter, locate_image};
use crate::domain::{BatchMode, EntryFilter, EntryId, LinkEntry, Stage};
use crate::error::GamelibError;
use crate::events::{CancelToken, EventSink, PipelineEvent, ProgressGate};
use crate::fs_util::remove_path;
use crate::place::place;
use crate::planner::{Batch, plan, select};
use crate::store::{WorkingPaths, Workspace};
use crate::transfer::Transfer;
use crate::unpack;

const RETRY_BASE_DELAY_MS: u64 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    pub convert_iso: bool,
    pub overwrite: bool,
    pub transfer_retries: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            convert_iso: true,
            overwrite: false,
            transfer_retries: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryOutcome {
    Placed,
    Failed { stage: Stage, message: String },
    Cancelled { stage: Stage },
}

/// Outcome of one entry in one run. Logged and summarized, never persisted
/// as such.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    pub id: EntryId,
    pub stage_reached: Stage,
    pub outcome: EntryOutcome,
    pub bytes_transferred: u64,
}

impl PipelineResult {
    pub fn is_placed(&self) -> bool {
        matches!(self.outcome, EntryOutcome::Placed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub index: usize,
    pub placed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub not_started: usize,
    pub bytes_transferred: u64,
    pub results: Vec<PipelineResult>,
}

impl BatchSummary {
    fn record(&mut self, result: PipelineResult) {
        match result.outcome {
            EntryOutcome::Placed => self.placed += 1,
            EntryOutcome::Failed { .. } => self.failed += 1,
            EntryOutcome::Cancelled { .. } => self.cancelled += 1,
        }
        self.bytes_transferred += result.bytes_transferred;
        self.results.push(result);
    }

    /// Failed entries with their recorded cause, in processing order.
    pub fn failures(&self) -> impl Iterator<Item = (&EntryId, &str)> {
        self.results.iter().filter_map(|result| match &result.outcome {
            EntryOutcome::Failed { message, .. } => Some((&result.id, message.as_str())),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub batches: Vec<BatchSummary>,
    pub placed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub not_started: usize,
    pub bytes_transferred: u64,
}

impl RunSummary {
    fn absorb(&mut self, batch: BatchSummary) {
        self.placed += batch.placed;
        self.failed += batch.failed;
        self.cancelled += batch.cancelled;
        self.not_started += batch.not_started;
        self.bytes_transferred += batch.bytes_transferred;
        self.batches.push(batch);
    }

    pub fn processed(&self) -> usize {
        self.placed + self.failed + self.cancelled
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeSummary {
    pub probed: usize,
    pub recorded: usize,
    pub unavailable: usize,
}

struct EntryProgress {
    stage: Stage,
    bytes: u64,
}

/// Drives catalog entries through transfer, unpack, conversion and
/// placement, persisting each completed stage before starting the next.
pub struct Pipeline<T: Transfer, C: Converter> {
    catalog: CatalogStore,
    workspace: Workspace,
    options: PipelineOptions,
    transfer: T,
    converter: C,
}

impl<T: Transfer, C: Converter> Pipeline<T, C> {
    pub fn new(
        catalog: CatalogStore,
        workspace: Workspace,
        options: PipelineOptions,
        transfer: T,
        converter: C,
    ) -> Self {
        Self {
            catalog,
            workspace,
            options,
            transfer,
            converter,
        }
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Plans the catalog and runs every batch in order. Fails only when the
    /// catalog cannot be read or the working roots cannot be created; entry
    /// failures end up in the summary.
    pub fn run(
        &self,
        filter: &EntryFilter,
        mode: BatchMode,
        budget: u64,
        sink: &dyn EventSink,
        cancel: &CancelToken,
    ) -> Result<RunSummary, GamelibError> {
        let entries = self.catalog.load()?;
        self.workspace.ensure_roots()?;
        let batches = plan(&entries, filter, mode, budget);
        let total_entries = batches.iter().map(Batch::len).sum();
        info!(
            batches = batches.len(),
            entries = total_entries,
            mode = %mode,
            "run planned"
        );
        sink.event(PipelineEvent::RunStarted {
            batches: batches.len(),
            entries: total_entries,
        });

        let mut summary = RunSummary::default();
        for (offset, batch) in batches.iter().enumerate() {
            if cancel.is_cancelled() {
                let skipped: usize = batches[offset..].iter().map(Batch::len).sum();
                info!(skipped, "run cancelled, remaining batches skipped");
                summary.not_started += skipped;
                break;
            }
            let batch_summary = self.run_batch(offset + 1, batches.len(), batch, sink, cancel);
            summary.absorb(batch_summary);
        }
        info!(
            placed = summary.placed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            not_started = summary.not_started,
            bytes = summary.bytes_transferred,
            "run finished"
        );
        Ok(summary)
    }

    /// Processes one batch sequentially. A failing entry never stops the
    /// batch; cancellation stops accepting new entries.
    pub fn run_batch(
        &self,
        index: usize,
        total: usize,
        batch: &Batch,
        sink: &dyn EventSink,
        cancel: &CancelToken,
    ) -> BatchSummary {
        sink.event(PipelineEvent::BatchStarted {
            index,
            total,
            entries: batch.len(),
            declared_bytes: batch.total_bytes,
        });
        info!(
            batch = index,
            of = total,
            entries = batch.len(),
            declared_bytes = batch.total_bytes,
            "batch started"
        );

        let mut summary = BatchSummary {
            index,
            ..BatchSummary::default()
        };
        for (position, id) in batch.ids.iter().enumerate() {
            if cancel.is_cancelled() {
                summary.not_started = batch.len() - position;
                break;
            }
            let result = self.process_entry(id, sink, cancel);
            sink.event(PipelineEvent::Status {
                id: id.clone(),
                result: result.clone(),
            });
            summary.record(result);
        }

        info!(
            batch = index,
            placed = summary.placed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            not_started = summary.not_started,
            "batch finished"
        );
        sink.event(PipelineEvent::BatchFinished(summary.clone()));
        summary
    }

    /// Records the remote size of every selected entry whose size is still
    /// unknown. Known sizes are never overwritten.
    pub fn probe_sizes(
        &self,
        filter: &EntryFilter,
        cancel: &CancelToken,
    ) -> Result<ProbeSummary, GamelibError> {
        let entries = self.catalog.load()?;
        let mut summary = ProbeSummary::default();
        for entry in select(&entries, filter) {
            if cancel.is_cancelled() {
                break;
            }
            if entry.known_size().is_some() {
                continue;
            }
            summary.probed += 1;
            match self.transfer.probe_size(&entry.url) {
                Ok(Some(size)) => {
                    self.catalog.update_entry(&entry.id, |stored| {
                        if stored.known_size().is_none() {
                            stored.size_bytes = Some(size);
                        }
                    })?;
                    debug!(entry = %entry.id, bytes = size, "size recorded");
                    summary.recorded += 1;
                }
                Ok(None) => summary.unavailable += 1,
                Err(err) => {
                    warn!(entry = %entry.id, error = %err, "size probe failed");
                    summary.unavailable += 1;
                }
            }
        }
        Ok(summary)
    }

    fn process_entry(
        &self,
        id: &EntryId,
        sink: &dyn EventSink,
        cancel: &CancelToken,
    ) -> PipelineResult {
        let mut progress = EntryProgress {
            stage: Stage::Pending,
            bytes: 0,
        };
        let attempt = chrono::Utc::now().to_rfc3339();
        let mut was_placed = false;
        let result = self
            .catalog
            .update_entry(id, |entry| entry.last_attempt = Some(attempt))
            .and_then(|entry| {
                was_placed = entry.placed;
                let paths = self.workspace.working_paths(&entry);
                let result = self.drive(entry, &paths, &mut progress, sink, cancel);
                let keep_extract = matches!(
                    (&result, progress.stage),
                    (Err(err), Stage::Convert) if !err.is_cancelled()
                );
                self.discard(&paths, keep_extract);
                result
            });

        let outcome = match result {
            Ok(()) => {
                info!(entry = %id, bytes = progress.bytes, "entry placed");
                EntryOutcome::Placed
            }
            Err(GamelibError::Cancelled) => {
                warn!(entry = %id, stage = %progress.stage, "entry cancelled");
                EntryOutcome::Cancelled {
                    stage: progress.stage,
                }
            }
            Err(err) => {
                let message = err.to_string();
                let untouched = was_placed && matches!(err, GamelibError::AlreadyPlaced(_));
                if untouched {
                    info!(entry = %id, "entry already placed, skipped");
                } else {
                    error!(entry = %id, stage = %progress.stage, error = %message, "entry failed");
                    let recorded = message.clone();
                    if let Err(write_err) = self
                        .catalog
                        .update_entry(id, |entry| entry.last_error = Some(recorded))
                    {
                        error!(entry = %id, error = %write_err, "could not record failure");
                    }
                }
                EntryOutcome::Failed {
                    stage: progress.stage,
                    message,
                }
            }
        };

        PipelineResult {
            id: id.clone(),
            stage_reached: progress.stage,
            outcome,
            bytes_transferred: progress.bytes,
        }
    }

    fn drive(
        &self,
        mut entry: LinkEntry,
        paths: &WorkingPaths,
        progress: &mut EntryProgress,
        sink: &dyn EventSink,
        cancel: &CancelToken,
    ) -> Result<(), GamelibError> {
        let convert = self.options.convert_iso && entry.link_type.requires_conversion();
        let destination = self.workspace.placement_dir(&entry, convert);

        if !self.options.overwrite && (entry.placed || destination.exists()) {
            progress.stage = Stage::Place;
            return Err(GamelibError::AlreadyPlaced(destination.into_std_path_buf()));
        }

        let start = resume_stage(&entry, paths, convert);
        entry = self.reset_flags(entry, start)?;
        if start != Stage::Download {
            info!(entry = %entry.id, stage = %start, "resuming from persisted progress");
        }

        if start == Stage::Download {
            progress.stage = Stage::Download;
            let written = self.download(&entry, &paths.download, sink, cancel)?;
            progress.bytes = written;
            entry = self.catalog.update_entry(&entry.id, |stored| {
                stored.downloaded = true;
                if stored.known_size().is_none() && written > 0 {
                    stored.size_bytes = Some(written);
                }
            })?;
        }

        if matches!(start, Stage::Download | Stage::Extract) {
            progress.stage = Stage::Extract;
            self.stage_started(sink, &entry.id, Stage::Extract);
            let bytes = {
                let mut report = progress_reporter(sink, &entry.id, Stage::Extract);
                unpack::extract(
                    paths.download.as_std_path(),
                    paths.extract.as_std_path(),
                    cancel,
                    &mut report,
                )?
            };
            debug!(entry = %entry.id, bytes, "extracted");
            entry = self
                .catalog
                .update_entry(&entry.id, |stored| stored.extracted = true)?;
        }

        // Past extraction the entry runs to completion; a cancel request
        // only stops the next entry from starting.
        let settled = CancelToken::new();

        if convert && start != Stage::Place {
            progress.stage = Stage::Convert;
            self.stage_started(sink, &entry.id, Stage::Convert);
            let image = locate_image(paths.extract.as_std_path())?;
            self.converter
                .convert(&image, paths.convert.as_std_path(), &entry.name)?;
            sink.event(PipelineEvent::Progress {
                id: entry.id.clone(),
                stage: Stage::Convert,
                done: 1,
                total: Some(1),
                fraction: Some(1.0),
            });
            entry = self
                .catalog
                .update_entry(&entry.id, |stored| stored.converted = true)?;
        }

        let source: &Utf8Path = if convert { &paths.convert } else { &paths.extract };
        progress.stage = Stage::Place;
        self.stage_started(sink, &entry.id, Stage::Place);
        let mut report = progress_reporter(sink, &entry.id, Stage::Place);
        place(
            source.as_std_path(),
            destination.as_std_path(),
            self.options.overwrite,
            &settled,
            &mut report,
        )?;
        self.catalog.update_entry(&entry.id, |stored| {
            stored.placed = true;
            stored.last_error = None;
        })?;
        Ok(())
    }

    fn download(
        &self,
        entry: &LinkEntry,
        destination: &Utf8Path,
        sink: &dyn EventSink,
        cancel: &CancelToken,
    ) -> Result<u64, GamelibError> {
        self.stage_started(sink, &entry.id, Stage::Download);
        let mut report = progress_reporter(sink, &entry.id, Stage::Download);
        let mut attempt = 0u32;
        loop {
            match self
                .transfer
                .fetch(&entry.url, destination.as_std_path(), cancel, &mut report)
            {
                Ok(written) => return Ok(written),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) if attempt < self.options.transfer_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(RETRY_BASE_DELAY_MS * u64::from(attempt));
                    warn!(
                        entry = %entry.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transfer failed, retrying"
                    );
                    thread::sleep(delay);
                    if cancel.is_cancelled() {
                        return Err(GamelibError::Cancelled);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Clears flags the resume point no longer backs with an artifact.
    fn reset_flags(&self, entry: LinkEntry, start: Stage) -> Result<LinkEntry, GamelibError> {
        let keep_downloaded = start != Stage::Download;
        let keep_extracted = matches!(start, Stage::Convert | Stage::Place);
        let keep_converted = start == Stage::Place;
        let stale = entry.placed
            || (entry.downloaded && !keep_downloaded)
            || (entry.extracted && !keep_extracted)
            || (entry.converted && !keep_converted);
        if !stale {
            return Ok(entry);
        }
        debug!(entry = %entry.id, stage = %start, "resetting stale flags");
        self.catalog.update_entry(&entry.id, |stored| {
            stored.placed = false;
            stored.converted &= keep_converted;
            stored.extracted &= keep_extracted;
            stored.downloaded &= keep_downloaded;
        })
    }

    fn stage_started(&self, sink: &dyn EventSink, id: &EntryId, stage: Stage) {
        info!(entry = %id, stage = %stage, "stage started");
        sink.event(PipelineEvent::StageStarted {
            id: id.clone(),
            stage,
        });
    }

    fn discard(&self, paths: &WorkingPaths, keep_extract: bool) {
        let mut targets = vec![paths.download.as_path(), paths.convert.as_path()];
        if !keep_extract {
            targets.push(paths.extract.as_path());
        }
        for target in targets {
            if let Err(err) = remove_path(target.as_std_path()) {
                warn!(path = %target, error = %err, "could not remove working artifact");
            }
        }
    }
}

/// Earliest stage whose input is still on disk and backed by a persisted flag.
fn resume_stage(entry: &LinkEntry, paths: &WorkingPaths, convert: bool) -> Stage {
    if entry.extracted && paths.extract.is_dir() {
        if !convert || (entry.converted && paths.convert.is_dir()) {
            Stage::Place
        } else {
            Stage::Convert
        }
    } else if entry.downloaded && paths.download.is_file() {
        Stage::Extract
    } else {
        Stage::Download
    }
}

fn progress_reporter<'a>(
    sink: &'a dyn EventSink,
    id: &'a EntryId,
    stage: Stage,
) -> impl FnMut(u64, Option<u64>) + 'a {
    let mut gate = ProgressGate::new();
    move |done, total| {
        if let Some(tick) = gate.admit(done, total) {
            sink.event(PipelineEvent::Progress {
                id: id.clone(),
                stage,
                done: tick.done,
                total: tick.total,
                fraction: tick.fraction,
            });
        }
    }
}
