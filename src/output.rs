use std::io::{self, Write};
use std::sync::mpsc::Receiver;
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use serde::Serialize;
use tracing::info;

use crate::catalog::MergeReport;
use crate::events::{EventSink, PipelineEvent};
use crate::pipeline::{EntryOutcome, ProbeSummary, RunSummary};
use crate::planner::Batch;
use crate::report::LibraryReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

/// Batches the planner would run, without touching the network or disk.
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub batches: Vec<Batch>,
    pub entries: usize,
    pub declared_bytes: u64,
}

impl PlanPreview {
    pub fn new(batches: Vec<Batch>) -> Self {
        let entries = batches.iter().map(Batch::len).sum();
        let declared_bytes = batches.iter().map(|batch| batch.total_bytes).sum();
        Self {
            batches,
            entries,
            declared_bytes,
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_plan(result: &PlanPreview) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_report(result: &LibraryReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_merge(result: &MergeReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_probe(result: &ProbeSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// Forwards entry outcomes to the log and drops progress ticks. Used when
/// nothing is rendered.
pub struct LogSink;

impl EventSink for LogSink {
    fn event(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::BatchStarted {
                index,
                total,
                entries,
                ..
            } => info!(batch = index, of = total, entries, "batch queued"),
            PipelineEvent::Status { id, result } => {
                if let EntryOutcome::Failed { stage, message } = result.outcome {
                    info!(entry = %id, stage = %stage, error = %message, "entry status: failed");
                }
            }
            _ => {}
        }
    }
}

/// Renders pipeline events as an overall bar plus one bar for the entry in
/// flight. Blocks until every sender is dropped.
pub struct ProgressView {
    multi: MultiProgress,
}

impl ProgressView {
    pub fn new(hidden: bool) -> Self {
        let multi = if hidden {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::new()
        };
        Self { multi }
    }

    pub fn drain(&self, events: Receiver<PipelineEvent>) {
        let overall_style = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} | {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        let entry_style = ProgressStyle::with_template(
            "  {spinner:.blue} {wide_msg} [{bar:30.white/dim}] {bytes}/{total_bytes} {bytes_per_sec}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());

        let overall = self.multi.add(ProgressBar::new(0));
        overall.set_style(overall_style);
        overall.enable_steady_tick(Duration::from_millis(120));
        let mut current: Option<ProgressBar> = None;

        for event in events {
            match event {
                PipelineEvent::RunStarted { entries, .. } => {
                    overall.set_length(entries as u64);
                }
                PipelineEvent::BatchStarted { index, total, .. } => {
                    overall.set_message(format!("batch {index}/{total}"));
                }
                PipelineEvent::StageStarted { id, stage } => {
                    let bar = current.get_or_insert_with(|| {
                        let bar = self.multi.insert_before(&overall, ProgressBar::new(0));
                        bar.set_style(entry_style.clone());
                        bar
                    });
                    bar.reset();
                    bar.set_length(0);
                    bar.set_message(format!("{id} {stage}"));
                }
                PipelineEvent::Progress { done, total, .. } => {
                    if let Some(bar) = &current {
                        if let Some(total) = total {
                            bar.set_length(total);
                        }
                        bar.set_position(done);
                    }
                }
                PipelineEvent::Status { id, result } => {
                    if let Some(bar) = current.take() {
                        bar.finish_and_clear();
                    }
                    let line = match &result.outcome {
                        EntryOutcome::Placed => format!("placed    {id}"),
                        EntryOutcome::Failed { stage, message } => {
                            format!("failed    {id} at {stage}: {message}")
                        }
                        EntryOutcome::Cancelled { stage } => format!("cancelled {id} at {stage}"),
                    };
                    let _ = self.multi.println(line);
                    overall.inc(1);
                }
                PipelineEvent::BatchFinished(summary) => {
                    let _ = self.multi.println(format!(
                        "batch {}: {} placed, {} failed, {} cancelled",
                        summary.index, summary.placed, summary.failed, summary.cancelled
                    ));
                }
            }
        }
        if let Some(bar) = current.take() {
            bar.finish_and_clear();
        }
        overall.finish_and_clear();
    }
}
