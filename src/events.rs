//! Progress and status delivery from the pipeline to whatever front end
//! drives it.
//!
//! Events are emitted synchronously from the thread running the pipeline, in
//! the order things happen. For a single entry and stage, `Progress` events
//! carry a non-decreasing fraction. Nothing is promised about interleaving
//! across entries beyond emission order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::time::{Duration, Instant};

use crate::domain::{EntryId, Stage};
use crate::pipeline::{BatchSummary, PipelineResult};

const MIN_FRACTION_STEP: f64 = 0.01;
const MIN_EMIT_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    RunStarted {
        batches: usize,
        entries: usize,
    },
    BatchStarted {
        index: usize,
        total: usize,
        entries: usize,
        declared_bytes: u64,
    },
    StageStarted {
        id: EntryId,
        stage: Stage,
    },
    Progress {
        id: EntryId,
        stage: Stage,
        done: u64,
        total: Option<u64>,
        fraction: Option<f64>,
    },
    Status {
        id: EntryId,
        result: PipelineResult,
    },
    BatchFinished(BatchSummary),
}

pub trait EventSink {
    fn event(&self, event: PipelineEvent);
}

pub struct NullSink;

impl EventSink for NullSink {
    fn event(&self, _event: PipelineEvent) {}
}

/// Bounded channel sink. A full channel blocks the pipeline until the
/// consumer catches up; a dropped receiver silently discards events.
#[derive(Clone)]
pub struct ChannelSink {
    tx: SyncSender<PipelineEvent>,
}

impl EventSink for ChannelSink {
    fn event(&self, event: PipelineEvent) {
        let _ = self.tx.send(event);
    }
}

pub fn channel(bound: usize) -> (ChannelSink, Receiver<PipelineEvent>) {
    let (tx, rx) = mpsc::sync_channel(bound);
    (ChannelSink { tx }, rx)
}

/// Cooperative cancellation flag shared between the front end and the
/// pipeline. Stages poll it between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTick {
    pub done: u64,
    pub total: Option<u64>,
    pub fraction: Option<f64>,
}

/// Throttles raw byte counters into progress ticks for one entry/stage.
#[derive(Debug)]
pub struct ProgressGate {
    last_fraction: Option<f64>,
    last_emit: Option<Instant>,
}

impl ProgressGate {
    pub fn new() -> Self {
        Self {
            last_fraction: None,
            last_emit: None,
        }
    }

    pub fn admit(&mut self, done: u64, total: Option<u64>) -> Option<ProgressTick> {
        let raw = total
            .filter(|total| *total > 0)
            .map(|total| (done as f64 / total as f64).clamp(0.0, 1.0));
        let fraction = match (raw, self.last_fraction) {
            (Some(raw), Some(last)) => Some(raw.max(last)),
            (raw, _) => raw,
        };

        let now = Instant::now();
        let due = match (self.last_emit, fraction, self.last_fraction) {
            (None, _, _) => true,
            (_, Some(current), Some(last)) if current >= 1.0 && last < 1.0 => true,
            (_, Some(current), Some(last)) if current - last >= MIN_FRACTION_STEP => true,
            (_, Some(_), None) => true,
            (Some(at), _, _) => now.duration_since(at) >= MIN_EMIT_INTERVAL,
        };
        if !due {
            return None;
        }

        self.last_emit = Some(now);
        if fraction.is_some() {
            self.last_fraction = fraction;
        }
        Some(ProgressTick {
            done,
            total,
            fraction,
        })
    }
}

impl Default for ProgressGate {
    fn default() -> Self {
        Self::new()
    }
}
