use serde::Serialize;

use crate::domain::{BatchMode, EntryFilter, EntryId, LinkEntry};

/// One planned run: entry ids in catalog order plus the declared size they
/// add up to. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub ids: Vec<EntryId>,
    pub total_bytes: u64,
    pub mode: BatchMode,
    pub budget: u64,
}

impl Batch {
    fn open(mode: BatchMode, budget: u64) -> Self {
        Self {
            ids: Vec::new(),
            total_bytes: 0,
            mode,
            budget,
        }
    }

    fn push(&mut self, entry: &LinkEntry) {
        self.ids.push(entry.id.clone());
        self.total_bytes += entry.known_size().unwrap_or(0);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub fn select<'a>(entries: &'a [LinkEntry], filter: &EntryFilter) -> Vec<&'a LinkEntry> {
    entries.iter().filter(|entry| filter.matches(entry)).collect()
}

/// Splits the filtered catalog into batches. `budget` is an entry count for
/// `ByCount` (0 behaves as 1) and a byte total for `BySize`.
///
/// Entries of unknown size count as zero bytes when packing by size, so a
/// batch of them may overshoot the budget on disk. An entry larger than the
/// budget gets a batch of its own.
pub fn plan(
    entries: &[LinkEntry],
    filter: &EntryFilter,
    mode: BatchMode,
    budget: u64,
) -> Vec<Batch> {
    let selected = select(entries, filter);
    match mode {
        BatchMode::ByCount => plan_by_count(&selected, budget),
        BatchMode::BySize => plan_by_size(&selected, budget),
    }
}

fn plan_by_count(selected: &[&LinkEntry], budget: u64) -> Vec<Batch> {
    let chunk = usize::try_from(budget).unwrap_or(usize::MAX).max(1);
    selected
        .chunks(chunk)
        .map(|chunk| {
            let mut batch = Batch::open(BatchMode::ByCount, budget);
            for entry in chunk {
                batch.push(entry);
            }
            batch
        })
        .collect()
}

fn plan_by_size(selected: &[&LinkEntry], budget: u64) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = Batch::open(BatchMode::BySize, budget);
    for entry in selected {
        let size = entry.known_size().unwrap_or(0);
        if size > budget {
            if !current.is_empty() {
                batches.push(std::mem::replace(
                    &mut current,
                    Batch::open(BatchMode::BySize, budget),
                ));
            }
            let mut alone = Batch::open(BatchMode::BySize, budget);
            alone.push(entry);
            batches.push(alone);
            continue;
        }
        if !current.is_empty() && current.total_bytes.saturating_add(size) > budget {
            batches.push(std::mem::replace(
                &mut current,
                Batch::open(BatchMode::BySize, budget),
            ));
        }
        current.push(entry);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
