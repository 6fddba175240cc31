use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::{EntryId, LinkEntry, LinkType, MergeMode};
use crate::error::GamelibError;
use crate::store::write_bytes_atomic;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CatalogDocument {
    schema_version: u32,
    entries: Vec<LinkEntry>,
}

/// One record of a shared link list. Only the link itself is taken over;
/// progress flags in the list are ignored.
#[derive(Debug, Deserialize)]
struct LinkRecord {
    url: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    size_bytes: Option<u64>,
}

impl LinkRecord {
    fn into_entry(self, default_type: LinkType) -> Result<LinkEntry, GamelibError> {
        let link_type = match self.link_type.as_deref() {
            Some(value) => value.parse::<LinkType>().map_err(|_| {
                GamelibError::CorruptCatalog(format!(
                    "link list: unknown link type {value} for {}",
                    self.url
                ))
            })?,
            None => default_type,
        };
        let mut entry = LinkEntry::from_url(&self.url, link_type)?;
        if let Some(name) = self.name.as_deref().map(str::trim).filter(|name| !name.is_empty()) {
            entry = LinkEntry::new(name, entry.url, link_type);
        }
        entry.size_bytes = self.size_bytes.filter(|size| *size > 0);
        Ok(entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: usize,
    pub kept: usize,
    pub total: usize,
}

/// Persistent catalog of link entries. Every mutation is written through to
/// disk before returning; writes go to a temporary file that is renamed over
/// the previous catalog.
#[derive(Debug)]
pub struct CatalogStore {
    path: Utf8PathBuf,
    write_lock: Mutex<()>,
}

impl CatalogStore {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Loads the catalog in stored order. A missing file is an empty catalog.
    pub fn load(&self) -> Result<Vec<LinkEntry>, GamelibError> {
        let content = match fs::read_to_string(self.path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(GamelibError::Filesystem(format!(
                    "read catalog {}: {err}",
                    self.path
                )));
            }
        };
        parse_catalog(&content)
    }

    pub fn save(&self, entries: &[LinkEntry]) -> Result<(), GamelibError> {
        let _guard = self.lock();
        self.write(entries)
    }

    pub fn merge(
        &self,
        new_entries: Vec<LinkEntry>,
        mode: MergeMode,
    ) -> Result<MergeReport, GamelibError> {
        let _guard = self.lock();
        let existing = match mode {
            MergeMode::Append => self.load()?,
            MergeMode::Replace => Vec::new(),
        };
        let (merged, report) = merge_entries(existing, new_entries, mode);
        self.write(&merged)?;
        info!(
            catalog = %self.path,
            added = report.added,
            kept = report.kept,
            total = report.total,
            "catalog merged"
        );
        Ok(report)
    }

    /// Applies `mutator` to one entry and persists the whole catalog before
    /// returning the updated entry.
    pub fn update_entry<F>(&self, id: &EntryId, mutator: F) -> Result<LinkEntry, GamelibError>
    where
        F: FnOnce(&mut LinkEntry),
    {
        let _guard = self.lock();
        let mut entries = self.load()?;
        let entry = entries
            .iter_mut()
            .find(|entry| &entry.id == id)
            .ok_or_else(|| GamelibError::UnknownEntry(id.to_string()))?;
        mutator(entry);
        entry.check_invariants().map_err(GamelibError::CorruptCatalog)?;
        let updated = entry.clone();
        self.write(&entries)?;
        debug!(entry = %id, "catalog entry updated");
        Ok(updated)
    }

    fn write(&self, entries: &[LinkEntry]) -> Result<(), GamelibError> {
        validate(entries)?;
        let document = CatalogDocument {
            schema_version: SCHEMA_VERSION,
            entries: entries.to_vec(),
        };
        let mut content = serde_json::to_vec_pretty(&document)
            .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
        content.push(b'\n');
        write_bytes_atomic(&self.path, &content)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn parse_catalog(content: &str) -> Result<Vec<LinkEntry>, GamelibError> {
    let document: CatalogDocument = serde_json::from_str(content)
        .map_err(|err| GamelibError::CorruptCatalog(err.to_string()))?;
    if document.schema_version > SCHEMA_VERSION {
        return Err(GamelibError::CorruptCatalog(format!(
            "unsupported schema version {}",
            document.schema_version
        )));
    }
    validate(&document.entries)?;
    Ok(document.entries)
}

fn validate(entries: &[LinkEntry]) -> Result<(), GamelibError> {
    let mut seen = HashSet::new();
    for entry in entries {
        entry.check_invariants().map_err(GamelibError::CorruptCatalog)?;
        if !seen.insert(&entry.id) {
            return Err(GamelibError::CorruptCatalog(format!(
                "duplicate entry id: {}",
                entry.id
            )));
        }
    }
    Ok(())
}

/// Combines catalogs. `Append` keeps existing entries (and their flags) and
/// adds unseen ids in order; `Replace` keeps only the new list. Duplicate
/// ids inside `new_entries` collapse to their first occurrence.
pub fn merge_entries(
    existing: Vec<LinkEntry>,
    new_entries: Vec<LinkEntry>,
    mode: MergeMode,
) -> (Vec<LinkEntry>, MergeReport) {
    let mut merged = match mode {
        MergeMode::Append => existing,
        MergeMode::Replace => Vec::new(),
    };
    let kept = merged.len();
    let mut seen: HashSet<EntryId> = merged.iter().map(|entry| entry.id.clone()).collect();
    for entry in new_entries {
        if seen.insert(entry.id.clone()) {
            merged.push(entry);
        }
    }
    let report = MergeReport {
        added: merged.len() - kept,
        kept,
        total: merged.len(),
    };
    (merged, report)
}

/// Turns a raw URL list into fresh entries. Blank lines and `#` comments are
/// skipped; any malformed URL rejects the whole list.
pub fn entries_from_urls(text: &str, link_type: LinkType) -> Result<Vec<LinkEntry>, GamelibError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| LinkEntry::from_url(line, link_type))
        .collect()
}

/// Parses a JSON link list: an array of records that each carry at least a
/// `url`. Records without a `link_type` get `default_type`.
pub fn entries_from_link_list(
    json: &str,
    default_type: LinkType,
) -> Result<Vec<LinkEntry>, GamelibError> {
    let records: Vec<LinkRecord> = serde_json::from_str(json)
        .map_err(|err| GamelibError::CorruptCatalog(format!("link list: {err}")))?;
    records
        .into_iter()
        .map(|record| record.into_entry(default_type))
        .collect()
}
