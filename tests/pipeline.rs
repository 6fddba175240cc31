use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use gamelib_pipeline::catalog::CatalogStore;
use gamelib_pipeline::convert::Converter;
use gamelib_pipeline::domain::{
    BatchMode, CompletionFilter, EntryFilter, EntryId, LinkEntry, LinkType, Stage, TypeFilter,
};
use gamelib_pipeline::error::GamelibError;
use gamelib_pipeline::events::{CancelToken, NullSink, PipelineEvent, channel};
use gamelib_pipeline::pipeline::{EntryOutcome, Pipeline, PipelineOptions, RunSummary};
use gamelib_pipeline::store::Workspace;
use gamelib_pipeline::transfer::Transfer;

#[derive(Default)]
struct MockTransfer {
    archives: HashMap<String, Vec<u8>>,
    calls: Arc<Mutex<Vec<String>>>,
    flaky: Mutex<HashMap<String, u32>>,
    cancel_on: Option<(String, CancelToken)>,
}

impl MockTransfer {
    fn serving(archives: &[(&LinkEntry, Vec<u8>)]) -> Self {
        Self {
            archives: archives
                .iter()
                .map(|(entry, bytes)| (entry.url.clone(), bytes.clone()))
                .collect(),
            ..Self::default()
        }
    }
}

impl Transfer for MockTransfer {
    fn probe_size(&self, url: &str) -> Result<Option<u64>, GamelibError> {
        Ok(self.archives.get(url).map(|bytes| bytes.len() as u64))
    }

    fn fetch(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, GamelibError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some((target, token)) = &self.cancel_on {
            if target == url {
                token.cancel();
            }
        }
        if cancel.is_cancelled() {
            return Err(GamelibError::Cancelled);
        }
        if let Some(remaining) = self.flaky.lock().unwrap().get_mut(url) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(GamelibError::TransferFailed("connection reset".to_string()));
            }
        }
        let bytes = self
            .archives
            .get(url)
            .ok_or_else(|| GamelibError::TransferFailed(format!("GET {url} returned 404")))?;
        fs::create_dir_all(destination.parent().unwrap()).unwrap();
        fs::write(destination, bytes).unwrap();
        let total = bytes.len() as u64;
        on_progress(total / 2, Some(total));
        on_progress(total, Some(total));
        Ok(total)
    }
}

struct MockConverter {
    fail: bool,
    calls: Arc<Mutex<usize>>,
    cancel_on_convert: Option<CancelToken>,
}

impl MockConverter {
    fn working() -> Self {
        Self {
            fail: false,
            calls: Arc::default(),
            cancel_on_convert: None,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::working()
        }
    }
}

impl Converter for MockConverter {
    fn convert(&self, image: &Path, output_dir: &Path, title: &str) -> Result<(), GamelibError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(token) = &self.cancel_on_convert {
            token.cancel();
        }
        if self.fail {
            return Err(GamelibError::ConversionFailed("bad image header".to_string()));
        }
        let image = fs::read(image).unwrap();
        fs::create_dir_all(output_dir).unwrap();
        fs::write(output_dir.join(format!("{title}.god")), image).unwrap();
        Ok(())
    }
}

struct Fixture {
    _temp: TempDir,
    root: Utf8PathBuf,
}

impl Fixture {
    fn new(entries: &[LinkEntry]) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let fixture = Self { _temp: temp, root };
        fixture.catalog().save(entries).unwrap();
        fixture
    }

    fn catalog(&self) -> CatalogStore {
        CatalogStore::new(self.root.join("catalog.json"))
    }

    fn workspace(&self) -> Workspace {
        Workspace::under(&self.root)
    }

    fn pipeline(
        &self,
        transfer: MockTransfer,
        converter: MockConverter,
        options: PipelineOptions,
    ) -> Pipeline<MockTransfer, MockConverter> {
        Pipeline::new(self.catalog(), self.workspace(), options, transfer, converter)
    }

    fn entry(&self, id: &EntryId) -> LinkEntry {
        self.catalog()
            .load()
            .unwrap()
            .into_iter()
            .find(|entry| &entry.id == id)
            .unwrap()
    }

    fn is_empty_dir(&self, name: &str) -> bool {
        fs::read_dir(self.root.join(name)).unwrap().next().is_none()
    }
}

fn xbla(name: &str) -> LinkEntry {
    LinkEntry::new(name, format!("https://example.org/{name}.zip"), LinkType::Xbla)
}

fn iso(name: &str) -> LinkEntry {
    LinkEntry::new(name, format!("https://example.org/{name}.zip"), LinkType::Iso)
}

fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, data) in files {
        zip.start_file(*name, options).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

fn pending() -> EntryFilter {
    EntryFilter::new(TypeFilter::All, CompletionFilter::Incomplete)
}

fn everything() -> EntryFilter {
    EntryFilter::new(TypeFilter::All, CompletionFilter::All)
}

fn run_all<T: Transfer, C: Converter>(pipeline: &Pipeline<T, C>, filter: EntryFilter) -> RunSummary {
    pipeline
        .run(&filter, BatchMode::ByCount, 10, &NullSink, &CancelToken::new())
        .unwrap()
}

#[test]
fn failed_download_is_isolated_to_its_entry() {
    let entries: Vec<_> = (1..=5).map(|i| xbla(&format!("Game{i}"))).collect();
    let fixture = Fixture::new(&entries);
    let served: Vec<_> = entries
        .iter()
        .enumerate()
        .filter(|(index, _)| *index != 2)
        .map(|(_, entry)| (entry, zip_bytes(&[("default.xex", entry.name.as_bytes())])))
        .collect();
    let pipeline = fixture.pipeline(
        MockTransfer::serving(&served),
        MockConverter::working(),
        PipelineOptions::default(),
    );

    let summary = run_all(&pipeline, pending());

    assert_eq!(summary.placed, 4);
    assert_eq!(summary.failed, 1);
    let results = &summary.batches[0].results;
    assert_matches!(
        &results[2].outcome,
        EntryOutcome::Failed { stage: Stage::Download, message } if message.contains("404")
    );

    let failed = fixture.entry(&entries[2].id);
    assert!(!failed.downloaded && !failed.placed);
    assert!(failed.last_error.as_deref().is_some_and(|msg| !msg.is_empty()));
    assert!(failed.last_attempt.is_some());

    for index in [0, 1, 3, 4] {
        let entry = fixture.entry(&entries[index].id);
        assert!(entry.placed && entry.extracted && entry.downloaded);
        assert!(entry.last_error.is_none());
        let placed = fixture
            .root
            .join("output/XBLA")
            .join(&entries[index].name)
            .join("default.xex");
        assert_eq!(fs::read_to_string(placed).unwrap(), entries[index].name);
    }
    assert!(fixture.is_empty_dir("downloads"));
    assert!(fixture.is_empty_dir("temp"));
}

#[test]
fn second_run_processes_nothing() {
    let entries = vec![xbla("Braid"), xbla("Limbo")];
    let fixture = Fixture::new(&entries);
    let archive = zip_bytes(&[("default.xex", b"xex")]);
    let transfer = MockTransfer::serving(&[
        (&entries[0], archive.clone()),
        (&entries[1], archive),
    ]);
    let calls = Arc::clone(&transfer.calls);
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());

    let first = run_all(&pipeline, pending());
    assert_eq!(first.placed, 2);
    let second = run_all(&pipeline, pending());
    assert_eq!(second.processed(), 0);
    assert!(second.batches.is_empty());
    assert_eq!(calls.lock().unwrap().len(), 2);
}

#[test]
fn resumes_at_placement_after_crash() {
    let mut entry = xbla("Trials");
    entry.downloaded = true;
    entry.extracted = true;
    let fixture = Fixture::new(std::slice::from_ref(&entry));
    let paths = fixture.workspace().working_paths(&entry);
    fs::create_dir_all(&paths.extract).unwrap();
    fs::write(paths.extract.join("default.xex"), b"resumed").unwrap();

    let transfer = MockTransfer::default();
    let calls = Arc::clone(&transfer.calls);
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());
    let summary = run_all(&pipeline, pending());

    assert_eq!(summary.placed, 1);
    assert!(calls.lock().unwrap().is_empty());
    let placed = fixture.root.join("output/XBLA/Trials/default.xex");
    assert_eq!(fs::read(placed).unwrap(), b"resumed");
    assert!(!paths.extract.exists());
    assert!(fixture.entry(&entry.id).placed);
}

#[test]
fn conversion_failure_keeps_extraction_for_retry() {
    let entry = iso("Halo 3");
    let fixture = Fixture::new(std::slice::from_ref(&entry));
    let archive = zip_bytes(&[("Halo 3/halo3.iso", &[9u8; 2048])]);
    let transfer = MockTransfer::serving(&[(&entry, archive.clone())]);
    let calls = Arc::clone(&transfer.calls);
    let pipeline = fixture.pipeline(transfer, MockConverter::failing(), PipelineOptions::default());

    let summary = run_all(&pipeline, pending());
    assert_matches!(
        summary.batches[0].results[0].outcome,
        EntryOutcome::Failed { stage: Stage::Convert, .. }
    );
    let stored = fixture.entry(&entry.id);
    assert!(stored.downloaded && stored.extracted);
    assert!(!stored.converted && !stored.placed);
    assert!(stored.last_error.is_some());
    let paths = fixture.workspace().working_paths(&entry);
    assert!(paths.extract.is_dir());
    assert!(!paths.download.exists());

    let retry = fixture.pipeline(
        MockTransfer {
            calls: Arc::clone(&calls),
            ..MockTransfer::default()
        },
        MockConverter::working(),
        PipelineOptions::default(),
    );
    let summary = run_all(&retry, pending());
    assert_eq!(summary.placed, 1);
    assert_eq!(calls.lock().unwrap().len(), 1);
    let god = fixture.root.join("output/god_converted/Halo 3/Halo 3.god");
    assert_eq!(fs::read(god).unwrap().len(), 2048);
    assert!(!paths.extract.exists());
    assert!(!paths.convert.exists());
    let stored = fixture.entry(&entry.id);
    assert!(stored.converted && stored.placed);
    assert!(stored.last_error.is_none());
}

#[test]
fn iso_without_conversion_is_placed_by_type() {
    let entry = iso("Fable");
    let fixture = Fixture::new(std::slice::from_ref(&entry));
    let transfer = MockTransfer::serving(&[(&entry, zip_bytes(&[("fable.iso", b"disc")]))]);
    let converter = MockConverter::working();
    let converter_calls = Arc::clone(&converter.calls);
    let options = PipelineOptions {
        convert_iso: false,
        ..PipelineOptions::default()
    };
    let pipeline = fixture.pipeline(transfer, converter, options);

    assert_eq!(run_all(&pipeline, pending()).placed, 1);
    assert!(fixture.root.join("output/ISO/Fable/fable.iso").is_file());
    assert_eq!(*converter_calls.lock().unwrap(), 0);
    assert!(!fixture.entry(&entry.id).converted);
}

#[test]
fn cancellation_stops_accepting_entries() {
    let entries = vec![xbla("One"), xbla("Two"), xbla("Three")];
    let fixture = Fixture::new(&entries);
    let archive = zip_bytes(&[("default.xex", b"xex")]);
    let cancel = CancelToken::new();
    let mut transfer = MockTransfer::serving(&[
        (&entries[0], archive.clone()),
        (&entries[1], archive.clone()),
        (&entries[2], archive),
    ]);
    transfer.cancel_on = Some((entries[1].url.clone(), cancel.clone()));
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());

    let summary = pipeline
        .run(&pending(), BatchMode::ByCount, 10, &NullSink, &cancel)
        .unwrap();

    assert_eq!(summary.placed, 1);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.not_started, 1);
    assert_matches!(
        summary.batches[0].results[1].outcome,
        EntryOutcome::Cancelled { stage: Stage::Download }
    );
    let cancelled = fixture.entry(&entries[1].id);
    assert!(cancelled.last_error.is_none());
    assert!(!cancelled.downloaded);
    assert!(fixture.entry(&entries[0].id).placed);
    assert!(fixture.entry(&entries[2].id).last_attempt.is_none());
    assert!(fixture.is_empty_dir("downloads"));
}

#[test]
fn cancel_during_conversion_finishes_the_entry() {
    let entries = vec![iso("Halo 3"), xbla("Braid")];
    let fixture = Fixture::new(&entries);
    let cancel = CancelToken::new();
    let transfer = MockTransfer::serving(&[
        (&entries[0], zip_bytes(&[("halo3.iso", &[4u8; 512])])),
        (&entries[1], zip_bytes(&[("default.xex", b"xex")])),
    ]);
    let calls = Arc::clone(&transfer.calls);
    let mut converter = MockConverter::working();
    converter.cancel_on_convert = Some(cancel.clone());
    let pipeline = fixture.pipeline(transfer, converter, PipelineOptions::default());

    let summary = pipeline
        .run(&pending(), BatchMode::ByCount, 10, &NullSink, &cancel)
        .unwrap();

    assert_eq!(summary.placed, 1);
    assert_eq!(summary.cancelled, 0);
    assert_eq!(summary.not_started, 1);
    assert_matches!(summary.batches[0].results[0].outcome, EntryOutcome::Placed);
    let god = fixture.root.join("output/god_converted/Halo 3/Halo 3.god");
    assert_eq!(fs::read(god).unwrap().len(), 512);

    let stored = fixture.entry(&entries[0].id);
    assert!(stored.extracted && stored.converted && stored.placed);
    let paths = fixture.workspace().working_paths(&entries[0]);
    assert!(!paths.extract.exists());
    assert!(!paths.convert.exists());
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert!(fixture.entry(&entries[1].id).last_attempt.is_none());
}

#[test]
fn cancellation_skips_later_batches() {
    let entries = vec![xbla("One"), xbla("Two")];
    let fixture = Fixture::new(&entries);
    let cancel = CancelToken::new();
    let mut transfer = MockTransfer::default();
    transfer.cancel_on = Some((entries[0].url.clone(), cancel.clone()));
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());

    let summary = pipeline
        .run(&pending(), BatchMode::ByCount, 1, &NullSink, &cancel)
        .unwrap();
    assert_eq!(summary.batches.len(), 1);
    assert_eq!(summary.cancelled, 1);
    assert_eq!(summary.not_started, 1);
}

#[test]
fn placed_entry_is_not_clobbered_without_overwrite() {
    let mut entry = xbla("Castle Crashers");
    entry.downloaded = true;
    entry.extracted = true;
    entry.placed = true;
    let fixture = Fixture::new(std::slice::from_ref(&entry));
    let archive = zip_bytes(&[("default.xex", b"fresh")]);

    let transfer = MockTransfer::serving(&[(&entry, archive.clone())]);
    let calls = Arc::clone(&transfer.calls);
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());
    let summary = run_all(&pipeline, everything());
    assert_matches!(
        &summary.batches[0].results[0].outcome,
        EntryOutcome::Failed { stage: Stage::Place, message } if message.contains("already placed")
    );
    assert!(calls.lock().unwrap().is_empty());
    let stored = fixture.entry(&entry.id);
    assert!(stored.placed);
    assert!(stored.last_error.is_none());

    let overwrite = PipelineOptions {
        overwrite: true,
        ..PipelineOptions::default()
    };
    let pipeline = fixture.pipeline(
        MockTransfer::serving(&[(&entry, archive)]),
        MockConverter::working(),
        overwrite,
    );
    assert_eq!(run_all(&pipeline, everything()).placed, 1);
    let placed = fixture.root.join("output/XBLA/Castle Crashers/default.xex");
    assert_eq!(fs::read(placed).unwrap(), b"fresh");
}

#[test]
fn existing_destination_blocks_placement() {
    let entry = xbla("Geometry Wars");
    let fixture = Fixture::new(std::slice::from_ref(&entry));
    fs::create_dir_all(fixture.root.join("output/XBLA/Geometry Wars")).unwrap();
    let transfer = MockTransfer::serving(&[(&entry, zip_bytes(&[("a", b"a")]))]);
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());

    let summary = run_all(&pipeline, pending());
    assert_eq!(summary.failed, 1);
    let stored = fixture.entry(&entry.id);
    assert!(!stored.placed);
    assert!(stored.last_error.is_some_and(|message| message.contains("already placed")));
}

#[test]
fn transfer_retries_with_backoff() {
    let entry = xbla("Flaky");
    let fixture = Fixture::new(std::slice::from_ref(&entry));
    let transfer = MockTransfer::serving(&[(&entry, zip_bytes(&[("default.xex", b"ok")]))]);
    transfer.flaky.lock().unwrap().insert(entry.url.clone(), 2);
    let calls = Arc::clone(&transfer.calls);
    let options = PipelineOptions {
        transfer_retries: 2,
        ..PipelineOptions::default()
    };
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), options);

    assert_eq!(run_all(&pipeline, pending()).placed, 1);
    assert_eq!(calls.lock().unwrap().len(), 3);
}

#[test]
fn observed_size_fills_unknown_size_only() {
    let mut known = xbla("Known");
    known.size_bytes = Some(999);
    let unknown = xbla("Unknown");
    let fixture = Fixture::new(&[known.clone(), unknown.clone()]);
    let archive = zip_bytes(&[("default.xex", b"payload")]);
    let transfer = MockTransfer::serving(&[(&known, archive.clone()), (&unknown, archive.clone())]);
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());

    run_all(&pipeline, pending());
    assert_eq!(fixture.entry(&known.id).size_bytes, Some(999));
    assert_eq!(fixture.entry(&unknown.id).size_bytes, Some(archive.len() as u64));
}

#[test]
fn stale_flags_restart_from_download() {
    let mut entry = xbla("Stale");
    entry.downloaded = true;
    let fixture = Fixture::new(std::slice::from_ref(&entry));
    let transfer = MockTransfer::serving(&[(&entry, zip_bytes(&[("default.xex", b"x")]))]);
    let calls = Arc::clone(&transfer.calls);
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());

    assert_eq!(run_all(&pipeline, pending()).placed, 1);
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[test]
fn probe_records_sizes_for_unknown_entries() {
    let mut known = xbla("Known");
    known.size_bytes = Some(5);
    let unknown = xbla("Unknown");
    let missing = xbla("Missing");
    let fixture = Fixture::new(&[known.clone(), unknown.clone(), missing.clone()]);
    let transfer = MockTransfer::serving(&[(&known, vec![0; 50]), (&unknown, vec![0; 70])]);
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());

    let summary = pipeline.probe_sizes(&everything(), &CancelToken::new()).unwrap();
    assert_eq!(summary.probed, 2);
    assert_eq!(summary.recorded, 1);
    assert_eq!(summary.unavailable, 1);
    assert_eq!(fixture.entry(&known.id).size_bytes, Some(5));
    assert_eq!(fixture.entry(&unknown.id).size_bytes, Some(70));
}

#[test]
fn events_arrive_in_processing_order() {
    let entries = vec![xbla("A"), xbla("B")];
    let fixture = Fixture::new(&entries);
    let archive = zip_bytes(&[("default.xex", &[1u8; 300_000])]);
    let transfer = MockTransfer::serving(&[(&entries[0], archive.clone()), (&entries[1], archive)]);
    let pipeline = fixture.pipeline(transfer, MockConverter::working(), PipelineOptions::default());

    let (sink, rx) = channel(4096);
    pipeline
        .run(&pending(), BatchMode::ByCount, 1, &sink, &CancelToken::new())
        .unwrap();
    drop(sink);
    let events: Vec<_> = rx.iter().collect();

    assert_matches!(events.first(), Some(PipelineEvent::RunStarted { batches: 2, entries: 2 }));
    assert_matches!(events.last(), Some(PipelineEvent::BatchFinished(summary)) if summary.index == 2);

    let mut last: HashMap<(EntryId, Stage), f64> = HashMap::new();
    for event in &events {
        if let PipelineEvent::Progress {
            id,
            stage,
            fraction: Some(fraction),
            ..
        } = event
        {
            let previous = last.insert((id.clone(), *stage), *fraction).unwrap_or(0.0);
            assert!(*fraction >= previous);
        }
    }

    let statuses: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::Status { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![entries[0].id.clone(), entries[1].id.clone()]);
}

#[test]
fn corrupt_catalog_fails_before_any_work() {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    fs::write(root.join("catalog.json"), b"{\"schema_version\":1,\"entries\":[{}]}").unwrap();
    let transfer = MockTransfer::default();
    let calls = Arc::clone(&transfer.calls);
    let pipeline = Pipeline::new(
        CatalogStore::new(root.join("catalog.json")),
        Workspace::under(&root),
        PipelineOptions::default(),
        transfer,
        MockConverter::working(),
    );

    let err = pipeline
        .run(&pending(), BatchMode::BySize, 1024, &NullSink, &CancelToken::new())
        .unwrap_err();
    assert_matches!(err, GamelibError::CorruptCatalog(_));
    assert!(calls.lock().unwrap().is_empty());
}
