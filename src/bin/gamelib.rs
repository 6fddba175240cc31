use std::fs::{self, OpenOptions};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing::warn;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gamelib_pipeline::catalog::{CatalogStore, entries_from_link_list, entries_from_urls};
use gamelib_pipeline::config::{Settings, SettingsLoader, batch_budget};
use gamelib_pipeline::convert::Iso2GodConverter;
use gamelib_pipeline::domain::{
    BatchMode, CompletionFilter, EntryFilter, LinkType, MergeMode, TypeFilter,
};
use gamelib_pipeline::error::GamelibError;
use gamelib_pipeline::events::{self, CancelToken};
use gamelib_pipeline::output::{JsonOutput, LogSink, OutputMode, PlanPreview, ProgressView};
use gamelib_pipeline::pipeline::{Pipeline, PipelineOptions, RunSummary};
use gamelib_pipeline::planner::plan;
use gamelib_pipeline::report::{LibraryReport, TypeReport, format_bytes};
use gamelib_pipeline::transfer::HttpTransfer;

const LOG_FILE: &str = "gamelib.log";
const EVENT_BUFFER: usize = 256;

#[derive(Parser)]
#[command(name = "gamelib")]
#[command(about = "Batch downloader that extracts, converts and shelves a catalog of game archives")]
#[command(version)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Settings file (defaults to ./gamelib.json when present)
    #[arg(long, global = true)]
    settings: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(
        about = "Download, extract, convert and place pending entries",
        long_about = "Download, extract, convert and place pending entries.\n\n\
            In interactive mode, type q and press Enter to cancel: a download or \
            extraction in progress is abandoned, an entry already past extraction \
            is finished, and no further entries are started."
    )]
    Run(RunArgs),
    #[command(about = "Show the batches a run would process")]
    Plan(BatchArgs),
    #[command(about = "Import a URL list or a remote JSON link list into the catalog")]
    Import(ImportArgs),
    #[command(about = "Record remote sizes for entries without one")]
    ProbeSizes(SelectArgs),
    #[command(about = "Summarize declared sizes per link type")]
    Sizes,
}

#[derive(Args, Clone)]
struct SelectArgs {
    #[arg(long, value_enum)]
    link_type: Option<TypeFilter>,

    #[arg(long, value_enum)]
    filter: Option<CompletionFilter>,
}

#[derive(Args, Clone)]
struct BatchArgs {
    #[command(flatten)]
    select: SelectArgs,

    #[arg(long, value_enum)]
    batch_mode: Option<BatchMode>,

    /// Entries per batch (by-count) or MiB per batch (by-size)
    #[arg(long)]
    batch_size: Option<u64>,
}

#[derive(Args, Clone)]
struct RunArgs {
    #[command(flatten)]
    batch: BatchArgs,

    #[arg(long)]
    overwrite: bool,

    #[arg(long)]
    no_convert: bool,

    #[arg(long)]
    retries: Option<u32>,
}

#[derive(Args)]
struct ImportArgs {
    /// Text file with one archive URL per line
    #[arg(required_unless_present = "from_url", conflicts_with = "from_url")]
    file: Option<PathBuf>,

    /// JSON link list to fetch instead of a local URL file
    #[arg(long)]
    from_url: Option<String>,

    #[arg(long, value_enum)]
    link_type: Option<LinkType>,

    #[arg(long, value_enum, default_value_t = MergeMode::Append)]
    mode: MergeMode,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<GamelibError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &GamelibError) -> u8 {
    match error {
        GamelibError::CorruptCatalog(_)
        | GamelibError::ConfigRead(_)
        | GamelibError::ConfigParse(_)
        | GamelibError::UnknownEntry(_) => 2,
        GamelibError::Http(_) | GamelibError::TransferFailed(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();
    let settings = SettingsLoader::resolve(cli.settings.as_deref())?;
    init_tracing(settings.logs_dir.as_deref())?;

    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Run(args) => run_pipeline(args, &settings, output_mode),
        Commands::Plan(args) => run_plan(args, &settings, output_mode),
        Commands::Import(args) => run_import(args, &settings, output_mode),
        Commands::ProbeSizes(args) => run_probe(args, &settings, output_mode),
        Commands::Sizes => run_sizes(&settings, output_mode),
    }
}

fn init_tracing(logs_dir: Option<&Utf8Path>) -> miette::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr_layer = fmt::layer().with_target(false).with_writer(io::stderr);
    let file_layer = match logs_dir {
        Some(dir) => {
            fs::create_dir_all(dir).into_diagnostic()?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(LOG_FILE))
                .into_diagnostic()?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn entry_filter(args: &SelectArgs, settings: &Settings) -> EntryFilter {
    EntryFilter::new(
        args.link_type.unwrap_or(settings.link_type),
        args.filter.unwrap_or(settings.filter),
    )
}

fn batching(args: &BatchArgs, settings: &Settings) -> (BatchMode, u64) {
    let mode = args.batch_mode.unwrap_or(settings.batch_mode);
    let size = args.batch_size.unwrap_or(settings.batch_size);
    (mode, batch_budget(mode, size))
}

fn build_pipeline(
    settings: &Settings,
    options: PipelineOptions,
) -> miette::Result<Pipeline<HttpTransfer, Iso2GodConverter>> {
    let transfer = HttpTransfer::new(settings.request_timeout_secs.map(Duration::from_secs))?;
    let converter = Iso2GodConverter::new(settings.iso2god_trim, settings.iso2god_threads);
    if options.convert_iso && converter.program().is_none() {
        warn!("iso2god not found in PATH; ISO entries will fail at conversion");
    }
    Ok(Pipeline::new(
        CatalogStore::new(settings.catalog_path.clone()),
        settings.workspace(),
        options,
        transfer,
        converter,
    ))
}

fn run_pipeline(args: RunArgs, settings: &Settings, output_mode: OutputMode) -> miette::Result<()> {
    let mut options = settings.pipeline_options();
    options.overwrite |= args.overwrite;
    options.convert_iso &= !args.no_convert;
    if let Some(retries) = args.retries {
        options.transfer_retries = retries;
    }
    let pipeline = build_pipeline(settings, options)?;
    let filter = entry_filter(&args.batch.select, settings);
    let (mode, budget) = batching(&args.batch, settings);
    let cancel = CancelToken::new();

    match output_mode {
        OutputMode::NonInteractive => {
            let summary = pipeline.run(&filter, mode, budget, &LogSink, &cancel)?;
            JsonOutput::print_run(&summary).into_diagnostic()?;
        }
        OutputMode::Interactive => {
            println!("type q and press Enter to cancel the run");
            watch_for_quit(cancel.clone());
            let (sink, rx) = events::channel(EVENT_BUFFER);
            let worker = thread::spawn(move || pipeline.run(&filter, mode, budget, &sink, &cancel));
            ProgressView::new(false).drain(rx);
            let summary = worker
                .join()
                .map_err(|_| miette::miette!("pipeline worker panicked"))??;
            print_run_summary(&summary);
        }
    }
    Ok(())
}

/// Cancels the run when the user enters `q`. The reader thread is left
/// blocked on stdin when the run ends on its own.
fn watch_for_quit(cancel: CancelToken) {
    thread::spawn(move || cancel_on_quit(io::stdin().lock(), &cancel));
}

fn cancel_on_quit(input: impl BufRead, cancel: &CancelToken) {
    for line in input.lines() {
        match line {
            Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                warn!("cancel requested");
                cancel.cancel();
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
}

fn run_plan(args: BatchArgs, settings: &Settings, output_mode: OutputMode) -> miette::Result<()> {
    let entries = CatalogStore::new(settings.catalog_path.clone()).load()?;
    let filter = entry_filter(&args.select, settings);
    let (mode, budget) = batching(&args, settings);
    let preview = PlanPreview::new(plan(&entries, &filter, mode, budget));

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_plan(&preview).into_diagnostic()?,
        OutputMode::Interactive => {
            println!(
                "{} entries in {} batches ({mode}), {} declared",
                preview.entries,
                preview.batches.len(),
                format_bytes(preview.declared_bytes)
            );
            for (index, batch) in preview.batches.iter().enumerate() {
                println!(
                    "batch {}: {} entries, {}",
                    index + 1,
                    batch.len(),
                    format_bytes(batch.total_bytes)
                );
                for id in &batch.ids {
                    println!("  {id}");
                }
            }
        }
    }
    Ok(())
}

fn run_import(args: ImportArgs, settings: &Settings, output_mode: OutputMode) -> miette::Result<()> {
    let link_type = args.link_type.unwrap_or(settings.import_type);
    let entries = match (&args.from_url, &args.file) {
        (Some(url), _) => {
            let transfer =
                HttpTransfer::new(settings.request_timeout_secs.map(Duration::from_secs))?;
            entries_from_link_list(&transfer.fetch_text(url)?, link_type)?
        }
        (None, Some(file)) => {
            let text = fs::read_to_string(file)
                .map_err(|err| GamelibError::Filesystem(format!("{}: {err}", file.display())))?;
            entries_from_urls(&text, link_type)?
        }
        (None, None) => return Err(miette::miette!("nothing to import")),
    };
    let report = CatalogStore::new(settings.catalog_path.clone()).merge(entries, args.mode)?;

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_merge(&report).into_diagnostic()?,
        OutputMode::Interactive => println!(
            "imported {} new entries ({} kept, {} total)",
            report.added, report.kept, report.total
        ),
    }
    Ok(())
}

fn run_probe(args: SelectArgs, settings: &Settings, output_mode: OutputMode) -> miette::Result<()> {
    let pipeline = build_pipeline(settings, settings.pipeline_options())?;
    let filter = entry_filter(&args, settings);
    let summary = pipeline.probe_sizes(&filter, &CancelToken::new())?;

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_probe(&summary).into_diagnostic()?,
        OutputMode::Interactive => println!(
            "probed {} entries: {} sizes recorded, {} unavailable",
            summary.probed, summary.recorded, summary.unavailable
        ),
    }
    Ok(())
}

fn run_sizes(settings: &Settings, output_mode: OutputMode) -> miette::Result<()> {
    let entries = CatalogStore::new(settings.catalog_path.clone()).load()?;
    let report = LibraryReport::from_entries(&entries);

    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_report(&report).into_diagnostic()?,
        OutputMode::Interactive => {
            for link_type in LinkType::ALL {
                print_type_report(link_type.as_str(), report.for_type(link_type));
            }
            print_type_report("total", &report.total);
        }
    }
    Ok(())
}

fn print_type_report(label: &str, report: &TypeReport) {
    println!(
        "{label:<6} {:>5} entries  {:>12}  ({} without size)  placed {} / {}",
        report.entries,
        format_bytes(report.total_bytes),
        report.without_size,
        report.placed,
        format_bytes(report.placed_bytes)
    );
}

fn print_run_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!(
        "{green}placed {} of {} entries, {} transferred{reset}",
        summary.placed,
        summary.processed() + summary.not_started,
        format_bytes(summary.bytes_transferred)
    );
    if summary.cancelled > 0 || summary.not_started > 0 {
        println!(
            "{yellow}cancelled {}, not started {}{reset}",
            summary.cancelled, summary.not_started
        );
    }
    for batch in &summary.batches {
        for (id, message) in batch.failures() {
            println!("{red}failed {id}: {message}{reset}");
        }
    }
}
