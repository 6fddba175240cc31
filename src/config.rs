use std::fs;
use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{BatchMode, CompletionFilter, EntryFilter, LinkType, TypeFilter};
use crate::error::GamelibError;
use crate::pipeline::PipelineOptions;
use crate::store::Workspace;

pub const DEFAULT_SETTINGS_FILE: &str = "gamelib.json";
pub const DEFAULT_BATCH_SIZE: u64 = 10240;
const MIB: u64 = 1024 * 1024;

/// On-disk settings document. Every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,
    #[serde(default)]
    pub downloads_dir: Option<PathBuf>,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
    #[serde(default)]
    pub batch_size: Option<u64>,
    #[serde(default)]
    pub batch_mode: Option<BatchMode>,
    #[serde(default)]
    pub filter: Option<CompletionFilter>,
    #[serde(default)]
    pub link_type: Option<TypeFilter>,
    #[serde(default)]
    pub import_type: Option<LinkType>,
    #[serde(default)]
    pub convert_iso: Option<bool>,
    #[serde(default)]
    pub iso2god_trim: Option<bool>,
    #[serde(default)]
    pub iso2god_threads: Option<u32>,
    #[serde(default)]
    pub overwrite: Option<bool>,
    #[serde(default)]
    pub transfer_retries: Option<u32>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub catalog_path: Utf8PathBuf,
    pub downloads_dir: Utf8PathBuf,
    pub temp_dir: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
    pub logs_dir: Option<Utf8PathBuf>,
    pub batch_size: u64,
    pub batch_mode: BatchMode,
    pub filter: CompletionFilter,
    pub link_type: TypeFilter,
    pub import_type: LinkType,
    pub convert_iso: bool,
    pub iso2god_trim: bool,
    pub iso2god_threads: u32,
    pub overwrite: bool,
    pub transfer_retries: u32,
    pub request_timeout_secs: Option<u64>,
}

impl Settings {
    /// Defaults with every relative path anchored at `base`.
    pub fn with_base(base: &Path) -> Result<Self, GamelibError> {
        Self::from_file(SettingsFile::default(), base)
    }

    pub fn from_file(file: SettingsFile, base: &Path) -> Result<Self, GamelibError> {
        let logs_dir = match file.logs_dir {
            Some(path) => Some(anchor(base, path)?),
            None => default_logs_dir(),
        };
        Ok(Self {
            catalog_path: anchor(
                base,
                file.catalog_path.unwrap_or_else(|| "catalog.json".into()),
            )?,
            downloads_dir: anchor(base, file.downloads_dir.unwrap_or_else(|| "downloads".into()))?,
            temp_dir: anchor(base, file.temp_dir.unwrap_or_else(|| "temp".into()))?,
            output_dir: anchor(base, file.output_dir.unwrap_or_else(|| "output".into()))?,
            logs_dir,
            batch_size: file.batch_size.unwrap_or(DEFAULT_BATCH_SIZE),
            batch_mode: file.batch_mode.unwrap_or_default(),
            filter: file.filter.unwrap_or_default(),
            link_type: file.link_type.unwrap_or_default(),
            import_type: file.import_type.unwrap_or(LinkType::Iso),
            convert_iso: file.convert_iso.unwrap_or(true),
            iso2god_trim: file.iso2god_trim.unwrap_or(true),
            iso2god_threads: file.iso2god_threads.unwrap_or(4).max(1),
            overwrite: file.overwrite.unwrap_or(false),
            transfer_retries: file.transfer_retries.unwrap_or(0),
            request_timeout_secs: file.request_timeout_secs,
        })
    }

    /// Budget handed to the planner: an entry count or a byte total.
    pub fn batch_budget(&self) -> u64 {
        batch_budget(self.batch_mode, self.batch_size)
    }

    pub fn entry_filter(&self) -> EntryFilter {
        EntryFilter::new(self.link_type, self.filter)
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::new(
            self.downloads_dir.clone(),
            self.temp_dir.clone(),
            self.output_dir.clone(),
        )
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            convert_iso: self.convert_iso,
            overwrite: self.overwrite,
            transfer_retries: self.transfer_retries,
        }
    }
}

pub fn batch_budget(mode: BatchMode, batch_size: u64) -> u64 {
    match mode {
        BatchMode::ByCount => batch_size,
        BatchMode::BySize => batch_size.saturating_mul(MIB),
    }
}

pub struct SettingsLoader;

impl SettingsLoader {
    /// Reads settings once at startup. Without an explicit path a missing
    /// `gamelib.json` in the current directory falls back to defaults.
    pub fn resolve(path: Option<&str>) -> Result<Settings, GamelibError> {
        let settings_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_SETTINGS_FILE),
        };
        let cwd =
            std::env::current_dir().map_err(|err| GamelibError::Filesystem(err.to_string()))?;

        if path.is_none() && !settings_path.exists() {
            return Settings::with_base(&cwd);
        }

        let content = fs::read_to_string(&settings_path)
            .map_err(|_| GamelibError::ConfigRead(settings_path.clone()))?;
        let file: SettingsFile = serde_json::from_str(&content)
            .map_err(|err| GamelibError::ConfigParse(err.to_string()))?;

        let base = settings_path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(|parent| cwd.join(parent))
            .unwrap_or(cwd);
        Settings::from_file(file, &base)
    }
}

fn anchor(base: &Path, path: PathBuf) -> Result<Utf8PathBuf, GamelibError> {
    let joined = if path.is_absolute() {
        path
    } else {
        base.join(path)
    };
    Utf8PathBuf::from_path_buf(joined)
        .map_err(|path| GamelibError::ConfigParse(format!("non-utf8 path: {}", path.display())))
}

fn default_logs_dir() -> Option<Utf8PathBuf> {
    ProjectDirs::from("", "", "gamelib")
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("logs")).ok())
}
