use std::fs;
use std::io::Write;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use tempfile::Builder;

use crate::domain::{LinkEntry, archive_suffix, url_file_name};
use crate::error::GamelibError;

pub const CONVERTED_DIR: &str = "god_converted";

static UNSAFE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[<>:"/\\|?*\x00-\x1f]"#).expect("static pattern"));

/// Directory layout for one library: ephemeral download and temp trees plus
/// the organized output tree.
#[derive(Debug, Clone)]
pub struct Workspace {
    downloads_root: Utf8PathBuf,
    temp_root: Utf8PathBuf,
    output_root: Utf8PathBuf,
}

/// Per-entry working artifacts, owned by the pipeline for one entry's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingPaths {
    pub download: Utf8PathBuf,
    pub extract: Utf8PathBuf,
    pub convert: Utf8PathBuf,
}

impl Workspace {
    pub fn new(downloads_root: Utf8PathBuf, temp_root: Utf8PathBuf, output_root: Utf8PathBuf) -> Self {
        Self {
            downloads_root,
            temp_root,
            output_root,
        }
    }

    /// Conventional `downloads/`, `temp/` and `output/` under one root.
    pub fn under(root: &Utf8Path) -> Self {
        Self::new(
            root.join("downloads"),
            root.join("temp"),
            root.join("output"),
        )
    }

    pub fn downloads_root(&self) -> &Utf8Path {
        &self.downloads_root
    }

    pub fn temp_root(&self) -> &Utf8Path {
        &self.temp_root
    }

    pub fn output_root(&self) -> &Utf8Path {
        &self.output_root
    }

    pub fn ensure_roots(&self) -> Result<(), GamelibError> {
        for root in [&self.downloads_root, &self.temp_root, &self.output_root] {
            fs::create_dir_all(root.as_std_path())
                .map_err(|err| GamelibError::Filesystem(format!("create {root}: {err}")))?;
        }
        Ok(())
    }

    pub fn working_paths(&self, entry: &LinkEntry) -> WorkingPaths {
        let slug = entry_slug(entry);
        let suffix = url_file_name(&entry.url)
            .and_then(|name| archive_suffix(&name))
            .unwrap_or(".download");
        WorkingPaths {
            download: self.downloads_root.join(format!("{slug}{suffix}")),
            extract: self.temp_root.join(&slug),
            convert: self.temp_root.join(format!("{slug}.god")),
        }
    }

    /// Library destination: converted images go under `god_converted/`,
    /// everything else under a directory named after its link type.
    pub fn placement_dir(&self, entry: &LinkEntry, converted: bool) -> Utf8PathBuf {
        let name = sanitize_component(&entry.name);
        if converted {
            self.output_root.join(CONVERTED_DIR).join(name)
        } else {
            self.output_root.join(entry.link_type.as_str()).join(name)
        }
    }
}

pub fn entry_slug(entry: &LinkEntry) -> String {
    format!("{}-{}", entry.link_type, sanitize_component(&entry.name))
}

/// Makes a display name usable as a single path component on every
/// platform the library is copied to.
pub fn sanitize_component(name: &str) -> String {
    let replaced = UNSAFE_CHARS.replace_all(name.trim(), "_");
    let trimmed = replaced.trim_end_matches(['.', ' ']);
    match trimmed {
        "" | "." | ".." => "_".to_string(),
        value => value.to_string(),
    }
}

/// Writes `content` next to `path` and renames it into place, so readers
/// only ever see the old or the new document.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), GamelibError> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_str().is_empty())
        .unwrap_or_else(|| Utf8Path::new("."));
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
    let mut temp = Builder::new()
        .prefix(".gamelib-write")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
    Ok(())
}
