use std::cell::Cell;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use flate2::read::GzDecoder;
use tar::EntryType;
use tracing::debug;
use zip::ZipArchive;

use crate::domain::archive_suffix;
use crate::error::GamelibError;
use crate::events::CancelToken;
use crate::fs_util::{copy_with_progress, remove_path};

/// Archive formats the unpack stage can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchiveKind::Zip => write!(f, "zip"),
            ArchiveKind::Tar => write!(f, "tar"),
            ArchiveKind::TarGz => write!(f, "tar.gz"),
        }
    }
}

impl ArchiveKind {
    /// Picks the format from the file name, falling back to the leading
    /// bytes when the name carries no known suffix.
    pub fn detect(path: &Path) -> Result<Self, GamelibError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        match archive_suffix(name) {
            Some(".zip") => return Ok(ArchiveKind::Zip),
            Some(".tar") => return Ok(ArchiveKind::Tar),
            Some(".tar.gz") | Some(".tgz") => return Ok(ArchiveKind::TarGz),
            Some(other) => return Err(GamelibError::UnsupportedFormat(other.to_string())),
            None => {}
        }
        Self::sniff(path)?.ok_or_else(|| GamelibError::UnsupportedFormat(name.to_string()))
    }

    fn sniff(path: &Path) -> Result<Option<Self>, GamelibError> {
        let mut head = Vec::with_capacity(512);
        File::open(path)
            .and_then(|file| file.take(512).read_to_end(&mut head))
            .map_err(|err| GamelibError::ExtractionFailed(format!("{}: {err}", path.display())))?;
        if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
            return Ok(Some(ArchiveKind::Zip));
        }
        if head.starts_with(&[0x1f, 0x8b]) {
            return Ok(Some(ArchiveKind::TarGz));
        }
        if head.len() >= 262 && &head[257..262] == b"ustar" {
            return Ok(Some(ArchiveKind::Tar));
        }
        Ok(None)
    }

    /// Extracts every entry of `archive` under `output_dir`, keeping relative
    /// paths. `on_progress(done, total)` reports uncompressed bytes for zip
    /// and consumed archive bytes for tar streams.
    pub fn extract(
        self,
        archive: &Path,
        output_dir: &Path,
        cancel: &CancelToken,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> Result<u64, GamelibError> {
        match self {
            ArchiveKind::Zip => extract_zip(archive, output_dir, cancel, on_progress),
            ArchiveKind::Tar => extract_tar(archive, output_dir, false, cancel, on_progress),
            ArchiveKind::TarGz => extract_tar(archive, output_dir, true, cancel, on_progress),
        }
    }
}

/// Detects the archive format and extracts it. A failed or cancelled
/// extraction removes the partially populated `output_dir`.
pub fn extract(
    archive: &Path,
    output_dir: &Path,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64, GamelibError> {
    let kind = ArchiveKind::detect(archive)?;
    fs::create_dir_all(output_dir).map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
    match kind.extract(archive, output_dir, cancel, on_progress) {
        Ok(bytes) => Ok(bytes),
        Err(err) => {
            let _ = cleanup(output_dir);
            match err {
                GamelibError::Cancelled => Err(GamelibError::Cancelled),
                GamelibError::ExtractionFailed(message) => {
                    Err(GamelibError::ExtractionFailed(message))
                }
                other => Err(GamelibError::ExtractionFailed(other.to_string())),
            }
        }
    }
}

/// Removes a working directory tree if present.
pub fn cleanup(dir: &Path) -> Result<(), GamelibError> {
    remove_path(dir)
}

fn extract_zip(
    zip_path: &Path,
    target_dir: &Path,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64, GamelibError> {
    let file = File::open(zip_path).map_err(|err| {
        GamelibError::ExtractionFailed(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive = ZipArchive::new(BufReader::new(file))
        .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;

    let mut total = 0u64;
    for i in 0..archive.len() {
        let entry = archive
            .by_index(i)
            .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
        total += entry.size();
    }
    let total = (total > 0).then_some(total);

    let mut extracted = 0u64;
    on_progress(0, total);
    for i in 0..archive.len() {
        if cancel.is_cancelled() {
            return Err(GamelibError::Cancelled);
        }
        let mut entry = archive
            .by_index(i)
            .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(GamelibError::ExtractionFailed(format!(
                    "zip entry path traversal detected: {}",
                    entry.name()
                )));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
        }
        let outfile = File::create(&entry_path)
            .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
        let mut writer = BufWriter::new(outfile);
        let base = extracted;
        let written = copy_with_progress(&mut entry, &mut writer, cancel, |done| {
            on_progress(base + done, total)
        })?;
        extracted += written;
    }
    Ok(extracted)
}

fn extract_tar(
    tar_path: &Path,
    target_dir: &Path,
    gzip: bool,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64, GamelibError> {
    let file = File::open(tar_path).map_err(|err| {
        GamelibError::ExtractionFailed(format!("open tar {}: {err}", tar_path.display()))
    })?;
    let total = file
        .metadata()
        .map(|meta| meta.len())
        .ok()
        .filter(|len| *len > 0);
    let consumed = Rc::new(Cell::new(0u64));
    let reader = CountingReader {
        inner: BufReader::new(file),
        count: Rc::clone(&consumed),
    };
    let stream: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let mut archive = tar::Archive::new(stream);
    let entries = archive
        .entries()
        .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
    let mut extracted = 0u64;
    on_progress(0, total);
    for entry in entries {
        if cancel.is_cancelled() {
            return Err(GamelibError::Cancelled);
        }
        let mut entry = entry.map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
        let raw_path = entry
            .path()
            .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?
            .into_owned();
        let relative = enclosed_path(&raw_path).ok_or_else(|| {
            GamelibError::ExtractionFailed(format!(
                "tar entry path traversal detected: {}",
                raw_path.display()
            ))
        })?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let out = target_dir.join(&relative);
        let kind = entry.header().entry_type();

        match kind {
            EntryType::Directory => {
                fs::create_dir_all(&out)
                    .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent)
                        .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
                }
                let outfile = File::create(&out)
                    .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
                let mut writer = BufWriter::new(outfile);
                extracted += copy_with_progress(&mut entry, &mut writer, cancel, |_| {
                    on_progress(consumed.get(), total)
                })?;
            }
            EntryType::Symlink | EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?
                    .map(|link| link.into_owned())
                    .unwrap_or_default();
                if enclosed_path(&link).is_none() {
                    return Err(GamelibError::ExtractionFailed(format!(
                        "tar link escapes the extraction directory: {} -> {}",
                        raw_path.display(),
                        link.display()
                    )));
                }
                let unpacked = entry
                    .unpack_in(target_dir)
                    .map_err(|err| GamelibError::ExtractionFailed(err.to_string()))?;
                if !unpacked {
                    return Err(GamelibError::ExtractionFailed(format!(
                        "tar entry path traversal detected: {}",
                        raw_path.display()
                    )));
                }
            }
            other => {
                debug!(path = %raw_path.display(), kind = ?other, "skipping tar entry");
            }
        }
        on_progress(consumed.get(), total);
    }
    Ok(extracted)
}

/// Normalizes an archive path that stays below the extraction root. Absolute
/// paths and `..` components yield `None`.
fn enclosed_path(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

struct CountingReader<R> {
    inner: R,
    count: Rc<Cell<u64>>,
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.count.set(self.count.get() + read as u64);
        Ok(read)
    }
}
