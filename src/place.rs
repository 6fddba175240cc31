use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use tempfile::Builder;
use tracing::debug;

use crate::error::GamelibError;
use crate::events::CancelToken;
use crate::fs_util::{copy_with_progress, dir_size, remove_path, walk_dir};

/// Copies finalized content into `destination`. The copy is staged in a
/// sibling temporary directory and renamed into place once complete, so an
/// interrupted placement never leaves a half-populated library entry.
///
/// An existing destination is rejected with `AlreadyPlaced` unless
/// `overwrite` is set. A single file is placed inside `destination`.
pub fn place(
    source: &Path,
    destination: &Path,
    overwrite: bool,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64, GamelibError> {
    if destination.exists() && !overwrite {
        return Err(GamelibError::AlreadyPlaced(destination.to_path_buf()));
    }
    if !source.exists() {
        return Err(GamelibError::PlacementFailed(format!(
            "source missing: {}",
            source.display()
        )));
    }
    let parent = destination.parent().ok_or_else(|| {
        GamelibError::PlacementFailed(format!("invalid destination {}", destination.display()))
    })?;
    fs::create_dir_all(parent).map_err(|err| GamelibError::PlacementFailed(err.to_string()))?;

    let staging = Builder::new()
        .prefix(".gamelib-place")
        .tempdir_in(parent)
        .map_err(|err| GamelibError::PlacementFailed(err.to_string()))?;

    let copied = if source.is_dir() {
        copy_tree(source, staging.path(), cancel, on_progress)?
    } else {
        let name = source.file_name().ok_or_else(|| {
            GamelibError::PlacementFailed(format!("invalid source {}", source.display()))
        })?;
        let total = fs::metadata(source)
            .map_err(|err| GamelibError::PlacementFailed(err.to_string()))?
            .len();
        on_progress(0, Some(total));
        copy_file(source, &staging.path().join(name), 0, Some(total), cancel, on_progress)?
    };

    if destination.exists() {
        remove_path(destination)?;
    }
    let staged = staging.keep();
    if let Err(err) = fs::rename(&staged, destination) {
        let _ = remove_path(&staged);
        return Err(GamelibError::PlacementFailed(format!(
            "rename into {}: {err}",
            destination.display()
        )));
    }
    Ok(copied)
}

fn copy_tree(
    source: &Path,
    target: &Path,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64, GamelibError> {
    let total = dir_size(source)?;
    let total = (total > 0).then_some(total);
    on_progress(0, total);
    let mut copied = 0u64;
    for entry in walk_dir(source)? {
        let relative = entry
            .strip_prefix(source)
            .map_err(|err| GamelibError::PlacementFailed(err.to_string()))?;
        let out = target.join(relative);
        let file_type = fs::symlink_metadata(&entry)
            .map_err(|err| GamelibError::PlacementFailed(err.to_string()))?
            .file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&out).map_err(|err| GamelibError::PlacementFailed(err.to_string()))?;
        } else if file_type.is_file() {
            copied = copy_file(&entry, &out, copied, total, cancel, on_progress)?;
        } else {
            debug!(path = %entry.display(), "skipping non-regular file");
        }
    }
    Ok(copied)
}

fn copy_file(
    from: &Path,
    to: &Path,
    base: u64,
    total: Option<u64>,
    cancel: &CancelToken,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64, GamelibError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| GamelibError::PlacementFailed(err.to_string()))?;
    }
    let reader = File::open(from).map_err(|err| GamelibError::PlacementFailed(err.to_string()))?;
    let writer = File::create(to).map_err(|err| GamelibError::PlacementFailed(err.to_string()))?;
    let written = copy_with_progress(
        &mut BufReader::new(reader),
        &mut BufWriter::new(writer),
        cancel,
        |done| on_progress(base + done, total),
    )?;
    Ok(base + written)
}
