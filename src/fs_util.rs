use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::GamelibError;
use crate::events::CancelToken;

pub const CHUNK_SIZE: usize = 64 * 1024;

/// Copies `reader` into `writer` in fixed-size chunks, polling `cancel`
/// before every chunk and reporting the running byte count after it.
pub fn copy_with_progress<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancelToken,
    mut on_chunk: F,
) -> Result<u64, GamelibError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
    F: FnMut(u64),
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut copied = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(GamelibError::Cancelled);
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(GamelibError::Filesystem(err.to_string())),
        };
        writer
            .write_all(&buffer[..read])
            .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
        copied += read as u64;
        on_chunk(copied);
    }
    writer
        .flush()
        .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
    Ok(copied)
}

/// Lists everything below `root`, sorted. Symlinks are listed but never
/// followed.
pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, GamelibError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| GamelibError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| GamelibError::Filesystem(err.to_string()))?;
            let file_type = entry
                .file_type()
                .map_err(|err| GamelibError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

/// Total size of the regular files below `root`.
pub fn dir_size(root: &Path) -> Result<u64, GamelibError> {
    let mut total = 0u64;
    for path in walk_dir(root)? {
        let meta =
            fs::symlink_metadata(&path).map_err(|err| GamelibError::Filesystem(err.to_string()))?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

/// Removes a file or directory tree. Absent paths are not an error.
pub fn remove_path(path: &Path) -> Result<(), GamelibError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(GamelibError::Filesystem(format!(
            "remove {}: {err}",
            path.display()
        ))),
    }
}

pub fn find_first_ext(root: &Path, ext: &str) -> Option<PathBuf> {
    let mut stack = vec![root.to_path_buf()];
    let mut found = Vec::new();
    while let Some(path) = stack.pop() {
        let Ok(entries) = fs::read_dir(&path) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file()
                && path
                    .extension()
                    .and_then(|value| value.to_str())
                    .map(|value| value.eq_ignore_ascii_case(ext))
                    .unwrap_or(false)
            {
                found.push(path);
            }
        }
    }
    found.sort();
    found.into_iter().next()
}
