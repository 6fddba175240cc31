use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::GamelibError;
use crate::fs_util::{find_first_ext, remove_path};

/// Repacks an extracted disk image into the console-native container.
pub trait Converter: Send + Sync {
    /// Converts `image` into `output_dir`. The source image is left in place
    /// whatever the outcome.
    fn convert(&self, image: &Path, output_dir: &Path, title: &str) -> Result<(), GamelibError>;
}

/// Finds the disk image inside an extraction directory.
pub fn locate_image(extract_dir: &Path) -> Result<PathBuf, GamelibError> {
    find_first_ext(extract_dir, "iso").ok_or_else(|| {
        GamelibError::ConversionFailed(format!(
            "no .iso image found in {}",
            extract_dir.display()
        ))
    })
}

/// Drives the external `iso2god` tool.
#[derive(Debug, Clone)]
pub struct Iso2GodConverter {
    program: Option<PathBuf>,
    trim: bool,
    threads: u32,
}

impl Iso2GodConverter {
    pub fn new(trim: bool, threads: u32) -> Self {
        Self {
            program: find_in_path("iso2god"),
            trim,
            threads: threads.max(1),
        }
    }

    pub fn with_program(program: PathBuf, trim: bool, threads: u32) -> Self {
        Self {
            program: Some(program),
            trim,
            threads: threads.max(1),
        }
    }

    pub fn program(&self) -> Option<&Path> {
        self.program.as_deref()
    }

    fn args(&self, image: &Path, output_dir: &Path, title: &str) -> Vec<String> {
        let mut args = vec!["--game-title".to_string(), title.to_string()];
        if self.trim {
            args.push("--trim".to_string());
        }
        args.push("-j".to_string());
        args.push(self.threads.to_string());
        args.push(image.to_string_lossy().to_string());
        args.push(output_dir.to_string_lossy().to_string());
        args
    }
}

impl Converter for Iso2GodConverter {
    fn convert(&self, image: &Path, output_dir: &Path, title: &str) -> Result<(), GamelibError> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| GamelibError::MissingTool("iso2god".to_string()))?;
        if !image.is_file() {
            return Err(GamelibError::ConversionFailed(format!(
                "image not found: {}",
                image.display()
            )));
        }
        remove_path(output_dir)?;
        fs::create_dir_all(output_dir)
            .map_err(|err| GamelibError::ConversionFailed(err.to_string()))?;

        let args = self.args(image, output_dir, title);
        debug!(program = %program.display(), ?args, "running converter");
        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(|err| GamelibError::ConversionFailed(err.to_string()))?;
        if output.status.success() {
            return Ok(());
        }
        let _ = remove_path(output_dir);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("{} exited with {}", program.display(), output.status)
        } else {
            stderr
        };
        Err(GamelibError::ConversionFailed(message))
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
