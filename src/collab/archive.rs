//! Zip archiver: packs the safe files of one device into a single artifact.

#![allow(missing_docs)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};

use chrono::Local;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::core::config::ArchiveConfig;
use crate::core::errors::{Result, SafegateError};
use crate::pipeline::collaborators::Archiver;

/// Attempts at a distinct archive name before giving up.
const MAX_NAME_ATTEMPTS: u32 = 100;

pub struct ZipArchiver {
    output_dir: PathBuf,
    name_prefix: String,
    blocked_extensions: Vec<String>,
}

impl ZipArchiver {
    #[must_use]
    pub fn new(
        output_dir: impl Into<PathBuf>,
        name_prefix: impl Into<String>,
        blocked_extensions: Vec<String>,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            name_prefix: name_prefix.into(),
            blocked_extensions,
        }
    }

    #[must_use]
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self::new(
            config.output_dir.clone(),
            config.name_prefix.clone(),
            config.blocked_extensions.clone(),
        )
    }

    fn is_blocked(&self, path: &Path) -> bool {
        let Some(ext) = path.extension() else {
            return false;
        };
        let dotted = format!(".{}", ext.to_string_lossy().to_lowercase());
        self.blocked_extensions.iter().any(|b| *b == dotted)
    }

    /// Create `<prefix>_<YYYYmmdd_HHMMSS>.zip`, suffixing `_N` on collision.
    fn create_target(&self) -> Result<(PathBuf, File)> {
        fs::create_dir_all(&self.output_dir)
            .map_err(|e| SafegateError::io(&self.output_dir, e))?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{}_{stamp}.zip", self.name_prefix)
            } else {
                format!("{}_{stamp}_{attempt}.zip", self.name_prefix)
            };
            let path = self.output_dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(SafegateError::io(&path, e)),
            }
        }
        Err(SafegateError::collaborator(
            "archive",
            format!("no free archive name in {}", self.output_dir.display()),
        ))
    }

    fn try_archive(&self, files: &[PathBuf]) -> Result<PathBuf> {
        let kept: Vec<&Path> = files
            .iter()
            .map(PathBuf::as_path)
            .filter(|path| {
                let blocked = self.is_blocked(path);
                if blocked {
                    eprintln!("[SG-WORKER] blocked file type, not archived: {}", path.display());
                }
                !blocked
            })
            .collect();
        if kept.is_empty() {
            return Err(SafegateError::collaborator("archive", "no archivable files"));
        }

        let (target, file) = self.create_target()?;
        let base = common_parent(&kept);
        if let Err(e) = write_zip(file, &kept, &base) {
            let _ = fs::remove_file(&target);
            return Err(SafegateError::collaborator(
                "archive",
                format!("writing {}: {e}", target.display()),
            ));
        }
        Ok(target)
    }
}

impl Archiver for ZipArchiver {
    fn archive(&self, files: &[PathBuf]) -> Option<PathBuf> {
        match self.try_archive(files) {
            Ok(path) => {
                let size = fs::metadata(&path).map_or(0, |m| m.len());
                eprintln!("[SG-WORKER] created archive {} ({size} bytes)", path.display());
                Some(path)
            }
            Err(e) => {
                eprintln!("[SG-WORKER] archive creation failed: {e}");
                None
            }
        }
    }
}

fn write_zip(file: File, files: &[&Path], base: &Path) -> zip::result::ZipResult<()> {
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .large_file(true);

    for path in files {
        let mut source = match File::open(path) {
            Ok(source) => source,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                eprintln!("[SG-WORKER] file vanished, skipping: {}", path.display());
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        zip.start_file(entry_name(path, base), options)?;
        io::copy(&mut source, &mut zip)?;
    }
    zip.finish()?;
    Ok(())
}

/// Deepest directory containing every input.
fn common_parent(files: &[&Path]) -> PathBuf {
    let mut base = files
        .first()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_default();
    while !files.iter().all(|p| p.starts_with(&base)) {
        if !base.pop() {
            break;
        }
    }
    base
}

/// Archive entry name: path below `base`, `/`-separated.
fn entry_name(path: &Path, base: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}
