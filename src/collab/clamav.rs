//! ClamAV-backed scanner: walks the mount point, then runs `clamscan` over it.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::core::config::ScannerConfig;
use crate::core::errors::{Result, SafegateError};
use crate::pipeline::collaborators::{InfectedFile, ScanReport, Scanner};

const MIB: u64 = 1024 * 1024;

/// Largest `--max-filesize`/`--max-scansize` clamscan accepts, in MiB.
const CLAMSCAN_LIMIT_CAP_MB: u64 = 4000;

pub struct ClamScanner {
    command: String,
    max_file_size: u64,
    max_files: usize,
}

impl ClamScanner {
    #[must_use]
    pub fn new(command: impl Into<String>, max_file_size: u64, max_files: usize) -> Self {
        Self {
            command: command.into(),
            max_file_size,
            max_files,
        }
    }

    #[must_use]
    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(
            config.command.clone(),
            config.max_file_size_mb.saturating_mul(MIB),
            config.max_files,
        )
    }

    /// Files above this size are neither scanned nor collected.
    fn size_limit(&self) -> u64 {
        self.max_file_size.min(CLAMSCAN_LIMIT_CAP_MB * MIB)
    }

    /// clamscan's size limits track the walk limit; its defaults (25M per
    /// file, 100M per scan) are lower.
    fn clamscan_args(&self, dir: &Path) -> Vec<OsString> {
        let limit_mb = self.size_limit().div_ceil(MIB).max(1);
        let mut args: Vec<OsString> = ["--no-summary", "--infected", "-r"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(format!("--max-filesize={limit_mb}M").into());
        args.push(format!("--max-scansize={limit_mb}M").into());
        args.push(dir.as_os_str().to_os_string());
        args
    }

    fn run_clamscan(&self, dir: &Path) -> Result<Vec<InfectedFile>> {
        let output = Command::new(&self.command)
            .args(self.clamscan_args(dir))
            .output()
            .map_err(|e| {
                if e.kind() == ErrorKind::NotFound {
                    SafegateError::CommandUnavailable {
                        command: self.command.clone(),
                        details: e.to_string(),
                    }
                } else {
                    SafegateError::collaborator("scan", format!("cannot run {}: {e}", self.command))
                }
            })?;

        match output.status.code() {
            Some(0) => Ok(Vec::new()),
            Some(1) => Ok(parse_clamscan_output(&String::from_utf8_lossy(&output.stdout))),
            code => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(SafegateError::collaborator(
                    "scan",
                    format!(
                        "{} exited with {}: {}",
                        self.command,
                        code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                        stderr.trim()
                    ),
                ))
            }
        }
    }
}

impl Scanner for ClamScanner {
    fn scan(&self, dir: &Path) -> Result<ScanReport> {
        let files = collect_files(dir, self.max_files, self.size_limit())?;
        let infected = self.run_clamscan(dir)?;

        let flagged: HashSet<&Path> = infected.iter().map(|f| f.path.as_path()).collect();
        let safe = files
            .into_iter()
            .filter(|path| !flagged.contains(path.as_path()))
            .collect();
        Ok(ScanReport { infected, safe })
    }
}

/// Regular files under `root`, depth-first, without following symlinks.
/// Files larger than `max_size` are left out.
fn collect_files(root: &Path, max_files: usize, max_size: u64) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if dir == root => return Err(SafegateError::io(&dir, e)),
            Err(e) => {
                eprintln!("[SG-WORKER] skipping unreadable directory {}: {e}", dir.display());
                continue;
            }
        };
        for entry in entries.flatten() {
            let Ok(meta) = entry.path().symlink_metadata() else {
                continue;
            };
            let path = entry.path();
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                if meta.len() > max_size {
                    eprintln!("[SG-WORKER] skipping oversized file {}", path.display());
                    continue;
                }
                files.push(path);
                if files.len() >= max_files {
                    eprintln!("[SG-WORKER] file limit {max_files} reached under {}", root.display());
                    files.sort();
                    return Ok(files);
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Parse `<path>: <signature> FOUND` lines.
fn parse_clamscan_output(stdout: &str) -> Vec<InfectedFile> {
    stdout
        .lines()
        .filter_map(|line| {
            let body = line.trim_end().strip_suffix(" FOUND")?;
            let (path, signature) = body.rsplit_once(": ")?;
            Some(InfectedFile {
                path: PathBuf::from(path),
                signature: signature.to_string(),
            })
        })
        .collect()
}
