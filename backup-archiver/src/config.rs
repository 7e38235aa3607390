//! Configuration management for the backup archiver.
//!
//! Loads configuration from a TOML file; command line flags override it.

use crate::archive::{BackendKind, DEFAULT_COMPRESSION_LEVEL};
use crate::executor::BackupJob;
use crate::utils::errors::{ArchiverError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub job: JobConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Directory tree to archive
    #[serde(default)]
    pub root: PathBuf,

    /// Directory the archive is written to (created if missing)
    #[serde(default)]
    pub output_dir: PathBuf,

    /// Archive file name; defaults to `<root name>-backup.zip`
    #[serde(default)]
    pub archive_name: Option<String>,

    /// Only archive leaf files, no directory entries
    #[serde(default)]
    pub files_only: bool,

    /// Exclusion patterns (glob-style, relative to root)
    #[serde(default)]
    pub excludes: Vec<String>,

    /// Skip the output directory when it lies inside root
    #[serde(default = "default_true")]
    pub exclude_output_dir: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend tried first
    #[serde(default = "default_backend")]
    pub preferred: BackendKind,

    /// Path or name of the zip executable; empty or absent disables the
    /// external backend, "auto" searches PATH
    #[serde(default)]
    pub zip_command: Option<String>,

    /// Try the next backend when the preferred one fails or is unavailable
    #[serde(default = "default_true")]
    pub fallback: bool,

    /// Deflate level (0-9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// External tool timeout in seconds (0 = none)
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_true() -> bool {
    true
}

fn default_backend() -> BackendKind {
    BackendKind::External
}

fn default_compression_level() -> u32 {
    DEFAULT_COMPRESSION_LEVEL
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            output_dir: PathBuf::new(),
            archive_name: None,
            files_only: false,
            excludes: Vec::new(),
            exclude_output_dir: default_true(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            preferred: default_backend(),
            zip_command: None,
            fallback: default_true(),
            compression_level: default_compression_level(),
            timeout_secs: 0,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate the job section and produce an immutable job
    pub fn build_job(&self) -> Result<BackupJob> {
        self.job.build(&self.backend)
    }
}

impl JobConfig {
    /// Validate and resolve into a [`BackupJob`].
    ///
    /// The root must be an existing directory. Paths are made absolute and
    /// exclusion patterns are compiled once so bad patterns fail here.
    pub fn build(&self, backend: &BackendConfig) -> Result<BackupJob> {
        if self.root.as_os_str().is_empty() {
            return Err(ArchiverError::Config("job.root is required".to_string()));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ArchiverError::Config("job.output_dir is required".to_string()));
        }
        if backend.compression_level > 9 {
            return Err(ArchiverError::Config(format!(
                "compression_level must be 0-9, got {}",
                backend.compression_level
            )));
        }

        let root = std::fs::canonicalize(&self.root).map_err(|e| {
            ArchiverError::Config(format!("root directory {}: {}", self.root.display(), e))
        })?;
        if !root.is_dir() {
            return Err(ArchiverError::Config(format!(
                "root is not a directory: {}",
                root.display()
            )));
        }

        let output_dir = absolute(&self.output_dir)?;
        let archive_name = match &self.archive_name {
            Some(name) => checked_archive_name(name)?,
            None => default_archive_name(&root),
        };

        let job = BackupJob {
            archive_path: output_dir.join(archive_name),
            root,
            output_dir,
            files_only: self.files_only,
            excludes: self.excludes.clone(),
            exclude_output_dir: self.exclude_output_dir,
            backend: backend.clone(),
        };

        // Compile once to reject bad patterns up front
        job.path_filter(&job.output_dir)?;

        Ok(job)
    }
}

/// Absolute form of `path`, resolving symlinks when it already exists
fn absolute(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(resolved) => Ok(resolved),
        Err(_) => Ok(std::path::absolute(path)?),
    }
}

/// `<root name>-backup.zip`, with characters outside `[a-z0-9._-]` replaced
fn default_archive_name(root: &Path) -> String {
    let base = root
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let sanitized: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    let sanitized = sanitized.trim_matches(|c| c == '-' || c == '.');

    if sanitized.is_empty() {
        "root-backup.zip".to_string()
    } else {
        format!("{}-backup.zip", sanitized)
    }
}

/// A user supplied archive name must be a bare file name; `.zip` is appended if missing
fn checked_archive_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == "." || name == ".." {
        return Err(ArchiverError::Config(format!("invalid archive_name: {:?}", name)));
    }

    if name.to_ascii_lowercase().ends_with(".zip") {
        Ok(name.to_string())
    } else {
        Ok(format!("{}.zip", name))
    }
}
