//! Job-scoped accumulator for non-fatal problems.
//!
//! Enumeration and every archive backend report through an `ErrorCollector`
//! instead of returning errors up the stack. The coordinator resets it at the
//! start of each run and reads it once the run is over.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Stage of the run an error originated from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPhase {
    /// Walking the root tree (stat, read_dir)
    Discovery,
    /// Adding members or finalizing the archive
    Write,
}

impl fmt::Display for ErrorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPhase::Discovery => write!(f, "discovery"),
            ErrorPhase::Write => write!(f, "write"),
        }
    }
}

/// A single recorded problem
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub phase: ErrorPhase,
    pub message: String,

    /// Filesystem path the problem relates to, when there is one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    pub recorded_at: DateTime<Utc>,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "[{}] {}: {}", self.phase, path.display(), self.message),
            None => write!(f, "[{}] {}", self.phase, self.message),
        }
    }
}

/// Append-only error and warning lists for one job
#[derive(Debug, Clone, Default)]
pub struct ErrorCollector {
    errors: Vec<ErrorRecord>,
    warnings: Vec<String>,
}

impl ErrorCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error that is not tied to a particular path
    pub fn push(&mut self, phase: ErrorPhase, message: impl Into<String>) {
        self.record(phase, None, message.into());
    }

    /// Record an error for a specific filesystem path
    pub fn push_path(&mut self, phase: ErrorPhase, path: &Path, message: impl Into<String>) {
        self.record(phase, Some(path.to_path_buf()), message.into());
    }

    fn record(&mut self, phase: ErrorPhase, path: Option<PathBuf>, message: String) {
        let record = ErrorRecord {
            phase,
            message,
            path,
            recorded_at: Utc::now(),
        };
        warn!("{}", record);
        self.errors.push(record);
    }

    /// Record a diagnostic that does not count as a failure
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!("warning: {}", message);
        self.warnings.push(message);
    }

    /// Move every record from `other` into this collector, preserving order
    pub fn absorb(&mut self, other: ErrorCollector) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Error messages in the order they were recorded
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Number of errors recorded for one phase
    pub fn count(&self, phase: ErrorPhase) -> usize {
        self.errors.iter().filter(|e| e.phase == phase).count()
    }

    /// Clear everything; called at the start of each job
    pub fn reset(&mut self) {
        self.errors.clear();
        self.warnings.clear();
    }
}
