//! Archive backends.
//!
//! Three interchangeable ways to turn a list of [`FileEntry`] into a zip file:
//! - `ExternalTool`: the system `zip` executable fed a pre-filtered name list
//! - `NativeLibrary`: the `zip` crate's `ZipWriter`
//! - `InProcess`: the built-in Zip32 encoder in [`writer`]
//!
//! All three write the same members for the same entries and report every
//! problem through the job's [`ErrorCollector`].

pub mod external;
pub mod native;
pub mod verify;
pub mod writer;

use crate::executor::collector::{ErrorCollector, ErrorPhase};
use crate::fs::walker::{link_state, FileEntry, LinkState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub use external::ExternalZip;
pub use native::NativeZip;
pub use writer::InProcessZip;

/// Default deflate level used by every backend
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Backend selector used in configuration and on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// System `zip` executable
    External,
    /// `zip` crate
    Native,
    /// Built-in encoder
    InProcess,
}

impl BackendKind {
    /// Order in which variants are tried, starting from `self`
    pub fn fallback_chain(self) -> Vec<BackendKind> {
        let all = [BackendKind::External, BackendKind::Native, BackendKind::InProcess];
        let start = all.iter().position(|k| *k == self).unwrap_or(0);
        all[start..].to_vec()
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::External => write!(f, "external"),
            BackendKind::Native => write!(f, "native"),
            BackendKind::InProcess => write!(f, "in-process"),
        }
    }
}

/// A configured archive backend
#[derive(Debug, Clone)]
pub enum Backend {
    ExternalTool(ExternalZip),
    NativeLibrary(NativeZip),
    InProcess(InProcessZip),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::ExternalTool(_) => BackendKind::External,
            Backend::NativeLibrary(_) => BackendKind::Native,
            Backend::InProcess(_) => BackendKind::InProcess,
        }
    }

    /// Write `entries` into a fresh archive at `archive_path`.
    ///
    /// Any existing file at `archive_path` is replaced. Problems are recorded
    /// in `errors`; the return value is whether an archive file was produced.
    pub async fn produce(
        &self,
        root: &Path,
        entries: Arc<[FileEntry]>,
        archive_path: &Path,
        errors: &mut ErrorCollector,
        cancel: &CancellationToken,
    ) -> bool {
        if !remove_existing(archive_path, errors) {
            return false;
        }

        debug!("{} backend writing {} entries to {}", self.kind(), entries.len(), archive_path.display());

        match self {
            Backend::ExternalTool(zip) => zip.run(root, &entries, archive_path, errors, cancel).await,
            Backend::NativeLibrary(zip) => {
                let zip = zip.clone();
                run_blocking(archive_path, errors, cancel, move |path, local, cancel| {
                    zip.write(&entries, path, local, cancel)
                })
                .await
            }
            Backend::InProcess(zip) => {
                let zip = zip.clone();
                run_blocking(archive_path, errors, cancel, move |path, local, cancel| {
                    zip.write(&entries, path, local, cancel)
                })
                .await
            }
        }
    }
}

/// Run a blocking writer on the blocking pool with its own collector,
/// then merge its records back in order.
async fn run_blocking<F>(
    archive_path: &Path,
    errors: &mut ErrorCollector,
    cancel: &CancellationToken,
    write: F,
) -> bool
where
    F: FnOnce(&Path, &mut ErrorCollector, &CancellationToken) -> bool + Send + 'static,
{
    let path: PathBuf = archive_path.to_path_buf();
    let cancel = cancel.clone();

    let handle = tokio::task::spawn_blocking(move || {
        let mut local = ErrorCollector::new();
        let produced = write(&path, &mut local, &cancel);
        (produced, local)
    });

    match handle.await {
        Ok((produced, local)) => {
            errors.absorb(local);
            produced
        }
        Err(e) => {
            error!("Archive task failed: {}", e);
            errors.push_path(ErrorPhase::Write, archive_path, format!("archive task failed: {}", e));
            false
        }
    }
}

/// Whether an entry must be left out because its link target vanished after discovery
pub(crate) fn is_vanished_link(entry: &FileEntry) -> bool {
    if entry.is_symlink() && link_state(&entry.path) == LinkState::Broken {
        debug!("Skipping broken symlink: {}", entry.path.display());
        return true;
    }
    false
}

/// Delete a previous archive so the new one never merges with it
fn remove_existing(archive_path: &Path, errors: &mut ErrorCollector) -> bool {
    match std::fs::remove_file(archive_path) {
        Ok(()) => {
            debug!("Removed previous archive {}", archive_path.display());
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
        Err(e) => {
            errors.push_path(
                ErrorPhase::Write,
                archive_path,
                format!("cannot replace existing archive: {}", e),
            );
            false
        }
    }
}

/// Remove a half-written archive after a failed or cancelled run
pub(crate) fn discard_partial(archive_path: &Path) {
    if let Err(e) = std::fs::remove_file(archive_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!("Could not remove partial archive {}: {}", archive_path.display(), e);
        }
    }
}
