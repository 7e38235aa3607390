//! Backup coordinator - Orchestrates one archive run.
//!
//! This module ties together:
//! - Output directory preparation
//! - File discovery through the path filter
//! - Backend selection with fallback
//! - Archive verification
//! - Lifecycle event emission

pub mod collector;
pub mod events;

use crate::archive::verify::verify_members;
use crate::archive::{Backend, BackendKind, ExternalZip, InProcessZip, NativeZip};
use crate::config::BackendConfig;
use crate::fs::filter::PathFilter;
use crate::fs::walker::{collect_entries, link_state, FileEntry, LinkState};
use chrono::{DateTime, Utc};
use collector::{ErrorCollector, ErrorPhase, ErrorRecord};
use events::{BackupEvent, BackupObserver};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Validated, immutable description of one backup job
#[derive(Debug, Clone)]
pub struct BackupJob {
    /// Canonical root directory
    pub root: PathBuf,

    /// Absolute output directory
    pub output_dir: PathBuf,

    /// Where the archive is written
    pub archive_path: PathBuf,

    pub files_only: bool,
    pub excludes: Vec<String>,
    pub exclude_output_dir: bool,
    pub backend: BackendConfig,
}

impl BackupJob {
    pub fn archive_filepath(&self) -> &Path {
        &self.archive_path
    }

    /// Build the path filter, given the output directory as it resolves on disk
    pub fn path_filter(&self, output_dir: &Path) -> Result<PathFilter, globset::Error> {
        let mut protected = vec![self.archive_path.clone()];

        if let Some(name) = self.archive_path.file_name() {
            let resolved = output_dir.join(name);
            if resolved != self.archive_path {
                protected.push(resolved);
            }
        }

        if self.exclude_output_dir && output_dir != self.root && output_dir.starts_with(&self.root) {
            protected.push(output_dir.to_path_buf());
        }

        PathFilter::new(&self.excludes, protected, self.files_only)
    }

    /// Backends to try, in order, or the reason a variant is skipped
    fn backend_chain(&self) -> Vec<(BackendKind, Option<Backend>)> {
        let kinds = if self.backend.fallback {
            self.backend.preferred.fallback_chain()
        } else {
            vec![self.backend.preferred]
        };

        kinds
            .into_iter()
            .map(|kind| (kind, self.backend_for(kind)))
            .collect()
    }

    fn backend_for(&self, kind: BackendKind) -> Option<Backend> {
        let level = self.backend.compression_level;
        match kind {
            BackendKind::External => self
                .backend
                .zip_command
                .as_deref()
                .and_then(ExternalZip::from_setting)
                .map(|zip| {
                    Backend::ExternalTool(
                        zip.with_compression_level(level)
                            .with_timeout(self.backend.timeout()),
                    )
                }),
            BackendKind::Native => Some(Backend::NativeLibrary(NativeZip::new(level))),
            BackendKind::InProcess => Some(Backend::InProcess(InProcessZip::new(level))),
        }
    }
}

/// Outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub run_id: String,
    pub archive_path: PathBuf,

    /// Backend that produced the archive (or the last one tried)
    pub backend: Option<BackendKind>,

    /// Whether the archive file was produced
    pub success: bool,

    /// Members found in the archive
    pub members: usize,

    pub errors: Vec<ErrorRecord>,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BackupReport {
    pub fn archive_exists(&self) -> bool {
        self.archive_path.is_file()
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }

    /// Archive produced and nothing went wrong
    pub fn is_clean(&self) -> bool {
        self.success && self.errors.is_empty()
    }
}

/// What the archive phase ended with
struct ArchiveOutcome {
    backend: Option<BackendKind>,
    produced: bool,
    members: usize,
}

/// Drives a [`BackupJob`] through discovery and archiving
pub struct BackupCoordinator {
    job: BackupJob,
    errors: ErrorCollector,
    observer: Option<Arc<dyn BackupObserver>>,
    cancel_token: CancellationToken,
}

impl BackupCoordinator {
    pub fn new(job: BackupJob) -> Self {
        Self {
            job,
            errors: ErrorCollector::new(),
            observer: None,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Attach an observer for lifecycle events
    pub fn with_observer(mut self, observer: Arc<dyn BackupObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Use an external token to cancel a running job
    pub fn with_cancel(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    pub fn job(&self) -> &BackupJob {
        &self.job
    }

    pub fn archive_filepath(&self) -> &Path {
        self.job.archive_filepath()
    }

    pub fn archive_exists(&self) -> bool {
        self.job.archive_path.is_file()
    }

    /// Errors from the most recent run
    pub fn errors(&self) -> &[ErrorRecord] {
        self.errors.errors()
    }

    pub fn warnings(&self) -> &[String] {
        self.errors.warnings()
    }

    /// Run the job once. Never fails: problems end up in the report's error list.
    pub async fn run(&mut self) -> BackupReport {
        let run_id = Uuid::new_v4().to_string();
        let span = info_span!("backup", run_id = %run_id);
        self.execute(run_id).instrument(span).await
    }

    async fn execute(&mut self, run_id: String) -> BackupReport {
        let started_at = Utc::now();
        self.errors.reset();

        info!(
            "Starting backup of {} into {}",
            self.job.root.display(),
            self.job.archive_path.display()
        );
        self.emit(BackupEvent::BackupStarted {
            run_id: run_id.clone(),
            root: self.job.root.clone(),
        });

        let outcome = self.archive(&run_id).await;
        let success = outcome.produced && self.archive_exists();

        if success {
            info!(
                "Backup completed: {} members, {} error(s), archive {}",
                outcome.members,
                self.errors.len(),
                self.job.archive_path.display()
            );
            self.emit(BackupEvent::BackupCompleted {
                run_id: run_id.clone(),
                archive_path: self.job.archive_path.clone(),
                members: outcome.members,
                errors: self.errors.len(),
            });
        } else {
            let error = self
                .errors
                .errors()
                .last()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "archive was not produced".to_string());
            warn!("Backup failed: {}", error);
            self.emit(BackupEvent::BackupFailed {
                run_id: run_id.clone(),
                error,
            });
        }

        BackupReport {
            run_id,
            archive_path: self.job.archive_path.clone(),
            backend: outcome.backend,
            success,
            members: outcome.members,
            errors: self.errors.errors().to_vec(),
            warnings: self.errors.warnings().to_vec(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    async fn archive(&mut self, run_id: &str) -> ArchiveOutcome {
        let mut outcome = ArchiveOutcome {
            backend: None,
            produced: false,
            members: 0,
        };

        let Some(output_dir) = self.prepare_output_dir() else {
            return outcome;
        };

        let filter = match self.job.path_filter(&output_dir) {
            Ok(filter) => filter,
            Err(e) => {
                self.errors.push(ErrorPhase::Discovery, format!("invalid exclusion pattern: {}", e));
                return outcome;
            }
        };

        let entries: Arc<[FileEntry]> = match self.discover(filter).await {
            Some(entries) => entries.into(),
            None => return outcome,
        };
        info!("Discovered {} entries under {}", entries.len(), self.job.root.display());

        let chain = self.job.backend_chain();
        let mut previous: Option<BackendKind> = None;

        for (kind, backend) in chain {
            let Some(backend) = backend else {
                info!("{} backend unavailable (no zip command configured or found), skipping", kind);
                continue;
            };

            if self.cancel_token.is_cancelled() {
                self.errors.push(ErrorPhase::Write, "archive cancelled");
                break;
            }

            if let Some(from) = previous {
                info!("Falling back from {} to {} backend", from, kind);
                self.emit(BackupEvent::ArchiveFallback {
                    run_id: run_id.to_string(),
                    from,
                    to: kind,
                });
            }

            self.emit(BackupEvent::ArchiveStarted {
                run_id: run_id.to_string(),
                backend: kind,
                entries: entries.len(),
            });

            let write_errors_before = self.errors.count(ErrorPhase::Write);
            let produced = backend
                .produce(
                    &self.job.root,
                    Arc::clone(&entries),
                    &self.job.archive_path,
                    &mut self.errors,
                    &self.cancel_token,
                )
                .await;

            outcome.backend = Some(kind);
            outcome.produced = produced;

            if produced {
                // Only cross-check a clean write; failed members are already recorded
                outcome.members = if self.errors.count(ErrorPhase::Write) == write_errors_before {
                    let expected = expected_members(&entries);
                    verify_members(&self.job.archive_path, &expected, &mut self.errors).unwrap_or(0)
                } else {
                    crate::archive::verify::list_members(&self.job.archive_path)
                        .map(|m| m.len())
                        .unwrap_or(0)
                };
            }

            self.emit(BackupEvent::ArchiveCompleted {
                run_id: run_id.to_string(),
                backend: kind,
                produced,
            });

            if produced || self.cancel_token.is_cancelled() {
                break;
            }
            previous = Some(kind);
        }

        if outcome.backend.is_none() && !self.cancel_token.is_cancelled() {
            self.errors.push(ErrorPhase::Write, "no archive backend available");
        }

        outcome
    }

    /// Make sure the output directory exists and is writable; returns its resolved path
    fn prepare_output_dir(&mut self) -> Option<PathBuf> {
        let dir = &self.job.output_dir;

        if let Err(e) = std::fs::create_dir_all(dir) {
            self.errors.push_path(ErrorPhase::Write, dir, format!("cannot create output directory: {}", e));
            return None;
        }

        let probe = dir.join(format!(".backup-archiver-probe-{}", std::process::id()));
        let writable = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&probe)
            .and_then(|_| std::fs::remove_file(&probe));

        if let Err(e) = writable {
            self.errors.push_path(ErrorPhase::Write, dir, format!("output directory is not writable: {}", e));
            return None;
        }

        Some(std::fs::canonicalize(dir).unwrap_or_else(|_| dir.clone()))
    }

    /// Walk the root on the blocking pool
    async fn discover(&mut self, filter: PathFilter) -> Option<Vec<FileEntry>> {
        let root = self.job.root.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let mut local = ErrorCollector::new();
            let entries = collect_entries(&root, &filter, &mut local);
            (entries, local)
        });

        match handle.await {
            Ok((entries, local)) => {
                self.errors.absorb(local);
                Some(entries)
            }
            Err(e) => {
                self.errors.push_path(ErrorPhase::Discovery, &self.job.root, format!("scan task failed: {}", e));
                None
            }
        }
    }

    fn emit(&self, event: BackupEvent) {
        if let Some(observer) = &self.observer {
            observer.notify(&event);
        }
    }
}

/// Member names the archive should contain, leaving out links that broke since discovery
fn expected_members(entries: &[FileEntry]) -> Vec<String> {
    entries
        .iter()
        .filter(|e| !(e.is_symlink() && link_state(&e.path) == LinkState::Broken))
        .map(FileEntry::member_name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobConfig;
    use events::FnObserver;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn job(root: &Path, output_dir: &Path, preferred: BackendKind) -> BackupJob {
        let config = JobConfig {
            root: root.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            ..JobConfig::default()
        };
        let backend = BackendConfig {
            preferred,
            ..BackendConfig::default()
        };
        config.build(&backend).unwrap()
    }

    fn fixture() -> (TempDir, PathBuf, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("site");
        let out = temp_dir.path().join("out");
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("index.html"), b"<html></html>").unwrap();
        fs::write(root.join("docs/guide.txt"), b"guide").unwrap();
        (temp_dir, root, out)
    }

    #[tokio::test]
    async fn test_run_produces_archive() {
        let (_temp, root, out) = fixture();
        let mut coordinator = BackupCoordinator::new(job(&root, &out, BackendKind::Native));

        let report = coordinator.run().await;

        assert!(report.success);
        assert!(report.is_clean());
        assert_eq!(report.backend, Some(BackendKind::Native));
        assert_eq!(report.members, 3);
        assert!(coordinator.archive_exists());
        assert!(coordinator.errors().is_empty());
    }

    #[tokio::test]
    async fn test_external_without_command_falls_back() {
        let (_temp, root, out) = fixture();
        let mut coordinator = BackupCoordinator::new(job(&root, &out, BackendKind::External));

        let report = coordinator.run().await;

        assert!(report.success);
        assert_eq!(report.backend, Some(BackendKind::Native));
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_no_fallback_and_no_command_fails() {
        let (_temp, root, out) = fixture();
        let mut job = job(&root, &out, BackendKind::External);
        job.backend.fallback = false;

        let report = BackupCoordinator::new(job).run().await;

        assert!(!report.success);
        assert_eq!(report.backend, None);
        assert_eq!(report.error_messages(), vec!["[write] no archive backend available".to_string()]);
    }

    #[tokio::test]
    async fn test_output_dir_inside_root_is_excluded() {
        let (_temp, root, _) = fixture();
        let out = root.join("backups");
        fs::create_dir(&out).unwrap();
        fs::write(out.join("older.zip"), b"old").unwrap();

        let mut coordinator = BackupCoordinator::new(job(&root, &out, BackendKind::InProcess));
        let report = coordinator.run().await;
        assert!(report.is_clean());
        assert_eq!(report.members, 3);

        // Second run must not pick up the first archive either
        let report = coordinator.run().await;
        assert!(report.is_clean());
        assert_eq!(report.members, 3);
    }

    #[tokio::test]
    async fn test_events_are_emitted_in_order() {
        let (_temp, root, out) = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = FnObserver(move |event: &BackupEvent| {
            let name = match event {
                BackupEvent::BackupStarted { .. } => "backup:started",
                BackupEvent::ArchiveStarted { .. } => "archive:started",
                BackupEvent::ArchiveFallback { .. } => "archive:fallback",
                BackupEvent::ArchiveCompleted { .. } => "archive:completed",
                BackupEvent::BackupCompleted { .. } => "backup:completed",
                BackupEvent::BackupFailed { .. } => "backup:failed",
            };
            sink.lock().unwrap().push(name);
        });

        let mut coordinator =
            BackupCoordinator::new(job(&root, &out, BackendKind::InProcess)).with_observer(Arc::new(observer));
        coordinator.run().await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["backup:started", "archive:started", "archive:completed", "backup:completed"]
        );
    }

    #[tokio::test]
    async fn test_cancelled_job_reports_failure() {
        let (_temp, root, out) = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut coordinator = BackupCoordinator::new(job(&root, &out, BackendKind::Native)).with_cancel(cancel);
        let report = coordinator.run().await;

        assert!(!report.success);
        assert!(!coordinator.archive_exists());
        assert!(report.error_messages().iter().any(|m| m.contains("cancelled")));
    }

    #[tokio::test]
    async fn test_errors_reset_between_runs() {
        let (_temp, root, out) = fixture();
        let mut job = job(&root, &out, BackendKind::External);
        job.backend.fallback = false;

        let mut coordinator = BackupCoordinator::new(job);
        coordinator.run().await;
        assert_eq!(coordinator.errors().len(), 1);

        coordinator.run().await;
        assert_eq!(coordinator.errors().len(), 1);
    }
}
