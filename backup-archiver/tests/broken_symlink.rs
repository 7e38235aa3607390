//! Archiving a tree that contains a dangling symlink, with every backend.
//!
//! The link must never become a member and must never produce an error,
//! and all backends must agree on the member set.

#![cfg(unix)]

use backup_archiver::archive::external::ExternalZip;
use backup_archiver::archive::verify::list_members;
use backup_archiver::config::{BackendConfig, JobConfig};
use backup_archiver::{BackendKind, BackupCoordinator, BackupJob};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const LINK_NAME: &str = "testBrokenSymlink";

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    output_dir: PathBuf,
    link: PathBuf,
}

/// Three regular files plus a symlink whose target was created and then deleted
fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("test-data");
    let output_dir = temp.path().join("tmp");

    fs::create_dir_all(root.join("nested")).unwrap();
    fs::write(root.join("test-data.txt"), b"one").unwrap();
    fs::write(root.join("test-data-2.txt"), b"two").unwrap();
    fs::write(root.join("nested/test-data-3.txt"), b"three").unwrap();

    let target = root.join("symlink");
    fs::write(&target, b"").unwrap();
    let link = root.join(LINK_NAME);
    symlink(&target, &link).unwrap();
    fs::remove_file(&target).unwrap();

    Fixture {
        _temp: temp,
        root,
        output_dir,
        link,
    }
}

fn build_job(fixture: &Fixture, kind: BackendKind, files_only: bool, excludes: &[&str]) -> BackupJob {
    let job = JobConfig {
        root: fixture.root.clone(),
        output_dir: fixture.output_dir.clone(),
        files_only,
        excludes: excludes.iter().map(|p| p.to_string()).collect(),
        ..JobConfig::default()
    };
    let backend = BackendConfig {
        preferred: kind,
        zip_command: Some("auto".to_string()),
        fallback: false,
        ..BackendConfig::default()
    };
    job.build(&backend).unwrap()
}

fn zip_available() -> bool {
    if ExternalZip::locate("auto").is_some() {
        return true;
    }
    eprintln!("skipping external backend: no zip executable on PATH");
    false
}

fn member_set(archive: &Path) -> BTreeSet<String> {
    list_members(archive).unwrap().into_iter().collect()
}

async fn assert_broken_link_skipped(kind: BackendKind) {
    let fixture = fixture();
    assert!(!fixture.link.exists());
    assert!(fixture.link.symlink_metadata().unwrap().file_type().is_symlink());

    let mut coordinator = BackupCoordinator::new(build_job(&fixture, kind, true, &[]));
    let report = coordinator.run().await;

    assert!(coordinator.archive_exists());
    assert_eq!(report.backend, Some(kind));

    let members = member_set(coordinator.archive_filepath());
    assert!(!members.iter().any(|m| m.contains(LINK_NAME)));
    assert_eq!(members.len(), 3);
    assert_eq!(report.members, 3);

    assert!(coordinator.errors().is_empty(), "{:?}", coordinator.errors());
}

#[tokio::test]
async fn test_archive_broken_symlink_with_external_zip() {
    if !zip_available() {
        return;
    }
    assert_broken_link_skipped(BackendKind::External).await;
}

#[tokio::test]
async fn test_archive_broken_symlink_with_native_library() {
    assert_broken_link_skipped(BackendKind::Native).await;
}

#[tokio::test]
async fn test_archive_broken_symlink_with_in_process_writer() {
    assert_broken_link_skipped(BackendKind::InProcess).await;
}

#[tokio::test]
async fn test_backends_agree_on_members() {
    let mut kinds = vec![BackendKind::Native, BackendKind::InProcess];
    if zip_available() {
        kinds.push(BackendKind::External);
    }

    for files_only in [true, false] {
        let mut sets = Vec::new();
        for kind in &kinds {
            let fixture = fixture();
            let mut coordinator = BackupCoordinator::new(build_job(&fixture, *kind, files_only, &[]));
            let report = coordinator.run().await;
            assert!(report.is_clean(), "{}: {:?}", kind, report.errors);
            sets.push(member_set(coordinator.archive_filepath()));
        }

        for set in &sets[1..] {
            assert_eq!(set, &sets[0]);
        }
    }
}

#[tokio::test]
async fn test_exclusions_and_files_only_hold_for_every_backend() {
    let mut kinds = vec![BackendKind::Native, BackendKind::InProcess];
    if zip_available() {
        kinds.push(BackendKind::External);
    }

    for kind in kinds {
        let fixture = fixture();
        let mut coordinator =
            BackupCoordinator::new(build_job(&fixture, kind, true, &["*-2.txt", "nested/"]));
        let report = coordinator.run().await;
        assert!(report.is_clean(), "{}: {:?}", kind, report.errors);

        let members = member_set(coordinator.archive_filepath());
        assert_eq!(members, BTreeSet::from(["test-data.txt".to_string()]));
        assert!(!members.iter().any(|m| m.ends_with('/')));
    }
}

#[tokio::test]
async fn test_rerun_overwrites_with_same_members() {
    let fixture = fixture();
    let mut coordinator = BackupCoordinator::new(build_job(&fixture, BackendKind::InProcess, false, &[]));

    let first = coordinator.run().await;
    let first_members = member_set(coordinator.archive_filepath());

    let second = coordinator.run().await;
    let second_members = member_set(coordinator.archive_filepath());

    assert!(first.is_clean());
    assert!(second.is_clean());
    assert_eq!(first.archive_path, second.archive_path);
    assert_eq!(first_members, second_members);
    assert_eq!(
        second_members,
        BTreeSet::from([
            "nested/".to_string(),
            "nested/test-data-3.txt".to_string(),
            "test-data-2.txt".to_string(),
            "test-data.txt".to_string(),
        ])
    );
}

#[tokio::test]
async fn test_stale_archive_is_replaced_not_merged() {
    let fixture = fixture();
    let job = build_job(&fixture, BackendKind::Native, true, &[]);

    fs::create_dir_all(&fixture.output_dir).unwrap();
    fs::write(job.archive_filepath(), b"garbage from an older run").unwrap();

    let mut coordinator = BackupCoordinator::new(job);
    let report = coordinator.run().await;

    assert!(report.is_clean());
    assert_eq!(member_set(coordinator.archive_filepath()).len(), 3);
}

#[tokio::test]
async fn test_fifo_in_root_is_skipped_by_every_backend() {
    let mut kinds = vec![BackendKind::Native, BackendKind::InProcess];
    if zip_available() {
        kinds.push(BackendKind::External);
    }

    for kind in kinds {
        let fixture = fixture();
        let mkfifo = std::process::Command::new("mkfifo")
            .arg(fixture.root.join("pipe"))
            .status();
        if !matches!(mkfifo, Ok(status) if status.success()) {
            eprintln!("skipping: mkfifo unavailable");
            return;
        }

        let mut coordinator = BackupCoordinator::new(build_job(&fixture, kind, true, &[]));
        let report = tokio::time::timeout(std::time::Duration::from_secs(10), coordinator.run())
            .await
            .unwrap_or_else(|_| panic!("{} backend hung on a FIFO", kind));

        assert!(report.is_clean(), "{}: {:?}", kind, report.errors);
        let members = member_set(coordinator.archive_filepath());
        assert_eq!(members.len(), 3);
        assert!(!members.contains("pipe"));
        assert_eq!(report.warnings.len(), 1);
    }
}
