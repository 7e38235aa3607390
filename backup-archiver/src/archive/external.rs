//! Archive backend driving the system `zip` executable.
//!
//! The command runs in the root directory with `-@`, reading member names
//! from stdin. Only names that survived discovery are fed to it, so broken
//! symlinks never reach the tool. Process failures (missing binary, non-zero
//! exit, timeout, cancellation) become error records, never panics.

use crate::archive::writer::write_empty_archive;
use crate::archive::{discard_partial, is_vanished_link, DEFAULT_COMPRESSION_LEVEL};
use crate::executor::collector::{ErrorCollector, ErrorPhase};
use crate::fs::walker::FileEntry;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// `zip` exit code for "nothing to do"
const ZIP_NOTHING_TO_DO: i32 = 12;
/// `zip` exit code for "could not open some input files"; the archive is still written
const ZIP_OPEN_FAILED: i32 = 18;

/// Setting value that asks for a PATH lookup of `zip`
pub const AUTO_DETECT: &str = "auto";

#[derive(Debug, Clone)]
pub struct ExternalZip {
    pub command: PathBuf,
    pub compression_level: u32,
    pub timeout: Option<Duration>,
}

impl ExternalZip {
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            timeout: None,
        }
    }

    pub fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level.min(9);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve a configured command into an executable path.
    ///
    /// Empty means the variant is disabled. `auto` looks up `zip` on PATH,
    /// a bare name is looked up on PATH, a path must be executable as given.
    pub fn locate(setting: &str) -> Option<PathBuf> {
        let setting = setting.trim();

        if setting.is_empty() {
            return None;
        }

        let program = if setting == AUTO_DETECT { "zip" } else { setting };
        match which::which(program) {
            Ok(path) => Some(path),
            Err(e) => {
                debug!("zip command {:?} not usable: {}", program, e);
                None
            }
        }
    }

    /// Build the command for a configured setting, if it resolves
    pub fn from_setting(setting: &str) -> Option<Self> {
        Self::locate(setting).map(Self::new)
    }

    /// Run `zip` over `entries`; returns whether the archive was produced
    pub async fn run(
        &self,
        root: &Path,
        entries: &[FileEntry],
        archive_path: &Path,
        errors: &mut ErrorCollector,
        cancel: &CancellationToken,
    ) -> bool {
        let names = member_list(entries, errors);

        if names.is_empty() {
            // zip refuses to create an archive from nothing
            return match write_empty_archive(archive_path) {
                Ok(()) => true,
                Err(e) => {
                    errors.push_path(ErrorPhase::Write, archive_path, format!("cannot create archive: {}", e));
                    false
                }
            };
        }

        let spawned = Command::new(&self.command)
            .current_dir(root)
            .arg("-q")
            .arg(format!("-{}", self.compression_level.min(9)))
            .arg("-@")
            .arg(archive_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                errors.push(
                    ErrorPhase::Write,
                    format!("zip command not found: {}", self.command.display()),
                );
                return false;
            }
            Err(e) => {
                errors.push(
                    ErrorPhase::Write,
                    format!("failed to start {}: {}", self.command.display(), e),
                );
                return false;
            }
        };

        info!("Running {} for {} members", self.command.display(), names.len());

        // Feed names from a separate task so a full stdout/stderr pipe can't stall us
        let input = names.join("\n") + "\n";
        let feeder = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                stdin.write_all(input.as_bytes()).await?;
                stdin.shutdown().await
            })
        });

        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Dropping the wait future kills the child (kill_on_drop)
        let output = tokio::select! {
            result = child.wait_with_output() => result,
            _ = cancel.cancelled() => {
                errors.push(ErrorPhase::Write, "archive cancelled");
                discard_partial(archive_path);
                return false;
            }
            _ = deadline => {
                errors.push(
                    ErrorPhase::Write,
                    format!("zip command timed out after {}s", timeout.unwrap_or_default().as_secs()),
                );
                discard_partial(archive_path);
                return false;
            }
        };

        if let Some(feeder) = feeder {
            match feeder.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("zip stdin closed early: {}", e),
                Err(e) => debug!("zip stdin task failed: {}", e),
            }
        }

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                errors.push(ErrorPhase::Write, format!("failed to wait for zip: {}", e));
                return false;
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let diagnostics = record_warnings(stdout.lines().chain(stderr.lines()), errors);

        match output.status.code() {
            Some(0) => {}
            Some(code) => {
                let reason = match code {
                    ZIP_NOTHING_TO_DO => "nothing to do".to_string(),
                    ZIP_OPEN_FAILED => "could not open some input files".to_string(),
                    _ => diagnostics.join("; "),
                };
                errors.push(ErrorPhase::Write, format!("zip exited with status {}: {}", code, reason));
            }
            None => {
                errors.push(ErrorPhase::Write, "zip was terminated by a signal");
            }
        }

        archive_path.is_file()
    }
}

/// Member names to hand to `zip`, one per line
fn member_list(entries: &[FileEntry], errors: &mut ErrorCollector) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| !is_vanished_link(entry))
        .filter_map(|entry| {
            let name = entry.member_name();
            if name.contains('\n') || name.contains('\r') {
                errors.push_path(
                    ErrorPhase::Write,
                    &entry.path,
                    "name contains a line break and cannot be passed to zip",
                );
                None
            } else {
                Some(name)
            }
        })
        .collect()
}

/// Route `zip warning:` lines to warnings and return the remaining non-empty lines
fn record_warnings<'a>(lines: impl Iterator<Item = &'a str>, errors: &mut ErrorCollector) -> Vec<String> {
    let mut other = Vec::new();

    for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
        if line.starts_with("zip warning:") {
            errors.warn(line);
        } else {
            other.push(line.to_string());
        }
    }

    other
}
