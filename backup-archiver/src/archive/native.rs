//! Archive backend using the `zip` crate.

use crate::archive::{discard_partial, is_vanished_link, DEFAULT_COMPRESSION_LEVEL};
use crate::executor::collector::{ErrorCollector, ErrorPhase};
use crate::fs::walker::FileEntry;
use crate::utils::errors::{ArchiverError, Result};
use chrono::{DateTime, Datelike, Local, Timelike};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Clone)]
pub struct NativeZip {
    pub compression_level: u32,
}

impl Default for NativeZip {
    fn default() -> Self {
        Self {
            compression_level: DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl NativeZip {
    pub fn new(compression_level: u32) -> Self {
        Self { compression_level }
    }

    /// Write all entries to `archive_path`; returns whether the archive was produced.
    ///
    /// On a fatal error the partial archive is removed.
    pub fn write(
        &self,
        entries: &[FileEntry],
        archive_path: &Path,
        errors: &mut ErrorCollector,
        cancel: &CancellationToken,
    ) -> bool {
        match self.write_archive(entries, archive_path, errors, cancel) {
            Ok(members) => {
                info!("Wrote {} members to {}", members, archive_path.display());
                true
            }
            Err(ArchiverError::Cancelled) => {
                errors.push(ErrorPhase::Write, "archive cancelled");
                discard_partial(archive_path);
                false
            }
            Err(e) => {
                errors.push_path(ErrorPhase::Write, archive_path, e.to_string());
                discard_partial(archive_path);
                false
            }
        }
    }

    /// The writer is owned by this scope: any early return drops (and closes) it.
    /// A member that cannot be started or copied is recorded and skipped.
    fn write_archive(
        &self,
        entries: &[FileEntry],
        archive_path: &Path,
        errors: &mut ErrorCollector,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let file = File::create(archive_path)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let mut members = 0usize;

        for entry in entries {
            if cancel.is_cancelled() {
                return Err(ArchiverError::Cancelled);
            }

            if is_vanished_link(entry) {
                continue;
            }

            let options = self.options(entry);

            if entry.is_dir() {
                match zip.add_directory(entry.member_name(), options) {
                    Ok(()) => members += 1,
                    Err(e) => errors.push_path(ErrorPhase::Write, &entry.path, format!("cannot add to archive: {}", e)),
                }
                continue;
            }

            // Open the source before starting the member so an unreadable file leaves no trace
            let mut source = match File::open(&entry.path) {
                Ok(f) => f,
                Err(e) => {
                    errors.push_path(ErrorPhase::Write, &entry.path, format!("cannot read file: {}", e));
                    continue;
                }
            };

            if let Err(e) = zip.start_file(entry.archive_name.clone(), options) {
                errors.push_path(ErrorPhase::Write, &entry.path, format!("cannot add to archive: {}", e));
                continue;
            }

            match io::copy(&mut source, &mut zip) {
                Ok(_) => members += 1,
                Err(e) => {
                    errors.push_path(ErrorPhase::Write, &entry.path, format!("cannot add to archive: {}", e));
                    zip.abort_file()?;
                }
            }
        }

        let mut out = zip.finish()?;
        out.flush()?;
        Ok(members)
    }

    fn options(&self, entry: &FileEntry) -> SimpleFileOptions {
        let options = SimpleFileOptions::default()
            .unix_permissions(entry.mode)
            .last_modified_time(zip_datetime(entry.modified));

        if entry.is_dir() {
            return options.compression_method(CompressionMethod::Stored);
        }

        // The zip crate rejects level 0 for deflate; 1 is the closest it accepts
        options
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.compression_level.clamp(1, 9).into()))
            .large_file(entry.size >= u32::MAX as u64)
    }
}

/// Local-time timestamp in the zip crate's representation
fn zip_datetime(modified: SystemTime) -> zip::DateTime {
    let local: DateTime<Local> = modified.into();

    u16::try_from(local.year())
        .ok()
        .and_then(|year| {
            zip::DateTime::from_date_and_time(
                year,
                local.month() as u8,
                local.day() as u8,
                local.hour() as u8,
                local.minute() as u8,
                local.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}
