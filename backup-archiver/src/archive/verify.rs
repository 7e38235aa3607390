//! Read-back check of a produced archive.

use crate::executor::collector::{ErrorCollector, ErrorPhase};
use crate::utils::errors::Result;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// How many missing or unexpected names to list in an error message
const MAX_LISTED: usize = 5;

/// Names of all members in the archive, in central directory order
pub fn list_members(archive_path: &Path) -> Result<Vec<String>> {
    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))?;

    let mut names = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        names.push(archive.by_index_raw(index)?.name().to_string());
    }
    Ok(names)
}

/// Compare the archive's members with the expected member names.
///
/// Returns the number of members found. A mismatch or an unreadable archive
/// is recorded as a write error.
pub fn verify_members(archive_path: &Path, expected: &[String], errors: &mut ErrorCollector) -> Option<usize> {
    let members = match list_members(archive_path) {
        Ok(members) => members,
        Err(e) => {
            errors.push_path(ErrorPhase::Write, archive_path, format!("archive is not readable: {}", e));
            return None;
        }
    };

    let found: BTreeSet<&str> = members.iter().map(String::as_str).collect();
    let wanted: BTreeSet<&str> = expected.iter().map(String::as_str).collect();

    if found != wanted || members.len() != expected.len() {
        let missing: Vec<&str> = wanted.difference(&found).take(MAX_LISTED).copied().collect();
        let extra: Vec<&str> = found.difference(&wanted).take(MAX_LISTED).copied().collect();
        errors.push_path(
            ErrorPhase::Write,
            archive_path,
            format!(
                "archive has {} members, expected {} (missing: [{}], unexpected: [{}])",
                members.len(),
                expected.len(),
                missing.join(", "),
                extra.join(", ")
            ),
        );
    }

    Some(members.len())
}
