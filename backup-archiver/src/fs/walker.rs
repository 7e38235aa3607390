//! Directory traversal producing archive candidates.
//!
//! The walk is lazy, sorted by file name so the same tree always yields the
//! same sequence, and never follows symlinks into other trees. Symlink
//! targets are resolved on the way: links whose target is gone are skipped
//! without an error record, everything else is filtered by [`PathFilter`].
//!
//! Only regular files and directories become entries. FIFOs, sockets and
//! device nodes are dropped with a warning, and a name that is not valid
//! UTF-8 is a discovery error, so every backend receives the same list.

use crate::executor::collector::{ErrorCollector, ErrorPhase};
use crate::fs::filter::PathFilter;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Resolution state of a symbolic link's target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    File,
    Directory,
    /// Target is missing or cannot be resolved
    Broken,
}

/// What a walked entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink(LinkState),
}

/// An archive candidate discovered during walking
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Full path to the entry
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// Root-relative name with `/` separators, without a trailing slash
    pub archive_name: String,

    pub kind: EntryKind,

    /// Size of the file (or link target) in bytes; 0 for directories
    pub size: u64,

    /// Last modification time of the file or link target
    pub modified: SystemTime,

    /// Unix permission bits of the file or link target
    pub mode: u32,
}

/// Outcome of inspecting one walked path
enum Candidate {
    Entry(FileEntry),
    BrokenLink,
    /// FIFO, socket or device node, or a link to one
    Special,
    /// Root-relative name is not valid UTF-8
    InvalidName,
}

impl FileEntry {
    /// Classify a DirEntry.
    /// Symlinks are resolved to their target for size, mode and kind.
    /// Only regular files and directories become entries.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Candidate> {
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let (metadata, linked) = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) => (resolved, true),
                Err(_) => return Ok(Candidate::BrokenLink),
            }
        } else {
            (entry.metadata()?, false)
        };

        let kind = match (metadata.is_dir(), metadata.is_file(), linked) {
            (true, _, false) => EntryKind::Directory,
            (true, _, true) => EntryKind::Symlink(LinkState::Directory),
            (false, true, false) => EntryKind::File,
            (false, true, true) => EntryKind::Symlink(LinkState::File),
            (false, false, _) => return Ok(Candidate::Special),
        };

        let Some(name) = archive_name(&relative_path) else {
            return Ok(Candidate::InvalidName);
        };

        let is_dir = metadata.is_dir();

        Ok(Candidate::Entry(Self {
            archive_name: name,
            path,
            relative_path,
            kind,
            size: if is_dir { 0 } else { metadata.len() },
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            mode: permission_bits(&metadata, is_dir),
        }))
    }

    /// True when the entry is (or points at) a directory
    pub fn is_dir(&self) -> bool {
        matches!(
            self.kind,
            EntryKind::Directory | EntryKind::Symlink(LinkState::Directory)
        )
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, EntryKind::Symlink(_))
    }

    /// Member name inside the archive; directories end with `/`
    pub fn member_name(&self) -> String {
        if self.is_dir() {
            format!("{}/", self.archive_name)
        } else {
            self.archive_name.clone()
        }
    }
}

/// Resolve the current state of a symlink target
pub fn link_state(path: &Path) -> LinkState {
    match std::fs::metadata(path) {
        Ok(m) if m.is_dir() => LinkState::Directory,
        Ok(_) => LinkState::File,
        Err(_) => LinkState::Broken,
    }
}

/// Join the components of a relative path with forward slashes.
/// Returns None when a component is not valid UTF-8.
pub fn archive_name(relative: &Path) -> Option<String> {
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

#[cfg(unix)]
fn permission_bits(metadata: &std::fs::Metadata, _is_dir: bool) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &std::fs::Metadata, is_dir: bool) -> u32 {
    if is_dir {
        0o755
    } else {
        0o644
    }
}

/// Lazy sequence of eligible entries under a root
pub struct Entries<'a> {
    root: PathBuf,
    walker: walkdir::IntoIter,
    filter: &'a PathFilter,
    errors: &'a mut ErrorCollector,
}

impl Iterator for Entries<'_> {
    type Item = FileEntry;

    fn next(&mut self) -> Option<FileEntry> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                    self.errors.push_path(ErrorPhase::Discovery, &path, e.to_string());
                    continue;
                }
            };

            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());

            if self.filter.is_excluded(entry.path(), relative) {
                if entry.file_type().is_dir() {
                    self.walker.skip_current_dir();
                }
                debug!("Excluded: {}", entry.path().display());
                continue;
            }

            match FileEntry::from_entry(&entry, &self.root) {
                Ok(Candidate::Entry(file_entry)) => {
                    if self.filter.includes(&file_entry.path, &file_entry.relative_path, file_entry.is_dir()) {
                        return Some(file_entry);
                    }
                }
                Ok(Candidate::BrokenLink) => {
                    debug!("Skipping broken symlink: {}", entry.path().display());
                }
                Ok(Candidate::Special) => {
                    self.errors
                        .warn(format!("skipping special file: {}", entry.path().display()));
                }
                Ok(Candidate::InvalidName) => {
                    if entry.file_type().is_dir() {
                        self.walker.skip_current_dir();
                    }
                    self.errors.push_path(
                        ErrorPhase::Discovery,
                        entry.path(),
                        "name is not valid UTF-8 and cannot be archived",
                    );
                }
                Err(e) => {
                    self.errors.push_path(ErrorPhase::Discovery, entry.path(), e.to_string());
                }
            }
        }
    }
}

/// Start a fresh walk of `root`.
///
/// The root itself is never yielded. Unreadable directories and entries that
/// vanish mid-walk are recorded as discovery errors and skipped.
pub fn enumerate<'a>(root: &Path, filter: &'a PathFilter, errors: &'a mut ErrorCollector) -> Entries<'a> {
    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    Entries {
        root: root.to_path_buf(),
        walker,
        filter,
        errors,
    }
}

/// Walk `root` and collect every eligible entry
pub fn collect_entries(root: &Path, filter: &PathFilter, errors: &mut ErrorCollector) -> Vec<FileEntry> {
    enumerate(root, filter, errors).collect()
}
