//! Inclusion policy for archive candidates.
//!
//! Decides for each walked path whether it may become an archive member:
//! - the archive itself (and optionally the whole output directory) is never included
//! - paths matching a configured exclusion pattern are dropped
//! - in files-only mode directory entries are dropped, their contents are not

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};

/// Compiled exclusion rules for one job
#[derive(Debug, Clone)]
pub struct PathFilter {
    /// Exclusion globs, matched against root-relative paths
    excludes: GlobSet,

    /// Absolute paths that are never archived, with everything beneath them
    protected: Vec<PathBuf>,

    files_only: bool,
}

impl PathFilter {
    /// Build a filter from user patterns.
    ///
    /// `protected` holds absolute paths excluded unconditionally (the archive
    /// path, and the output directory when it sits inside the root).
    pub fn new(
        patterns: &[String],
        protected: Vec<PathBuf>,
        files_only: bool,
    ) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            for expanded in expand_pattern(pattern) {
                let glob = GlobBuilder::new(&expanded)
                    .literal_separator(true)
                    .build()?;
                builder.add(glob);
            }
        }

        Ok(Self {
            excludes: builder.build()?,
            protected,
            files_only,
        })
    }

    /// Whether `absolute` (or its root-relative form) is excluded regardless of kind.
    ///
    /// Used to prune whole subtrees during the walk.
    pub fn is_excluded(&self, absolute: &Path, relative: &Path) -> bool {
        if self
            .protected
            .iter()
            .any(|protected| absolute.starts_with(protected))
        {
            return true;
        }

        self.excludes.is_match(relative)
    }

    /// Final include decision for an entry whose effective kind is known
    pub fn includes(&self, absolute: &Path, relative: &Path, is_dir: bool) -> bool {
        if self.files_only && is_dir {
            return false;
        }
        !self.is_excluded(absolute, relative)
    }

    pub fn files_only(&self) -> bool {
        self.files_only
    }
}

/// Expand one user pattern into the globs it stands for.
///
/// `cache/` and `cache` both cover the directory and everything beneath it.
/// Patterns without a separator match at any depth; a leading `/` anchors
/// the pattern at the root.
fn expand_pattern(pattern: &str) -> Vec<String> {
    let trimmed = pattern.trim().trim_start_matches("./");
    let anchored = trimmed.starts_with('/');
    let body = trimmed.trim_matches('/');

    if body.is_empty() {
        return Vec::new();
    }

    let mut globs = vec![body.to_string(), format!("{}/**", body)];

    if !anchored && !body.contains('/') {
        globs.push(format!("**/{}", body));
        globs.push(format!("**/{}/**", body));
    }

    globs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(patterns: &[&str], files_only: bool) -> PathFilter {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        PathFilter::new(&patterns, vec![PathBuf::from("/out/site-backup.zip")], files_only)
            .unwrap()
    }

    fn rel_included(filter: &PathFilter, rel: &str, is_dir: bool) -> bool {
        filter.includes(&Path::new("/site").join(rel), Path::new(rel), is_dir)
    }

    #[test]
    fn test_unmatched_paths_are_included() {
        let f = filter(&[], false);
        assert!(rel_included(&f, "index.php", false));
        assert!(rel_included(&f, "wp-content", true));
    }

    #[test]
    fn test_extension_pattern_matches_any_depth() {
        let f = filter(&["*.log"], false);
        assert!(!rel_included(&f, "debug.log", false));
        assert!(!rel_included(&f, "logs/2024/error.log", false));
        assert!(rel_included(&f, "logs/readme.txt", false));
    }

    #[test]
    fn test_directory_pattern_covers_contents() {
        let f = filter(&["cache/"], false);
        assert!(!rel_included(&f, "cache", true));
        assert!(!rel_included(&f, "cache/page.html", false));
        assert!(!rel_included(&f, "wp-content/cache/x", false));
        assert!(rel_included(&f, "cached.txt", false));
    }

    #[test]
    fn test_anchored_pattern_only_matches_at_root() {
        let f = filter(&["/uploads"], false);
        assert!(!rel_included(&f, "uploads/a.png", false));
        assert!(rel_included(&f, "wp-content/uploads/a.png", false));
    }

    #[test]
    fn test_nested_pattern_is_relative_to_root() {
        let f = filter(&["wp-content/uploads"], false);
        assert!(!rel_included(&f, "wp-content/uploads/a.png", false));
        assert!(rel_included(&f, "other/wp-content/uploads/a.png", false));
    }

    #[test]
    fn test_archive_path_is_never_included() {
        let f = filter(&[], false);
        assert!(!f.includes(
            Path::new("/out/site-backup.zip"),
            Path::new("site-backup.zip"),
            false
        ));
    }

    #[test]
    fn test_protected_directory_covers_contents() {
        let f = PathFilter::new(&[], vec![PathBuf::from("/site/backups")], false).unwrap();
        assert!(f.is_excluded(Path::new("/site/backups"), Path::new("backups")));
        assert!(f.is_excluded(Path::new("/site/backups/old.zip"), Path::new("backups/old.zip")));
        assert!(!f.is_excluded(Path::new("/site/backups-info.txt"), Path::new("backups-info.txt")));
    }

    #[test]
    fn test_files_only_drops_directories() {
        let f = filter(&[], true);
        assert!(!rel_included(&f, "wp-content", true));
        assert!(rel_included(&f, "wp-content/index.php", false));
        assert!(f.files_only());
    }

    #[test]
    fn test_blank_patterns_are_ignored() {
        let f = filter(&["", "  ", "/"], false);
        assert!(rel_included(&f, "anything", false));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = PathFilter::new(&["a[".to_string()], Vec::new(), false);
        assert!(result.is_err());
    }
}
