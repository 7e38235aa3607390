//! File system discovery: inclusion policy and tree walking.

pub mod filter;
pub mod walker;

pub use filter::PathFilter;
pub use walker::{collect_entries, enumerate, EntryKind, FileEntry, LinkState};
