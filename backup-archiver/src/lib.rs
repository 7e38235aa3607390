//! Backup Archiver Library
//!
//! Packages a directory tree into a single zip archive through one of three
//! interchangeable backends (external `zip` tool, the `zip` crate, or a
//! built-in encoder) with identical inclusion rules and error reporting.

pub mod archive;
pub mod config;
pub mod executor;
pub mod fs;
pub mod utils;

// Re-export commonly used types
pub use archive::{Backend, BackendKind};
pub use config::{Config, JobConfig};
pub use executor::{BackupCoordinator, BackupJob, BackupReport};
pub use executor::collector::{ErrorCollector, ErrorPhase, ErrorRecord};
pub use utils::errors::ArchiverError;
pub type Result<T> = std::result::Result<T, ArchiverError>;
