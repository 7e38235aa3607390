//! Lifecycle notifications emitted by the coordinator.
//!
//! Observers are optional and fire-and-forget: a run behaves the same with
//! or without anyone listening.

use crate::archive::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum BackupEvent {
    /// Job accepted, collector reset
    #[serde(rename = "backup:started")]
    BackupStarted { run_id: String, root: PathBuf },

    /// A backend begins writing the archive
    #[serde(rename = "archive:started")]
    ArchiveStarted {
        run_id: String,
        backend: BackendKind,
        entries: usize,
    },

    /// A backend failed and the next one is tried
    #[serde(rename = "archive:fallback")]
    ArchiveFallback {
        run_id: String,
        from: BackendKind,
        to: BackendKind,
    },

    /// A backend finished (successfully or not)
    #[serde(rename = "archive:completed")]
    ArchiveCompleted {
        run_id: String,
        backend: BackendKind,
        produced: bool,
    },

    #[serde(rename = "backup:completed")]
    BackupCompleted {
        run_id: String,
        archive_path: PathBuf,
        members: usize,
        errors: usize,
    },

    #[serde(rename = "backup:failed")]
    BackupFailed { run_id: String, error: String },
}

/// Receives lifecycle events from a running job
pub trait BackupObserver: Send + Sync {
    fn notify(&self, event: &BackupEvent);
}

/// Fan-out of events to any number of async subscribers
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<BackupEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BackupEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupObserver for EventBroadcaster {
    fn notify(&self, event: &BackupEvent) {
        match self.tx.send(event.clone()) {
            Ok(count) => debug!("Broadcast event to {} subscriber(s): {:?}", count, event),
            Err(_) => debug!("No subscribers for event: {:?}", event),
        }
    }
}

/// Observer that hands each event to a closure
pub struct FnObserver<F>(pub F);

impl<F> BackupObserver for FnObserver<F>
where
    F: Fn(&BackupEvent) + Send + Sync,
{
    fn notify(&self, event: &BackupEvent) {
        (self.0)(event)
    }
}
