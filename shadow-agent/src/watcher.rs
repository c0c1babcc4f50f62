use std::{
    fs,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver},
    time::Duration,
};

use notify::{
    event::{AccessKind, AccessMode},
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _,
};
use tracing::trace;

pub type Result<T> = std::result::Result<T, WatcherError>;

#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum WatcherError {
    #[error("failed creating the watched master directory")]
    MasterDir(#[source] std::io::Error),
    #[error("failed starting the filesystem watcher")]
    Init(#[source] notify::Error),
}

/// Recursive watcher over the master directory.
///
/// Events are delivered as opaque `<path>:<kind>` strings; only their arrival
/// matters to the orchestrator. The service is not restartable once stopped.
pub struct WatcherService {
    watched_dir: PathBuf,
    watcher: Option<RecommendedWatcher>,
    events: Option<Receiver<String>>,
}

impl WatcherService {
    pub fn new(watched_dir: PathBuf) -> Self {
        Self {
            watched_dir,
            watcher: None,
            events: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }
        fs::create_dir_all(&self.watched_dir).map_err(WatcherError::MasterDir)?;

        let (events_tx, events_rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(
            move |event: std::result::Result<Event, notify::Error>| {
                let Ok(event) = event else { return };
                if !is_mutation(&event.kind) {
                    return;
                }
                let path = event
                    .paths
                    .first()
                    .map(|path| path.display().to_string())
                    .unwrap_or_default();
                trace!(%path, kind = ?event.kind, "master directory event");
                // A gone receiver just means the loop is shutting down.
                let _ = events_tx.send(format!("{path}:{:?}", event.kind));
            },
        )
        .map_err(WatcherError::Init)?;
        watcher
            .watch(&self.watched_dir, RecursiveMode::Recursive)
            .map_err(WatcherError::Init)?;

        self.watcher = Some(watcher);
        self.events = Some(events_rx);
        Ok(())
    }

    /// One coalesced event line, or `None` once `timeout` expires.
    pub fn poll_event(&self, timeout: Duration) -> Option<String> {
        self.events.as_ref()?.recv_timeout(timeout).ok()
    }

    pub fn stop(&mut self) {
        self.watcher = None;
        self.events = None;
    }

    pub fn watched_dir(&self) -> &Path {
        &self.watched_dir
    }
}

fn is_mutation(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Remove(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}
