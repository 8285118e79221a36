//! Filesystem event source for the lifecycle monitor.
//!
//! Only creations matter to the pipeline, so backend events are reduced to
//! [`FsEvent`] and forwarded into a tokio channel. The monitor never talks to
//! `notify` directly, which lets tests feed it synthetic events.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    FileCreated,
    DirCreated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub kind: FsEventKind,
    pub path: PathBuf,
}

impl FsEvent {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::FileCreated,
            path: path.into(),
        }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: FsEventKind::DirCreated,
            path: path.into(),
        }
    }
}

/// Registration of watched paths. Events are delivered out of band.
pub trait EventSource: Send + Sync {
    fn watch(&self, path: &Path, recursive: bool) -> Result<(), WatchError>;
    fn unwatch(&self, path: &Path) -> Result<(), WatchError>;
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Watch backend error: {0}")]
    Backend(#[from] notify::Error),

    #[error("Watcher lock poisoned")]
    Poisoned,
}

/// Event source backed by `notify`, either native or polling.
pub struct NotifyEventSource {
    watcher: Mutex<Box<dyn Watcher + Send>>,
}

impl NotifyEventSource {
    /// Build a source and the receiving end of its event channel. With
    /// `poll_interval` set, the directory tree is polled instead of using the
    /// platform backend (network mounts often deliver no native events).
    pub fn new(
        poll_interval: Option<Duration>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FsEvent>), WatchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = move |result: notify::Result<Event>| match result {
            Ok(event) => {
                for fs_event in translate(event) {
                    if tx.send(fs_event).is_err() {
                        debug!("Event receiver dropped");
                        return;
                    }
                }
            }
            Err(e) => warn!(error = %e, "Watch backend reported an error"),
        };

        let watcher: Box<dyn Watcher + Send> = match poll_interval {
            Some(interval) => Box::new(PollWatcher::new(
                handler,
                Config::default().with_poll_interval(interval),
            )?),
            None => Box::new(RecommendedWatcher::new(handler, Config::default())?),
        };

        Ok((
            Self {
                watcher: Mutex::new(watcher),
            },
            rx,
        ))
    }
}

impl EventSource for NotifyEventSource {
    fn watch(&self, path: &Path, recursive: bool) -> Result<(), WatchError> {
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        let mut watcher = self.watcher.lock().map_err(|_| WatchError::Poisoned)?;
        watcher.watch(path, mode)?;
        debug!(path = %path.display(), recursive, "Watching");
        Ok(())
    }

    fn unwatch(&self, path: &Path) -> Result<(), WatchError> {
        let mut watcher = self.watcher.lock().map_err(|_| WatchError::Poisoned)?;
        watcher.unwatch(path)?;
        debug!(path = %path.display(), "Stopped watching");
        Ok(())
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn kind_from_disk(path: &Path) -> Option<FsEventKind> {
    let meta = std::fs::metadata(path).ok()?;
    Some(if meta.is_dir() {
        FsEventKind::DirCreated
    } else {
        FsEventKind::FileCreated
    })
}

/// Reduce a backend event to creations. Renames into a watched directory
/// count as creations; hidden entries are dropped.
fn translate(event: Event) -> Vec<FsEvent> {
    let resolve: fn(&Path) -> Option<FsEventKind> = match event.kind {
        EventKind::Create(CreateKind::File) => |_| Some(FsEventKind::FileCreated),
        EventKind::Create(CreateKind::Folder) => |_| Some(FsEventKind::DirCreated),
        EventKind::Create(_) => kind_from_disk,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => kind_from_disk,
        _ => return Vec::new(),
    };

    event
        .paths
        .into_iter()
        .filter(|path| !is_hidden(path))
        .filter_map(|path| resolve(&path).map(|kind| FsEvent { kind, path }))
        .collect()
}

/// Event source that records registrations and produces no events.
#[derive(Debug, Default)]
pub struct NullEventSource {
    watched: Mutex<Vec<PathBuf>>,
}

impl NullEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        self.watched.lock().map(|w| w.clone()).unwrap_or_default()
    }
}

impl EventSource for NullEventSource {
    fn watch(&self, path: &Path, _recursive: bool) -> Result<(), WatchError> {
        let mut watched = self.watched.lock().map_err(|_| WatchError::Poisoned)?;
        if !watched.iter().any(|p| p == path) {
            watched.push(path.to_path_buf());
        }
        Ok(())
    }

    fn unwatch(&self, path: &Path) -> Result<(), WatchError> {
        let mut watched = self.watched.lock().map_err(|_| WatchError::Poisoned)?;
        watched.retain(|p| p != path);
        Ok(())
    }
}
