//! Filesystem watching.
//!
//! Architecture:
//! ```text
//! notify backend → channel → Debouncer (pure timing) → ChangeListener
//! ```
//!
//! The backend is picked at start: native notifications first, polling when
//! they are unavailable, nothing when both fail. Running without a watcher is
//! a supported degradation; the caller simply sees no live invalidation.

mod debouncer;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender};
use notify::{PollWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};

use debouncer::Debouncer;

/// One debounced batch of filesystem changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub modified: Vec<PathBuf>,
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modified.len() + self.added.len() + self.removed.len()
    }
}

/// Receives change batches on the watch thread.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, changes: &ChangeSet);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchBackend {
    /// Native first, polling as fallback.
    #[default]
    Auto,
    Native,
    Poll,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub backend: WatchBackend,
    pub poll_interval: Duration,
    pub debounce: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            backend: WatchBackend::Auto,
            poll_interval: Duration::from_millis(200),
            debounce: Duration::from_millis(debouncer::DEBOUNCE_MS),
        }
    }
}

type Event = notify::Result<notify::Event>;

/// A running watcher. Dropping it stops the watch thread.
pub struct WatchHandle {
    backend: WatchBackend,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
    _watcher: Box<dyn Watcher + Send>,
}

impl WatchHandle {
    /// The backend actually in use (`Native` or `Poll`).
    pub fn backend(&self) -> WatchBackend {
        self.backend
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

/// Watch `paths` recursively and feed debounced batches to `listener`.
///
/// Returns `None` (after logging) when no backend could be started.
pub fn watch(
    paths: &[PathBuf],
    options: &WatchOptions,
    listener: Arc<dyn ChangeListener>,
) -> Option<WatchHandle> {
    let (event_tx, event_rx) = channel::unbounded::<Event>();

    let (backend, watcher) = match start_backend(paths, options, &event_tx) {
        Ok(started) => started,
        Err(e) => {
            crate::log!("watch"; "file watching unavailable: {}", e);
            return None;
        }
    };
    crate::debug!("watch"; "watching {} path(s) with {:?} backend", paths.len(), backend);

    let (stop_tx, stop_rx) = channel::bounded::<()>(0);
    let debouncer = Debouncer::new(options.debounce);
    let thread = std::thread::Builder::new()
        .name("assetry-watch".into())
        .spawn(move || run(event_rx, stop_rx, debouncer, listener));

    let thread = match thread {
        Ok(thread) => thread,
        Err(e) => {
            crate::log!("watch"; "failed to start watch thread: {}", e);
            return None;
        }
    };

    Some(WatchHandle {
        backend,
        stop: Some(stop_tx),
        thread: Some(thread),
        _watcher: watcher,
    })
}

fn start_backend(
    paths: &[PathBuf],
    options: &WatchOptions,
    tx: &Sender<Event>,
) -> notify::Result<(WatchBackend, Box<dyn Watcher + Send>)> {
    match options.backend {
        WatchBackend::Native => Ok((WatchBackend::Native, native(paths, tx.clone())?)),
        WatchBackend::Poll => Ok((WatchBackend::Poll, poll(paths, options, tx.clone())?)),
        WatchBackend::Auto => match native(paths, tx.clone()) {
            Ok(watcher) => Ok((WatchBackend::Native, watcher)),
            Err(e) => {
                crate::log!("watch"; "native watcher failed ({}), falling back to polling", e);
                Ok((WatchBackend::Poll, poll(paths, options, tx.clone())?))
            }
        },
    }
}

fn native(paths: &[PathBuf], tx: Sender<Event>) -> notify::Result<Box<dyn Watcher + Send>> {
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.send(res);
    })?;
    add_paths(&mut watcher, paths)?;
    Ok(Box::new(watcher))
}

fn poll(
    paths: &[PathBuf],
    options: &WatchOptions,
    tx: Sender<Event>,
) -> notify::Result<Box<dyn Watcher + Send>> {
    let config = notify::Config::default()
        .with_poll_interval(options.poll_interval)
        .with_compare_contents(true);
    let mut watcher = PollWatcher::new(
        move |res| {
            let _ = tx.send(res);
        },
        config,
    )?;
    add_paths(&mut watcher, paths)?;
    Ok(Box::new(watcher))
}

/// Skip non-existent paths to handle race conditions.
fn add_paths(watcher: &mut dyn Watcher, paths: &[PathBuf]) -> notify::Result<()> {
    for path in paths {
        if path.exists() {
            watcher.watch(path, RecursiveMode::Recursive)?;
        }
    }
    Ok(())
}

fn run(
    events: Receiver<Event>,
    stop: Receiver<()>,
    mut debouncer: Debouncer,
    listener: Arc<dyn ChangeListener>,
) {
    loop {
        channel::select! {
            recv(events) -> msg => match msg {
                Ok(Ok(event)) => debouncer.add_event(&event),
                Ok(Err(e)) => crate::log!("watch"; "notify error: {}", e),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
            default(debouncer.sleep_duration()) => {}
        }

        if let Some(changes) = debouncer.take_if_ready() {
            crate::debug!(
                "watch";
                "{} added, {} modified, {} removed",
                changes.added.len(),
                changes.modified.len(),
                changes.removed.len()
            );
            listener.on_change(&changes);
        }
    }
}
