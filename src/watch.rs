//! Change-triggered sync.
//!
//! A recursive notify subscription feeds a [`Debouncer`]: every qualifying
//! event re-arms a fixed deadline, and a single worker thread runs the
//! action once the deadline passes without another event.
//!
//! ```text
//! event ─► re-arm deadline ─┐
//! event ─► re-arm deadline ─┤   (quiet for `delay`)
//!                           └──────────────────────► action(payload)
//!                                 events during the action re-arm the
//!                                 deadline; the next action starts only
//!                                 after the current one returns
//! ```

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, select};
use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

/// Quiet period required before a burst of edits triggers a sync.
pub const DEBOUNCE_DELAY: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Failed to start file watcher: {0}")]
    Notify(#[from] notify::Error),

    #[error("Failed to start debounce worker: {0}")]
    Worker(#[from] std::io::Error),
}

// =============================================================================
// Debouncer
// =============================================================================

struct State<T> {
    deadline: Option<Instant>,
    pending: Option<T>,
    running: bool,
    shutdown: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    wake: Condvar,
    delay: Duration,
}

/// Runs an action once per quiesced burst of triggers, never two at a time.
///
/// Only the latest payload of a burst reaches the action.
pub struct Debouncer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    worker: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new<F>(delay: Duration, action: F) -> std::io::Result<Self>
    where
        F: FnMut(T) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                deadline: None,
                pending: None,
                running: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
            delay,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("gitsync-debounce".into())
            .spawn(move || run_worker(&worker_shared, action))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// (Re)arm the deadline.
    pub fn trigger(&self, payload: T) {
        let mut state = self.shared.state.lock();
        state.deadline = Some(Instant::now() + self.shared.delay);
        state.pending = Some(payload);
        self.shared.wake.notify_one();
    }

    /// Whether the action is executing right now.
    pub fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    /// Stop the worker, waiting for an in-flight action to return.
    /// A trigger whose deadline has not passed yet is dropped.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.wake.notify_one();
        }
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("debounce worker panicked");
        }
    }
}

impl<T: Send + 'static> Drop for Debouncer<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T, F>(shared: &Shared<T>, mut action: F)
where
    F: FnMut(T),
{
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(deadline) = state.deadline else {
            shared.wake.wait(&mut state);
            continue;
        };
        if Instant::now() < deadline {
            shared.wake.wait_until(&mut state, deadline);
            continue;
        }

        state.deadline = None;
        let Some(payload) = state.pending.take() else {
            continue;
        };
        state.running = true;
        MutexGuard::unlocked(&mut state, || action(payload));
        state.running = false;
    }
}

// =============================================================================
// Event filtering
// =============================================================================

/// Decides which filesystem events count as edits to the project.
#[derive(Debug, Clone)]
pub struct WatchFilter {
    root: PathBuf,
    bundle_dir: PathBuf,
}

impl WatchFilter {
    /// Paths are compared after resolving `root`, since notify reports
    /// canonical paths on some platforms.
    pub fn new(root: &Path, bundle_dir: &Path) -> Self {
        let canonical = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let bundle_dir = match bundle_dir.strip_prefix(root) {
            Ok(rel) => canonical.join(rel),
            Err(_) if bundle_dir.is_relative() => canonical.join(bundle_dir),
            Err(_) => bundle_dir.to_path_buf(),
        };
        Self {
            root: canonical,
            bundle_dir,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// First path of a qualifying event, if any.
    pub fn qualifying_path<'a>(&self, event: &'a Event) -> Option<&'a Path> {
        let relevant_kind = matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Any)
        );
        if !relevant_kind {
            return None;
        }
        event
            .paths
            .iter()
            .map(PathBuf::as_path)
            .find(|p| self.is_relevant(p))
    }

    /// Inside the root, not hidden at the top level, not a bundle.
    pub fn is_relevant(&self, path: &Path) -> bool {
        if path.starts_with(&self.bundle_dir) {
            return false;
        }
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        match rel.components().next() {
            Some(Component::Normal(first)) => !first.to_string_lossy().starts_with('.'),
            _ => false,
        }
    }
}

// =============================================================================
// Watcher
// =============================================================================

/// Watches a working tree and runs a callback once per burst of edits.
pub struct ChangeWatcher {
    filter: WatchFilter,
    delay: Duration,
}

impl ChangeWatcher {
    pub fn new(root: &Path, bundle_dir: &Path) -> Self {
        Self {
            filter: WatchFilter::new(root, bundle_dir),
            delay: DEBOUNCE_DELAY,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Block until `shutdown` fires or is disconnected, calling `on_change`
    /// with the last changed path of each quiesced burst.
    ///
    /// Watcher errors are logged and watching continues.
    pub fn watch<F>(&self, on_change: F, shutdown: Receiver<()>) -> Result<(), WatchError>
    where
        F: FnMut(PathBuf) + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                let _ = tx.send(result);
            },
            Config::default(),
        )?;
        watcher.watch(self.filter.root(), RecursiveMode::Recursive)?;
        tracing::info!(root = %self.filter.root().display(), "watching for changes");

        let mut debouncer = Debouncer::new(self.delay, on_change)?;
        loop {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(Ok(event)) => {
                        if let Some(path) = self.filter.qualifying_path(&event) {
                            tracing::debug!(path = %path.display(), "change detected");
                            debouncer.trigger(path.to_path_buf());
                        }
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "file watcher error"),
                    Err(_) => break,
                },
                recv(shutdown) -> _ => break,
            }
        }

        debouncer.shutdown();
        tracing::info!("stopped watching");
        Ok(())
    }
}
