//! Folder watching: lifecycle plus dual discovery.
//!
//! Two discovery mechanisms feed one channel: a filesystem subscription on
//! notify's portable polling backend, and an independent 5s full-directory
//! poll that doubles as the status heartbeat. A single consumer applies the
//! settle delay, de-duplicates by path + modification time, and hands every
//! path to the same dispatcher entry point; there is no separate code path
//! for poll-discovered versus event-discovered files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use notify::{Config as NotifyConfig, Event, EventKind, PollWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::state::RunContext;

use super::dispatcher::{DispatchOutcome, FileDispatcher};
use super::{FAILED_PREFIX, supported_extension};

/// Full-directory poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period before reading a freshly discovered file, so writers can
/// finish.
const SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Backing poll cadence of the portable notify watcher.
const NOTIFY_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Suppression window for repeated notify events on one path.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watcher is already running")]
    AlreadyRunning,
    #[error("a stopped watcher cannot be restarted; build a new processor")]
    Terminated,
    #[error(transparent)]
    Notify(#[from] notify::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    Running,
    Stopped,
}

/// Owns the discovery loops and the Ready → Running → Stopped lifecycle.
/// Stopped is terminal; a new run means a new processor instance.
pub struct FolderWatcher {
    config: Arc<super::WatchConfig>,
    ctx: Arc<RunContext>,
    dispatcher: Arc<FileDispatcher>,
    phase: Mutex<Phase>,
    fs_watcher: Mutex<Option<PollWatcher>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Notify,
}

impl std::fmt::Debug for FolderWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderWatcher").finish()
    }
}

impl FolderWatcher {
    pub fn new(
        config: Arc<super::WatchConfig>,
        ctx: Arc<RunContext>,
        dispatcher: Arc<FileDispatcher>,
    ) -> Self {
        Self {
            config,
            ctx,
            dispatcher,
            phase: Mutex::new(Phase::Ready),
            fs_watcher: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            shutdown: Notify::new(),
        }
    }

    /// Begin watching. Lifecycle validation and the filesystem subscription
    /// happen before this returns; the startup drain and both discovery
    /// loops run on background tasks, with the drain strictly preceding any
    /// channel consumption.
    pub fn start(self: &Arc<Self>) -> Result<(), WatchError> {
        {
            let mut phase = self.phase.lock().expect("watcher phase lock poisoned");
            match *phase {
                Phase::Ready => *phase = Phase::Running,
                Phase::Running => return Err(WatchError::AlreadyRunning),
                Phase::Stopped => return Err(WatchError::Terminated),
            }
        }

        std::fs::create_dir_all(&self.config.watch_dir)?;
        std::fs::create_dir_all(&self.config.output_dir)?;

        self.ctx.set_running(true);
        self.ctx.set_status("watching");

        let (tx, rx) = mpsc::channel::<PathBuf>(256);

        // Event-driven discovery. Runs on notify's own thread; eligible
        // paths funnel into the same channel the poll loop feeds.
        let event_tx = tx.clone();
        let mut debounce: HashMap<PathBuf, Instant> = HashMap::new();
        let mut watcher = PollWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
                    ) {
                        return;
                    }
                    for path in event.paths {
                        if !eligible(&path) {
                            continue;
                        }
                        let now = Instant::now();
                        if let Some(last) = debounce.get(&path) {
                            if now.duration_since(*last) < DEBOUNCE_WINDOW {
                                continue;
                            }
                        }
                        debounce.insert(path.clone(), now);
                        if event_tx.blocking_send(path).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!(error = %err, "filesystem watch error"),
            },
            NotifyConfig::default().with_poll_interval(NOTIFY_POLL_INTERVAL),
        )?;
        watcher.watch(&self.config.watch_dir, RecursiveMode::NonRecursive)?;
        *self.fs_watcher.lock().expect("watcher lock poisoned") = Some(watcher);

        info!(
            watch = %self.config.watch_dir.display(),
            output = %self.config.output_dir.display(),
            "watcher started"
        );

        // Poll discovery + heartbeat.
        let poll_task = {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(POLL_INTERVAL);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = this.shutdown.notified() => break,
                    }
                    if !this.ctx.is_running() {
                        break;
                    }
                    let ledger = this.ctx.ledger();
                    info!(
                        queries = ledger.queries,
                        cost_usd = ledger.total_cost_usd,
                        "watcher heartbeat"
                    );
                    for path in this.list_eligible() {
                        if tx.send(path).await.is_err() {
                            return;
                        }
                    }
                }
                debug!("poll loop finished");
            })
        };

        // Single dispatch consumer: drains whatever is already present (in
        // listing order), then serves both discovery feeds.
        let consumer_task = {
            let this = Arc::clone(self);
            let mut rx = rx;
            tokio::spawn(async move {
                let mut seen: HashMap<PathBuf, SystemTime> = HashMap::new();

                for path in this.list_eligible() {
                    if !this.ctx.is_running() {
                        break;
                    }
                    this.offer(&path, &mut seen, false).await;
                }

                while let Some(path) = rx.recv().await {
                    if !this.ctx.is_running() {
                        break;
                    }
                    this.offer(&path, &mut seen, true).await;
                }
                debug!("dispatch loop finished");
            })
        };

        self.tasks
            .lock()
            .expect("watcher tasks lock poisoned")
            .extend([poll_task, consumer_task]);
        Ok(())
    }

    /// Stop the watcher: flip the run flag, drop the filesystem
    /// subscription, then join both loops. An in-flight dispatch is allowed
    /// to finish; cancellation is cooperative only.
    pub async fn stop(&self) {
        let was_running = {
            let mut phase = self.phase.lock().expect("watcher phase lock poisoned");
            let was_running = *phase == Phase::Running;
            *phase = Phase::Stopped;
            was_running
        };

        self.ctx.set_running(false);
        if !was_running {
            self.ctx.set_status("stopped");
            return;
        }

        self.shutdown.notify_waiters();
        // Dropping the notify watcher stops its polling thread and closes
        // that sender; the poll loop closes the other on exit.
        self.fs_watcher.lock().expect("watcher lock poisoned").take();

        let handles: Vec<_> =
            std::mem::take(&mut *self.tasks.lock().expect("watcher tasks lock poisoned"));
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "watcher task join failed");
            }
        }

        self.ctx.set_status("stopped");
        info!("watcher stopped");
    }

    /// Dispatch one discovered path, at most once per (path, mtime) pair.
    async fn offer(&self, path: &Path, seen: &mut HashMap<PathBuf, SystemTime>, settle: bool) {
        let Ok(metadata) = std::fs::metadata(path) else {
            return; // vanished between discovery and dispatch
        };
        let Ok(modified) = metadata.modified() else {
            return;
        };
        if seen.get(path) == Some(&modified) {
            debug!(path = %path.display(), "already dispatched at this mtime");
            return;
        }
        seen.insert(path.to_path_buf(), modified);

        if settle {
            tokio::time::sleep(SETTLE_DELAY).await;
        }
        let outcome = self.dispatcher.dispatch(path).await;
        if outcome == DispatchOutcome::Quarantined {
            // A failed quarantine copy can leave the original behind; forget
            // the mtime so a later discovery retries it.
            seen.remove(path);
        }
    }

    /// Non-recursive listing of the watch folder, discovery-filtered.
    fn list_eligible(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.config.watch_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .filter(|path| eligible(path))
            .collect()
    }
}

/// Discovery filter: supported extension, not hidden or temporary, not a
/// quarantine artifact.
fn eligible(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') || name.starts_with("~$") {
        return false;
    }
    if name.starts_with(FAILED_PREFIX) {
        return false;
    }
    supported_extension(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_filters_discovery_noise() {
        assert!(eligible(Path::new("/in/scan.jpg")));
        assert!(eligible(Path::new("/in/scan.PDF")));
        assert!(!eligible(Path::new("/in/.hidden.jpg")));
        assert!(!eligible(Path::new("/in/~$scan.jpg")));
        assert!(!eligible(Path::new("/in/FAILED_scan.jpg")));
        assert!(!eligible(Path::new("/in/notes.txt")));
        assert!(!eligible(Path::new("/in/archive")));
    }
}
