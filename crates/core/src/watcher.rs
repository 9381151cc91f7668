// crates/core/src/watcher.rs
//! File-system watcher over the editor's global database file.
//!
//! Watches exactly one file. When the database does not exist yet, the
//! parent directory is watched instead and the watch swaps to the file on
//! its CREATE event. Raw notify events flow through a pump thread that
//! filters, handles the swap, and forwards into a bounded tokio channel.

use crate::error::WatchError;
use crate::paths::STATE_DB_FILENAME;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bounded buffer absorbing editor write bursts; overflow drops the
/// newest event with a warning.
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Write,
    Create,
}

/// A filtered event for the watched database file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: PathBuf,
    pub kind: WatchEventKind,
    /// Unix milliseconds at which the pump observed the event.
    pub timestamp: i64,
}

enum PumpMsg {
    Raw(notify::Event),
    NotifyError(notify::Error),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchMode {
    /// Watching the database file directly.
    File,
    /// The file does not exist yet; watching its parent directory.
    Parent,
}

struct Running {
    pump_tx: std_mpsc::Sender<PumpMsg>,
    pump: std::thread::JoinHandle<()>,
}

/// Watcher for the editor's global `state.vscdb`.
pub struct DbWatcher {
    target: PathBuf,
    events_tx: mpsc::Sender<WatchEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<WatchEvent>>>,
    running: Mutex<Option<Running>>,
}

impl DbWatcher {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Self {
            target: target.into(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            running: Mutex::new(None),
        }
    }

    /// Begin watching. Errors if already started or if the target's parent
    /// directory does not exist.
    pub fn start(&self) -> Result<(), WatchError> {
        let mut running = self.running.lock().expect("watcher lock poisoned");
        if running.is_some() {
            return Err(WatchError::AlreadyStarted);
        }

        let parent = self
            .target
            .parent()
            .filter(|p| p.exists())
            .ok_or_else(|| WatchError::ParentMissing {
                path: self
                    .target
                    .parent()
                    .unwrap_or_else(|| Path::new("/"))
                    .to_path_buf(),
            })?
            .to_path_buf();

        let (pump_tx, pump_rx) = std_mpsc::channel::<PumpMsg>();
        let callback_tx = pump_tx.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                let msg = match res {
                    Ok(event) => PumpMsg::Raw(event),
                    Err(e) => PumpMsg::NotifyError(e),
                };
                let _ = callback_tx.send(msg);
            },
        )?;

        let mode = if self.target.exists() {
            watcher.watch(&self.target, RecursiveMode::NonRecursive)?;
            WatchMode::File
        } else {
            watcher.watch(&parent, RecursiveMode::NonRecursive)?;
            WatchMode::Parent
        };
        info!(path = %self.target.display(), ?mode, "database watcher started");

        let pump = {
            let target = self.target.clone();
            let events_tx = self.events_tx.clone();
            std::thread::Builder::new()
                .name("db-watcher-pump".to_string())
                .spawn(move || run_pump(watcher, pump_rx, target, parent, mode, events_tx))
                .expect("spawn watcher pump thread")
        };

        *running = Some(Running { pump_tx, pump });
        Ok(())
    }

    /// Take the event stream. Can only be taken once.
    pub fn events(&self) -> Result<mpsc::Receiver<WatchEvent>, WatchError> {
        self.events_rx
            .lock()
            .expect("watcher lock poisoned")
            .take()
            .ok_or(WatchError::EventsTaken)
    }

    /// Stop watching and release the backing notifier. Idempotent.
    pub fn stop(&self) {
        let running = self.running.lock().expect("watcher lock poisoned").take();
        if let Some(Running { pump_tx, pump }) = running {
            let _ = pump_tx.send(PumpMsg::Shutdown);
            if pump.join().is_err() {
                warn!("watcher pump thread panicked during shutdown");
            }
            debug!("database watcher stopped");
        }
    }
}

impl Drop for DbWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// True for events that are the target file itself, or carry the target's
/// filename inside the target's directory.
fn is_target_event(path: &Path, target: &Path) -> bool {
    if path == target {
        return true;
    }
    path.file_name().is_some_and(|n| n == STATE_DB_FILENAME) && path.parent() == target.parent()
}

fn run_pump(
    mut watcher: RecommendedWatcher,
    pump_rx: std_mpsc::Receiver<PumpMsg>,
    target: PathBuf,
    parent: PathBuf,
    mut mode: WatchMode,
    events_tx: mpsc::Sender<WatchEvent>,
) {
    while let Ok(msg) = pump_rx.recv() {
        match msg {
            PumpMsg::Shutdown => break,
            PumpMsg::Raw(event) => {
                let kind = match event.kind {
                    EventKind::Create(_) => WatchEventKind::Create,
                    EventKind::Modify(_) => WatchEventKind::Write,
                    _ => continue,
                };
                for path in &event.paths {
                    if !is_target_event(path, &target) {
                        continue;
                    }

                    if kind == WatchEventKind::Create && mode == WatchMode::Parent {
                        // The database appeared; swap to a direct file watch.
                        match watcher.watch(&target, RecursiveMode::NonRecursive) {
                            Ok(()) => {
                                let _ = watcher.unwatch(&parent);
                                mode = WatchMode::File;
                                info!(path = %target.display(), "swapped to direct file watch");
                            }
                            Err(e) => {
                                // Parent watch stays in place as fallback.
                                warn!(error = %e, "file watch swap failed, keeping parent watch");
                            }
                        }
                    }

                    let event = WatchEvent {
                        path: target.clone(),
                        kind,
                        timestamp: chrono::Utc::now().timestamp_millis(),
                    };
                    if events_tx.try_send(event).is_err() {
                        warn!("watch event buffer full, dropping event");
                    }
                }
            }
            PumpMsg::NotifyError(e) => {
                warn!(error = %e, "notifier error, attempting recovery");
                let _ = watcher.unwatch(&target);
                let _ = watcher.unwatch(&parent);
                mode = if target.exists() {
                    match watcher.watch(&target, RecursiveMode::NonRecursive) {
                        Ok(()) => WatchMode::File,
                        Err(_) => rewatch_parent(&mut watcher, &parent, mode),
                    }
                } else {
                    rewatch_parent(&mut watcher, &parent, mode)
                };
            }
        }
    }
    // Dropping the watcher here closes the notify backend.
}

fn rewatch_parent(
    watcher: &mut RecommendedWatcher,
    parent: &Path,
    previous: WatchMode,
) -> WatchMode {
    match watcher.watch(parent, RecursiveMode::NonRecursive) {
        Ok(()) => WatchMode::Parent,
        Err(e) => {
            error!(error = %e, "watcher recovery failed, events will stop flowing");
            previous
        }
    }
}
