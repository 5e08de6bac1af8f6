//! File watcher feeding cache invalidation.
//!
//! Watches the workspace root and drops cached results for any file that
//! changes, after a short debounce window. Returns the watcher handle —
//! dropping it stops the watcher.

use crate::cache::ResultCache;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};
use symscope_core::types::FileUri;
use tracing::{debug, warn};

/// Wait this long after the last event before invalidating.
const DEBOUNCE_MS: u64 = 500;

pub fn start_watcher(cache: Arc<ResultCache>, root: &PathBuf) -> Option<RecommendedWatcher> {
    let (tx, rx) = mpsc::channel::<Event>();

    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "Failed to create file watcher");
            return None;
        }
    };

    if let Err(e) = watcher.watch(root, RecursiveMode::Recursive) {
        warn!(root = %root.display(), error = %e, "Failed to watch workspace root");
        return None;
    }
    debug!(root = %root.display(), "Watching workspace for cache invalidation");

    std::thread::spawn(move || debounce_loop(rx, cache));
    Some(watcher)
}

/// Collect change events and invalidate after a quiet period.
fn debounce_loop(rx: mpsc::Receiver<Event>, cache: Arc<ResultCache>) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        match rx.recv_timeout(Duration::from_millis(DEBOUNCE_MS)) {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    let now = Instant::now();
                    for path in event.paths {
                        pending.insert(path, now);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let cutoff = Instant::now() - Duration::from_millis(DEBOUNCE_MS);
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, &t)| t <= cutoff)
                    .map(|(p, _)| p.clone())
                    .collect();
                for path in ready {
                    pending.remove(&path);
                    cache.invalidate_file(&FileUri::from_path(&path));
                    debug!(file = %path.display(), "Invalidated cached results");
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
