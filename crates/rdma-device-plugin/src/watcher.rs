//! Filesystem watch plumbing.
//!
//! Bridges the callback-based notify watcher into an async channel so the
//! supervisor can select over filesystem events alongside signals. The
//! watcher must stay alive as long as events are wanted; it stops watching
//! when dropped.

use std::path::Path;

use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;

/// Watches a single directory, non-recursively.
pub struct FsWatcher {
    events: mpsc::Receiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
}

impl FsWatcher {
    /// Starts watching `dir`. Fails if the directory cannot be watched, e.g.
    /// because it does not exist.
    pub fn new<P: AsRef<Path>>(dir: P) -> notify::Result<Self> {
        let (tx, events) = mpsc::channel(16);
        // The callback runs on the notify worker thread, so a blocking send
        // is safe. Events arriving after the receiver is gone are dropped.
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let _ = tx.blocking_send(result);
        })?;
        watcher.watch(dir.as_ref(), RecursiveMode::NonRecursive)?;
        Ok(Self {
            events,
            _watcher: watcher,
        })
    }

    /// Next filesystem event, or `None` if the watcher thread is gone.
    pub async fn next(&mut self) -> Option<notify::Result<Event>> {
        self.events.recv().await
    }
}
