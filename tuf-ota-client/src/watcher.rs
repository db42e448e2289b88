//! Polling file watcher. Changes below the watched directory are reported through a channel of
//! capacity one, so a burst of changes results in a single pending trigger.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use walkdir::WalkDir;

type Fingerprint = BTreeMap<PathBuf, (SystemTime, u64)>;

fn fingerprint(dir: &Path) -> Fingerprint {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("skipping unreadable entry: {e}");
                None
            }
        })
        .filter_map(|entry| {
            let metadata = entry.metadata().ok()?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((entry.into_path(), (modified, metadata.len())))
        })
        .collect()
}

/// Watches `dir` and produces `()` on the returned receiver after changes settled.
#[derive(Debug)]
pub struct FileWatcher {
    handle: JoinHandle<()>,
}

impl FileWatcher {
    /// Polls `dir` every `interval`. A trigger is sent once a change was followed by one
    /// unchanged poll.
    pub fn spawn(dir: PathBuf, interval: Duration) -> (Self, mpsc::Receiver<()>) {
        let (sender, receiver) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            let mut last = fingerprint(&dir);
            let mut dirty = false;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let current = fingerprint(&dir);
                if current != last {
                    debug!("change detected below {dir:?}");
                    last = current;
                    dirty = true;
                    continue;
                }
                if !dirty {
                    continue;
                }
                dirty = false;
                match sender.try_send(()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(())) => {}
                    Err(mpsc::error::TrySendError::Closed(())) => {
                        warn!("file watcher receiver closed, stopping");
                        return;
                    }
                }
            }
        });
        (FileWatcher { handle }, receiver)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
