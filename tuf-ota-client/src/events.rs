use tokio::sync::broadcast;
use tuf_ota_common::Version;

/// Notifications about the progress of the update client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    RefreshStarted,
    RootRotated { from: Version, to: Version },
    UpdateAvailable { version: semver::Version },
    DownloadProgress { downloaded: u64, total: u64 },
    InstallSucceeded { version: semver::Version },
    InstallFailed { reason: String },
    RolledBack { to_version: semver::Version },
}

const CAPACITY: usize = 64;

/// Fan-out of [UpdateEvent]s. Sending never blocks, slow subscribers miss events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UpdateEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        EventBus { sender }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
        self.sender.subscribe()
    }

    pub fn send(&self, event: UpdateEvent) {
        // an error only means that nobody is subscribed
        let _ = self.sender.send(event);
    }
}
