//! Change notifications shared by the catalog store and the remote mirror.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::model::RemoteMirrorConfig;
use crate::remote::SyncError;

#[derive(Debug, Clone)]
pub enum Event {
    /// The catalog was rewritten; observers should re-read it.
    CatalogChanged,
    RemotePullSucceeded,
    RemotePushSucceeded,
    RemoteError(SyncError),
    /// A background sync triggered by the catalog store failed.
    CatalogRemoteSyncError(SyncError),
    /// Mirror configuration was saved (token masked) or cleared (None).
    RemoteConfigChanged(Option<RemoteMirrorConfig>),
}

#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// The channel is unbounded so publishing never blocks. A receiver that
    /// is kept but never drained holds every event sent after it subscribed;
    /// drop it to unsubscribe.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = channel();
        self.subscribers().push(tx);
        rx
    }

    /// Delivers to every live subscriber, dropping those whose receiver is gone.
    pub fn publish(&self, event: Event) {
        self.subscribers().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Sender<Event>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
