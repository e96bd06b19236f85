use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::core::domain::RuntimeInfo;

pub type Listener = Arc<dyn Fn(&RuntimeInfo) + Send + Sync>;

/// Holds the current [`RuntimeInfo`] and fans every change out to
/// subscribers.
pub struct StatusBoard {
    current: watch::Sender<RuntimeInfo>,
    listeners: DashMap<u64, Listener>,
    next_id: AtomicU64,
}

impl StatusBoard {
    pub fn new() -> Arc<Self> {
        let (current, _) = watch::channel(RuntimeInfo::default());
        Arc::new(Self {
            current,
            listeners: DashMap::new(),
            next_id: AtomicU64::new(0),
        })
    }

    pub fn snapshot(&self) -> RuntimeInfo {
        self.current.borrow().clone()
    }

    /// Applies `change` and notifies every listener with the new snapshot.
    pub fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut RuntimeInfo),
    {
        let mut snapshot = RuntimeInfo::default();
        self.current.send_modify(|info| {
            let previous = info.status;
            change(info);
            info.updated_at = Some(chrono::Utc::now());
            if previous != info.status {
                tracing::debug!("Runtime status: {:?} -> {:?}", previous, info.status);
            }
            snapshot = info.clone();
        });

        // Listeners run outside the map lock so they may unsubscribe themselves.
        let listeners: Vec<Listener> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    /// Registers `listener` and immediately calls it with the current
    /// snapshot.
    pub fn subscribe(self: &Arc<Self>, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.insert(id, Arc::clone(&listener));
        listener(&self.snapshot());

        Subscription {
            id,
            board: Arc::downgrade(self),
        }
    }

    pub fn watch(&self) -> WatchStream<RuntimeInfo> {
        WatchStream::new(self.current.subscribe())
    }

    fn unsubscribe(&self, id: u64) {
        self.listeners.remove(&id);
    }
}

impl fmt::Debug for StatusBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusBoard")
            .field("current", &*self.current.borrow())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Handle returned by [`StatusBoard::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes the listener"]
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    board: Weak<StatusBoard>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(board) = self.board.upgrade() {
            board.unsubscribe(self.id);
        }
    }
}
