//! Observer-style event fan-out.
//!
//! Listeners are plain callbacks invoked synchronously on the publishing
//! task. The listener list lock is released before any callback runs, so
//! a listener may freely call back into the master.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Notifications emitted by the master.
#[derive(Debug, Clone)]
pub enum MasterEvent {
    /// A worker was registered and initialized.
    Spawn { target: String },
    /// Something went wrong for a target outside a request path.
    Error { target: String, message: String },
    /// A worker went quiet past the miss threshold.
    HeartbeatMissed { target: String, timestamp: u64 },
    /// A worker was re-spawned after dying or being killed.
    AutoRestart {
        target: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Token returned by subscribe, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&MasterEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventListeners {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl EventListeners {
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MasterEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        ListenerId(id)
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id.0);
        listeners.len() != before
    }

    pub fn emit(&self, event: &MasterEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }
}
