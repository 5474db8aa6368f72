//! Process-wide signal bridge.
//!
//! SIGINT/SIGTERM map to `shutdown_all` on every live master. The
//! listener task is installed at most once per process no matter how many
//! masters are created; masters are tracked by weak reference so the
//! bridge never keeps one alive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use tracing::info;

use crate::master::{shutdown_all_inner, Inner};

const SIGNAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

static REGISTRY: OnceLock<Mutex<Vec<Weak<Inner>>>> = OnceLock::new();
static LISTENER_STARTED: AtomicBool = AtomicBool::new(false);

pub(crate) fn register(inner: &Arc<Inner>) {
    let registry = REGISTRY.get_or_init(|| Mutex::new(Vec::new()));
    {
        let mut masters = registry.lock().unwrap();
        masters.retain(|w| w.strong_count() > 0);
        masters.push(Arc::downgrade(inner));
    }
    if !LISTENER_STARTED.swap(true, Ordering::SeqCst) {
        tokio::spawn(listen());
    }
}

async fn listen() {
    loop {
        wait_for_signal().await;
        info!("Shutdown signal received, stopping all masters");
        let masters: Vec<Arc<Inner>> = REGISTRY
            .get()
            .map(|r| {
                r.lock()
                    .unwrap()
                    .iter()
                    .filter_map(|w| w.upgrade())
                    .collect()
            })
            .unwrap_or_default();
        for inner in masters {
            tokio::spawn(async move {
                shutdown_all_inner(&inner, SIGNAL_SHUTDOWN_TIMEOUT).await;
            });
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
