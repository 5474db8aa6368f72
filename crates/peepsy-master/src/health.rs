//! Health monitor and restart trigger.
//!
//! Runs at the heartbeat cadence. A worker whose last sign of life
//! (heartbeat or request activity) is older than
//! `heartbeat_interval_ms * heartbeat_miss_threshold` turns unhealthy: a
//! `heartbeat-missed` event fires and, unless auto-restart is disabled at
//! the target or group level, the worker is forcibly killed. The exit
//! handler then re-spawns it with its original spawn spec.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use peepsy_proto::now_ms;

use crate::events::MasterEvent;
use crate::host::ChildControl;
use crate::master::{Inner, State};
use crate::stats::WorkerStatus;

pub(crate) fn spawn_monitor(inner: &Arc<Inner>) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let interval_ms = inner.options.heartbeat_interval_ms;
    let threshold_ms = interval_ms.saturating_mul(inner.options.heartbeat_miss_threshold as u64);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            check_workers(&inner, threshold_ms).await;
        }
    });
}

async fn check_workers(inner: &Arc<Inner>, threshold_ms: u64) {
    let mut missed: Vec<(String, u64)> = Vec::new();
    let mut kills: Vec<(String, Arc<dyn ChildControl>)> = Vec::new();
    {
        let mut state = inner.state.lock().await;
        let State { workers, groups } = &mut *state;
        let now = now_ms();
        for (target, record) in workers.iter_mut() {
            if record.stats.status == WorkerStatus::Restarting {
                continue;
            }
            let idle_ms = now.saturating_sub(record.stats.last_seen());
            if idle_ms > threshold_ms {
                if record.stats.status != WorkerStatus::Unhealthy {
                    record.stats.status = WorkerStatus::Unhealthy;
                    missed.push((target.clone(), now));
                    let group_disabled = record
                        .group
                        .as_ref()
                        .and_then(|g| groups.get(g))
                        .map(|g| g.settings.disable_auto_restart)
                        .unwrap_or(false);
                    if !record.spec.disable_auto_restart && !group_disabled {
                        kills.push((target.clone(), record.control.clone()));
                    }
                }
            } else if record.stats.status != WorkerStatus::Healthy {
                record.stats.status = WorkerStatus::Healthy;
            }
        }
    }

    for (target, timestamp) in missed {
        warn!("{}: heartbeat missed, marking unhealthy", target);
        inner
            .events
            .emit(&MasterEvent::HeartbeatMissed { target, timestamp });
    }
    for (target, control) in kills {
        info!("{}: killing unresponsive worker for restart", target);
        if let Err(e) = control.kill().await {
            inner.events.emit(&MasterEvent::Error {
                target: target.clone(),
                message: format!("Failed to kill unresponsive worker: {}", e),
            });
        }
    }
}
