//! Health monitoring, auto-restart, and graceful shutdown.

mod support;

use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use peepsy_master::{GroupConfig, Master, MasterEvent, MasterOptions, SendOptions};
use peepsy_worker::WorkerOptions;
use support::{scenario_host, worker_spec};

fn watch_events(master: &Master) -> mpsc::UnboundedReceiver<MasterEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    master.on_event(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_matching<F>(rx: &mut mpsc::UnboundedReceiver<MasterEvent>, mut pred: F) -> MasterEvent
where
    F: FnMut(&MasterEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream ended");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event never fired")
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_miss_kills_and_restarts_with_new_pid() {
    let options = MasterOptions::new()
        .with_heartbeat_interval_ms(100)
        .with_heartbeat_miss_threshold(1);
    let master = Master::with_host(options, scenario_host()).await.unwrap();
    let mut events = watch_events(&master);

    // The in-process workers never heartbeat unless told to, so this one
    // goes quiet immediately.
    master.spawn("flaky", worker_spec().in_group("g")).await.unwrap();
    let old_pid = master.pid("flaky").await.unwrap();

    next_matching(&mut events, |e| {
        matches!(e, MasterEvent::HeartbeatMissed { target, .. } if target == "flaky")
    })
    .await;

    let restart = next_matching(&mut events, |e| {
        matches!(e, MasterEvent::AutoRestart { target, .. } if target == "flaky")
    })
    .await;
    if let MasterEvent::AutoRestart { signal, .. } = restart {
        assert_eq!(signal, Some(9));
    }

    let mut new_pid = None;
    for _ in 0..100 {
        if master.alive("flaky").await {
            let pid = master.pid("flaky").await;
            if pid.is_some() && pid != Some(old_pid) {
                new_pid = pid;
                break;
            }
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(new_pid.is_some(), "worker never came back with a new pid");
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeating_worker_stays_healthy() {
    let options = MasterOptions::new()
        .with_heartbeat_interval_ms(100)
        .with_heartbeat_miss_threshold(2);
    let host = scenario_host();
    host.set_worker_options(
        "steady",
        WorkerOptions::new().with_heartbeat_interval_ms(50),
    );
    let master = Master::with_host(options, host).await.unwrap();
    let mut events = watch_events(&master);

    master.spawn("steady", worker_spec()).await.unwrap();
    sleep(Duration::from_millis(600)).await;

    assert!(master.unhealthy_targets().await.is_empty());
    assert!(master.alive("steady").await);
    assert!(
        events.try_recv().is_err() || {
            // Only the spawn event is acceptable.
            let mut saw_bad = false;
            while let Ok(event) = events.try_recv() {
                if !matches!(event, MasterEvent::Spawn { .. }) {
                    saw_bad = true;
                }
            }
            !saw_bad
        },
        "healthy worker produced health events"
    );
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn target_level_disable_skips_restart_but_reports_unhealthy() {
    let options = MasterOptions::new()
        .with_heartbeat_interval_ms(100)
        .with_heartbeat_miss_threshold(1);
    let master = Master::with_host(options, scenario_host()).await.unwrap();
    let mut events = watch_events(&master);

    master
        .spawn("manual", worker_spec().without_auto_restart())
        .await
        .unwrap();
    let pid = master.pid("manual").await.unwrap();

    next_matching(&mut events, |e| {
        matches!(e, MasterEvent::HeartbeatMissed { target, .. } if target == "manual")
    })
    .await;

    sleep(Duration::from_millis(500)).await;
    assert!(master.alive("manual").await, "disabled restart must not kill");
    assert_eq!(master.pid("manual").await, Some(pid));
    assert_eq!(master.unhealthy_targets().await, vec!["manual".to_string()]);
    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, MasterEvent::AutoRestart { .. }),
            "restart fired despite disable_auto_restart"
        );
    }
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn group_level_disable_skips_restart() {
    let options = MasterOptions::new()
        .with_heartbeat_interval_ms(100)
        .with_heartbeat_miss_threshold(1);
    let master = Master::with_host(options, scenario_host()).await.unwrap();
    let mut events = watch_events(&master);

    master
        .configure_group("frozen", GroupConfig::new().with_disable_auto_restart(true))
        .await;
    master.spawn("f1", worker_spec().in_group("frozen")).await.unwrap();

    next_matching(&mut events, |e| {
        matches!(e, MasterEvent::HeartbeatMissed { target, .. } if target == "f1")
    })
    .await;
    sleep(Duration::from_millis(400)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, MasterEvent::AutoRestart { .. }));
    }
    assert!(master.alive("f1").await);
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_waits_for_in_flight_work() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master.spawn("w1", worker_spec()).await.unwrap();

    let (delay, shutdown) = tokio::join!(
        master.send("delay", "w1", Some(json!({"ms": 150})), SendOptions::new()),
        async {
            sleep(Duration::from_millis(30)).await;
            master.shutdown_child("w1", Duration::from_secs(2)).await
        }
    );
    // The in-flight request finished before the worker disconnected.
    assert_eq!(delay.unwrap().data, Some(json!({"delayed": 150})));
    shutdown.unwrap();

    assert!(!master.alive("w1").await);
    // A master-initiated stop never restarts.
    sleep(Duration::from_millis(300)).await;
    assert!(!master.alive("w1").await);
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_after_timeout_rejects_in_flight_with_process_error() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master.spawn("w1", worker_spec()).await.unwrap();

    let (delay, shutdown) = tokio::join!(
        master.send("delay", "w1", Some(json!({"ms": 2000})), SendOptions::new()),
        async {
            sleep(Duration::from_millis(50)).await;
            master.shutdown_child("w1", Duration::from_millis(50)).await
        }
    );
    shutdown.unwrap();
    let err = delay.expect_err("killed worker cannot respond");
    assert_eq!(err.code(), "PEEPSY_PROCESS_ERROR");
    assert!(!master.alive("w1").await);
    assert_eq!(master.active_count().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_all_rejects_parked_requests() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master
        .configure_group("gq", GroupConfig::new().with_max_concurrency(1))
        .await;
    master.spawn("t1", worker_spec().in_group("gq")).await.unwrap();

    let (_delay, parked, _) = tokio::join!(
        master.send("delay", "gq", Some(json!({"ms": 400})), SendOptions::new()),
        async {
            sleep(Duration::from_millis(30)).await;
            master.send("echo", "gq", None, SendOptions::new()).await
        },
        async {
            sleep(Duration::from_millis(80)).await;
            master.shutdown_all(Duration::from_millis(100)).await;
        }
    );
    let err = parked.expect_err("parked request must be rejected on shutdown");
    assert!(err.message().contains("shutting down"));
}

#[tokio::test(flavor = "multi_thread")]
async fn spawn_event_fires_with_target() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    let mut events = watch_events(&master);
    master.spawn("w1", worker_spec()).await.unwrap();
    let event = next_matching(&mut events, |e| matches!(e, MasterEvent::Spawn { .. })).await;
    if let MasterEvent::Spawn { target } = event {
        assert_eq!(target, "w1");
    }
    master.shutdown_all(Duration::from_secs(1)).await;
}
