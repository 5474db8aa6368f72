//! Group routing: strategies, concurrency caps, and the master-side
//! pending queue.

mod support;

use std::time::{Duration, Instant};

use serde_json::json;

use peepsy_master::{GroupConfig, Master, MasterOptions, SendOptions, Strategy};
use support::{scenario_host, worker_spec};

fn worker_of(result: &peepsy_master::SendResult) -> String {
    result.data.as_ref().unwrap()["worker"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test(flavor = "multi_thread")]
async fn capacity_cap_queues_and_then_dispatches() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master
        .configure_group(
            "gq1",
            GroupConfig::new()
                .with_strategy(Strategy::RoundRobin)
                .with_max_concurrency(1),
        )
        .await;
    master.spawn("t1", worker_spec().in_group("gq1")).await.unwrap();

    let (delay, echo) = tokio::join!(
        master.send("delay", "gq1", Some(json!({"ms": 200})), SendOptions::new()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let queued_at = Instant::now();
            let stats = master.group_stats("gq1").await.unwrap();
            assert_eq!(stats.max_concurrency, Some(1));
            let result = master
                .send("echo", "gq1", Some(json!({"queued": true})), SendOptions::new())
                .await;
            (result, queued_at.elapsed())
        }
    );

    delay.unwrap();
    let (echo, waited) = echo;
    let echo = echo.unwrap();
    assert_eq!(echo.data.as_ref().unwrap()["echoed"], json!({"queued": true}));
    // The echo could not start until the 200ms delay released the slot.
    assert!(waited >= Duration::from_millis(150));
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn group_active_sum_never_exceeds_cap() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master
        .configure_group("pool", GroupConfig::new().with_max_concurrency(2))
        .await;
    master.spawn("p1", worker_spec().in_group("pool")).await.unwrap();
    master.spawn("p2", worker_spec().in_group("pool")).await.unwrap();

    let sends = (0..4).map(|_| {
        master.send("delay", "pool", Some(json!({"ms": 120})), SendOptions::new())
    });
    let observer = async {
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let stats = master.group_stats("pool").await.unwrap();
            assert!(
                stats.requests_active <= 2,
                "cap violated: {} active",
                stats.requests_active
            );
        }
    };
    let (results, _) = tokio::join!(futures::future::join_all(sends), observer);
    for result in results {
        result.unwrap();
    }
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn round_robin_spreads_requests_evenly() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master.spawn("a", worker_spec().in_group("rr")).await.unwrap();
    master.spawn("b", worker_spec().in_group("rr")).await.unwrap();

    let mut picks = Vec::new();
    for _ in 0..4 {
        let result = master
            .send("echo", "rr", Some(json!({})), SendOptions::new())
            .await
            .unwrap();
        picks.push(worker_of(&result));
    }
    let a_count = picks.iter().filter(|p| *p == "a").count();
    let b_count = picks.iter().filter(|p| *p == "b").count();
    assert_eq!(a_count, 2, "picks were {:?}", picks);
    assert_eq!(b_count, 2, "picks were {:?}", picks);
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn least_busy_picks_idle_worker_then_breaks_ties_by_position() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master
        .configure_group("g", GroupConfig::new().with_strategy(Strategy::LeastBusy))
        .await;
    master.spawn("a", worker_spec().in_group("g")).await.unwrap();
    master.spawn("b", worker_spec().in_group("g")).await.unwrap();

    // Occupy a with a direct send, then route through the group.
    let (busy, first) = tokio::join!(
        master.send("delay", "a", Some(json!({"ms": 250})), SendOptions::new()),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            master.send("echo", "g", Some(json!({})), SendOptions::new()).await
        }
    );
    busy.unwrap();
    assert_eq!(worker_of(&first.unwrap()), "b", "idle worker must win");

    // Both idle now: the tie goes to the earlier list position.
    let tied = master
        .send("echo", "g", Some(json!({})), SendOptions::new())
        .await
        .unwrap();
    assert_eq!(worker_of(&tied), "a");
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn freed_slot_on_one_target_runs_queued_work_on_another() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master
        .configure_group("duo", GroupConfig::new().with_max_concurrency(1))
        .await;
    master.spawn("a", worker_spec().in_group("duo")).await.unwrap();
    master.spawn("b", worker_spec().in_group("duo")).await.unwrap();

    let (delay, echo) = tokio::join!(
        master.send("delay", "duo", Some(json!({"ms": 150})), SendOptions::new()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            master.send("echo", "duo", Some(json!({})), SendOptions::new()).await
        }
    );
    assert_eq!(worker_of(&delay.unwrap()), "a");
    // Round-robin moved on: the queued echo lands on b once a's slot frees.
    assert_eq!(worker_of(&echo.unwrap()), "b");
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_strategy_fails_at_dispatch_and_is_repairable() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    // Configuring a strategy nobody implements succeeds...
    master
        .configure_group(
            "lazy",
            GroupConfig::new().with_strategy(Strategy::parse("weighted")),
        )
        .await;
    master.spawn("t1", worker_spec().in_group("lazy")).await.unwrap();

    // ...and only the first dispatch through it throws.
    let err = master
        .send("echo", "lazy", None, SendOptions::new())
        .await
        .expect_err("unknown strategy must fail at dispatch");
    assert!(err
        .message()
        .contains("Unknown load balancing strategy: weighted"));

    // A later configure_group repairs the group in place.
    master
        .configure_group("lazy", GroupConfig::new().with_strategy(Strategy::RoundRobin))
        .await;
    master
        .send("echo", "lazy", None, SendOptions::new())
        .await
        .expect("repaired group must dispatch");
    master.shutdown_all(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn removing_the_last_member_deletes_the_group() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master.spawn("solo", worker_spec().in_group("tiny")).await.unwrap();
    assert_eq!(master.group_targets("tiny").await, vec!["solo".to_string()]);

    master
        .shutdown_child("solo", Duration::from_secs(1))
        .await
        .unwrap();
    // Poll: exit handling finishes asynchronously after the channel drops.
    for _ in 0..50 {
        if master.group_stats("tiny").await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(master.group_stats("tiny").await.is_none());
    let err = master
        .send("echo", "tiny", None, SendOptions::new())
        .await
        .expect_err("deleted group");
    assert!(err.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn group_stats_reports_members_and_pending() {
    let master = Master::with_host(MasterOptions::default(), scenario_host())
        .await
        .unwrap();
    master
        .configure_group(
            "obs",
            GroupConfig::new()
                .with_strategy(Strategy::LeastBusy)
                .with_max_concurrency(1),
        )
        .await;
    master.spawn("o1", worker_spec().in_group("obs")).await.unwrap();

    let (delay, echo, observed) = tokio::join!(
        master.send("delay", "obs", Some(json!({"ms": 200})), SendOptions::new()),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            master.send("echo", "obs", Some(json!({})), SendOptions::new()).await
        },
        async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            master.group_stats("obs").await.unwrap()
        }
    );
    delay.unwrap();
    echo.unwrap();
    assert_eq!(observed.strategy, "least-busy");
    assert_eq!(observed.requests_active, 1);
    assert_eq!(observed.pending, 1);
    assert_eq!(observed.targets.len(), 1);
    master.shutdown_all(Duration::from_secs(1)).await;
}
