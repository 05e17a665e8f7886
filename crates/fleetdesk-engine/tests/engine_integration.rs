use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;

use fleetdesk_core::{Agent, AgentStatus, CommandResult, CommandStatus, LogSeverity};
use fleetdesk_engine::{
    CommandOutcome, DisplayEvent, Engine, EngineConfig, EngineError, FeedConfig, FleetSnapshot,
};
use fleetdesk_store::{MemoryBackend, SqliteStore};

fn agent(agent_id: &str, status: AgentStatus, last_seen_secs_ago: i64) -> Agent {
    let now = Utc::now();
    Agent {
        agent_id: agent_id.to_string(),
        hostname: format!("desk-{agent_id}"),
        username: Some("operator".to_string()),
        ip_address: None,
        os_info: None,
        status,
        last_seen: now - chrono::Duration::seconds(last_seen_secs_ago),
        created_at: now - chrono::Duration::hours(1),
        system_info: HashMap::new(),
    }
}

fn result_for(command_id: &str, agent_id: &str, output: &str, exit_code: i32) -> CommandResult {
    CommandResult {
        id: uuid_like(command_id),
        command_id: command_id.to_string(),
        agent_id: agent_id.to_string(),
        output: output.to_string(),
        exit_code,
        created_at: Utc::now(),
    }
}

fn uuid_like(seed: &str) -> String {
    format!("res-{seed}")
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        stale_check_interval: Duration::from_millis(25),
        command_timeout: Duration::from_secs(5),
        feed: FeedConfig {
            retry_budget: 1,
            retry_delay: Duration::from_millis(10),
            channel_capacity: 64,
        },
        ..EngineConfig::default()
    }
}

async fn wait_for<F>(rx: &mut watch::Receiver<FleetSnapshot>, mut predicate: F) -> FleetSnapshot
where
    F: FnMut(&FleetSnapshot) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if predicate(&snapshot) {
                    return snapshot.clone();
                }
            }
            rx.changed().await.expect("snapshot channel open");
        }
    })
    .await
    .expect("snapshot condition within deadline")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_load_then_feed_changes_converge() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_agent(agent("AGT-1", AgentStatus::Online, 0));

    let engine = Engine::start(backend.clone(), fast_config())
        .await
        .expect("engine start");
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.agents.len(), 1);
    assert_eq!(snapshot.online_count, 1);

    let mut snapshots = engine.watch_snapshots();
    backend.upsert_agent(agent("AGT-2", AgentStatus::Sleeping, 0));
    let snapshot = wait_for(&mut snapshots, |snapshot| snapshot.agents.len() == 2).await;
    assert_eq!(snapshot.online_count, 1);

    backend.delete_agent("AGT-1");
    backend.delete_agent("AGT-2");
    let snapshot = wait_for(&mut snapshots, |snapshot| snapshot.agents.is_empty()).await;
    assert_eq!(snapshot.online_count, 0);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatched_command_resolves_when_result_arrives() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_agent(agent("AGT-1", AgentStatus::Online, 0));

    let engine = Engine::start(backend.clone(), fast_config())
        .await
        .expect("engine start");

    let command = engine
        .dispatch("AGT-1", "uname -a")
        .await
        .expect("dispatch");
    let command_id = command.id.clone();

    let feeder = backend.clone();
    let push_id = command_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        feeder.push_result(result_for(&push_id, "AGT-1", "Linux desk-AGT-1", 0));
    });

    let outcome = engine
        .await_result(&command_id, Duration::from_secs(5))
        .await
        .expect("await result");
    match outcome {
        CommandOutcome::Completed(result) => {
            assert_eq!(result.command_id, command_id);
            assert_eq!(result.output, "Linux desk-AGT-1");
        }
        CommandOutcome::TimedOut => panic!("result arrived before the deadline"),
    }

    // redelivery of the same result is absorbed silently
    backend.push_result(result_for(&command_id, "AGT-1", "Linux desk-AGT-1", 0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn await_without_result_times_out_no_earlier_than_deadline() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_agent(agent("AGT-1", AgentStatus::Online, 0));

    let engine = Engine::start(backend.clone(), fast_config())
        .await
        .expect("engine start");
    let command = engine.dispatch("AGT-1", "sleep 600").await.expect("dispatch");

    let started = Instant::now();
    let outcome = engine
        .await_result(&command.id, Duration::from_millis(200))
        .await
        .expect("await result");
    assert!(matches!(outcome, CommandOutcome::TimedOut));
    assert!(started.elapsed() >= Duration::from_millis(200));

    // a late result after the timeout is dropped, not delivered
    backend.push_result(result_for(&command.id, "AGT-1", "late", 0));
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatch_refuses_unknown_and_offline_agents() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_agent(agent("AGT-OFF", AgentStatus::Offline, 600));

    let engine = Engine::start(backend.clone(), fast_config())
        .await
        .expect("engine start");

    let err = engine.dispatch("AGT-404", "whoami").await.expect_err("unknown");
    assert!(matches!(err, EngineError::AgentUnavailable(_)));

    let err = engine
        .dispatch("AGT-OFF", "whoami")
        .await
        .expect_err("offline");
    assert!(matches!(err, EngineError::AgentUnavailable(_)));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispatch_write_failure_surfaces_as_dispatch_failed() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_agent(agent("AGT-1", AgentStatus::Online, 0));

    let engine = Engine::start(backend.clone(), fast_config())
        .await
        .expect("engine start");
    backend.set_fail_writes(true);

    let err = engine
        .dispatch("AGT-1", "whoami")
        .await
        .expect_err("write rejected");
    assert!(matches!(err, EngineError::DispatchFailed(_)));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_online_agents_are_demoted_and_sleeping_left_alone() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_agent(agent("AGT-STALE", AgentStatus::Online, 200));
    backend.upsert_agent(agent("AGT-SLEEP", AgentStatus::Sleeping, 500));
    backend.upsert_agent(agent("AGT-FRESH", AgentStatus::Online, 1));

    let engine = Engine::start(backend.clone(), fast_config())
        .await
        .expect("engine start");

    let mut snapshots = engine.watch_snapshots();
    let snapshot = wait_for(&mut snapshots, |snapshot| {
        snapshot
            .agents
            .iter()
            .any(|agent| agent.agent_id == "AGT-STALE" && agent.status == AgentStatus::Offline)
    })
    .await;

    let by_id = |id: &str| {
        snapshot
            .agents
            .iter()
            .find(|agent| agent.agent_id == id)
            .expect("agent present")
            .status
    };
    assert_eq!(by_id("AGT-SLEEP"), AgentStatus::Sleeping);
    assert_eq!(by_id("AGT-FRESH"), AgentStatus::Online);
    assert_eq!(snapshot.online_count, 1);

    let entries = engine.log().entries();
    assert!(entries.iter().any(|entry| {
        entry.severity == LogSeverity::Warning && entry.message.contains("AGT-STALE")
    }));

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_feed_degrades_and_refresh_recovers() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_agent(agent("AGT-1", AgentStatus::Online, 0));

    let engine = Engine::start(backend.clone(), fast_config())
        .await
        .expect("engine start");
    assert!(!engine.feed_degraded());

    let mut snapshots = engine.watch_snapshots();
    backend.close_feed();
    wait_for(&mut snapshots, |snapshot| snapshot.feed_degraded).await;
    assert!(engine.feed_degraded());

    backend.reopen_feed();
    backend.upsert_agent(agent("AGT-2", AgentStatus::Online, 0));
    engine.refresh().await.expect("refresh");
    assert!(!engine.feed_degraded());

    // the refreshed pumps observe changes again
    backend.upsert_agent(agent("AGT-3", AgentStatus::Online, 0));
    let snapshot = wait_for(&mut snapshots, |snapshot| snapshot.agents.len() == 3).await;
    assert!(!snapshot.feed_degraded);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mirrored_log_entries_are_not_duplicated_by_the_feed() {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Engine::start(backend.clone(), fast_config())
        .await
        .expect("engine start");

    engine
        .record_log(LogSeverity::Info, "Console session attached")
        .await;
    // the mirrored entry comes back on the event_logs feed and is deduped
    tokio::time::sleep(Duration::from_millis(100)).await;

    let matching = engine
        .log()
        .entries()
        .iter()
        .filter(|entry| entry.message == "Console session attached")
        .count();
    assert_eq!(matching, 1);
    assert_eq!(backend.log_entries().len(), 1);

    assert_eq!(engine.clear_log().await, 1);
    assert!(engine.log().is_empty());
    assert!(backend.log_entries().is_empty());

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_runs_against_sqlite_store() {
    let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
    store
        .upsert_agent(&agent("AGT-1", AgentStatus::Online, 0))
        .expect("seed agent");

    let engine = Engine::start(store.clone(), fast_config())
        .await
        .expect("engine start");
    assert_eq!(engine.snapshot().agents.len(), 1);

    let command = engine
        .dispatch("AGT-1", "uname -a")
        .await
        .expect("dispatch");

    let writer = store.clone();
    let command_id = command.id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer
            .insert_result(&result_for(&command_id, "AGT-1", "Linux", 0))
            .expect("insert result");
    });

    let outcome = engine
        .await_result(&command.id, Duration::from_secs(5))
        .await
        .expect("await result");
    assert!(matches!(outcome, CommandOutcome::Completed(_)));

    let stored = store
        .command(&command.id)
        .expect("query command")
        .expect("command present");
    assert_eq!(stored.status, CommandStatus::Completed);

    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn display_fanout_carries_results_and_logs() {
    let backend = Arc::new(MemoryBackend::new());
    backend.upsert_agent(agent("AGT-1", AgentStatus::Online, 0));

    let engine = Engine::start(backend.clone(), fast_config())
        .await
        .expect("engine start");
    let mut display = engine.subscribe_display();

    let command = engine.dispatch("AGT-1", "whoami").await.expect("dispatch");
    backend.push_result(result_for(&command.id, "AGT-1", "operator", 0));

    let mut saw_command = false;
    let mut saw_result = false;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !(saw_command && saw_result) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = tokio::time::timeout(remaining, display.recv())
            .await
            .expect("display event within deadline")
            .expect("display channel open");
        match event {
            DisplayEvent::Command(received) => saw_command |= received.id == command.id,
            DisplayEvent::Result(received) => saw_result |= received.command_id == command.id,
            _ => {}
        }
    }

    engine.shutdown().await;
}
