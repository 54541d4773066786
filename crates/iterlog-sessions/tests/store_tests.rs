use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use iterlog_db::{KvStore, MemoryStore, StoreError, Table};
use iterlog_logging::{LogEntry, LogFormat, LogLevel, Logger};
use iterlog_sessions::{
    EndOutcome, IterationStore, SensorKind, StoreOptions, ToolStatus,
};
use serde_json::{json, Value};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 20, 10, 0, 0).unwrap() + Duration::seconds(secs)
}

fn event(agent: &str, iteration: &str, log_type: &str, content: Value, secs: i64) -> LogEntry {
    LogEntry::new(agent, LogLevel::Info, log_type)
        .with_details(json!({
            "iterationId": iteration,
            "logType": log_type,
            "content": content,
        }))
        .at(at(secs))
}

async fn open_store() -> (Arc<IterationStore>, Arc<MemoryStore>) {
    let kv = Arc::new(MemoryStore::new());
    let store = IterationStore::open(kv.clone(), StoreOptions::default()).await;
    (store, kv)
}

/// Sensor, prompt, response two seconds later, one successful tool call.
fn full_iteration(store: &IterationStore, agent: &str, iteration: &str, start: i64) {
    store.handle(&event(
        agent,
        iteration,
        "sensor-ocr",
        json!({"text": "Inbox (3)"}),
        start,
    ));
    store.handle(&event(agent, iteration, "model-prompt", json!("summarize"), start));
    store.handle(&event(
        agent,
        iteration,
        "model-response",
        json!("three unread mails"),
        start + 2,
    ));
    store.handle(&event(
        agent,
        iteration,
        "tool-success",
        json!({"tool": "notify", "params": {"body": "3 mails"}}),
        start + 2,
    ));
}

// ============================================================
// Aggregation
// ============================================================

#[tokio::test]
async fn test_end_to_end_single_iteration() {
    let (store, _) = open_store().await;
    store.start_session("agentA", "s1").await;

    full_iteration(&store, "agentA", "i1", 0);

    let iterations = store.iterations_for_agent("agentA");
    assert_eq!(iterations.len(), 1);

    let it = &iterations[0];
    assert_eq!(it.session_iteration_number, 1);
    assert_eq!(it.session_id, "s1");
    assert_eq!(it.duration, Some(2.0));
    assert!(!it.has_error);
    assert_eq!(it.tools.len(), 1);
    assert_eq!(it.tools[0].name, "notify");
    assert_eq!(it.tools[0].status, ToolStatus::Success);
    assert_eq!(it.sensors.len(), 1);
    assert_eq!(it.sensors[0].kind, SensorKind::Ocr);
    assert_eq!(it.model_prompt.as_deref(), Some("summarize"));
    assert_eq!(it.model_images, Some(Vec::new()));
    assert_eq!(it.model_response.as_deref(), Some("three unread mails"));
}

#[tokio::test]
async fn test_iteration_numbers_follow_first_seen_order() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "s1").await;

    store.handle(&event("agent-a", "b", "sensor-clipboard", json!("x"), 0));
    store.handle(&event("agent-a", "a", "sensor-clipboard", json!("y"), 1));
    // Late event for an existing iteration does not renumber it
    store.handle(&event("agent-a", "b", "model-prompt", json!("p"), 2));
    store.handle(&event("agent-a", "c", "model-prompt", json!("p"), 3));

    let order: Vec<(String, u32)> = store
        .iterations_for_agent("agent-a")
        .into_iter()
        .map(|i| (i.id, i.session_iteration_number))
        .collect();
    assert_eq!(
        order,
        vec![
            ("b".to_string(), 1),
            ("a".to_string(), 2),
            ("c".to_string(), 3)
        ]
    );
}

#[tokio::test]
async fn test_error_flag_is_sticky() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "s1").await;

    store.handle(&event(
        "agent-a",
        "i1",
        "tool-error",
        json!({"tool": "send_sms", "error": "rate limited"}),
        0,
    ));
    store.handle(&event("agent-a", "i1", "tool-success", json!({"tool": "notify"}), 1));

    let it = store.iteration("i1").unwrap();
    assert!(it.has_error);
    assert_eq!(it.tools.len(), 2);
    assert_eq!(it.tools[0].status, ToolStatus::Error);
    assert_eq!(it.tools[0].error.as_deref(), Some("rate limited"));
}

#[tokio::test]
async fn test_duration_set_only_after_response() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "s1").await;

    store.handle(&event("agent-a", "i1", "sensor-screenshot", json!({"size": 10}), 0));
    store.handle(&event("agent-a", "i1", "model-prompt", json!("p"), 1));
    assert_eq!(store.iteration("i1").unwrap().duration, None);

    store.handle(&event("agent-a", "i1", "model-response", json!("r"), 5));
    let it = store.iteration("i1").unwrap();
    assert_eq!(it.duration, Some(5.0));
    assert_eq!(it.model_response_time, Some(at(5)));
}

#[tokio::test]
async fn test_untagged_event_creates_iteration() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "s1").await;

    store.handle(
        &LogEntry::new("agent-a", LogLevel::Debug, "tick").with_details(json!({"iterationId": "i1"})),
    );

    let it = store.iteration("i1").unwrap();
    assert!(it.sensors.is_empty());
    assert!(it.tools.is_empty());
    assert_eq!(it.model_prompt, None);
}

#[tokio::test]
async fn test_malformed_entries_are_tolerated() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "s1").await;

    let garbage = [
        Value::Null,
        json!("just a string"),
        json!([1, 2, 3]),
        json!({"iterationId": null}),
        json!({"iterationId": "i1", "logType": 17}),
        json!({"iterationId": "i1", "logType": "model-response", "content": {"nested": [1]}}),
        json!({"iterationId": "i1", "logType": "sensor-camera", "content": 3.5}),
        json!({"iterationId": "i1", "logType": "tool-error", "content": null}),
    ];
    for details in garbage {
        store.handle(&LogEntry::new("agent-a", LogLevel::Info, "?").with_details(details));
    }

    let iterations = store.iterations_for_agent("agent-a");
    assert_eq!(iterations.len(), 1);
    assert!(iterations[0].has_error);
    assert_eq!(iterations[0].tools[0].name, "unknown");
    assert_eq!(iterations[0].sensors.len(), 1);
}

#[tokio::test]
async fn test_events_without_session_are_dropped() {
    let (store, _) = open_store().await;

    full_iteration(&store, "never-started", "i1", 0);

    assert!(store.iterations_for_agent("never-started").is_empty());
    assert!(store.iteration("i1").is_none());
    let debug = store.debug();
    assert!(debug.iterations_by_session.is_empty());
    assert_eq!(debug.pending_events, 0);
}

#[tokio::test]
async fn test_attach_routes_logger_entries() {
    let (store, _) = open_store().await;
    let logger = Logger::new(LogFormat::Quiet);
    store.attach(&logger);

    store.start_session("agent-a", "s1").await;
    logger.log(LogEntry::new("agent-a", LogLevel::Info, "unrelated"));
    logger.log(event("agent-a", "i1", "model-prompt", json!("hello"), 0));

    assert_eq!(store.iterations_for_agent("agent-a").len(), 1);
    assert_eq!(logger.entries().len(), 2);
}

// ============================================================
// Session lifecycle
// ============================================================

#[tokio::test]
async fn test_end_session_archives_and_purges() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);
    full_iteration(&store, "agent-a", "i2", 10);
    let before = store.iterations_for_agent("agent-a");

    let outcome = store.end_session("agent-a").await;
    assert_eq!(
        outcome,
        EndOutcome::Archived {
            session_id: "s1".to_string(),
            iterations: 2
        }
    );

    assert!(store.current_session("agent-a").is_none());
    assert!(store.iterations_for_agent("agent-a").is_empty());
    assert!(store.debug().counters.is_empty());

    let history = store.historical_sessions("agent-a").await;
    assert_eq!(history.len(), 1);
    let session = &history[0];
    assert_eq!(session.session_id, "s1");
    assert_eq!(session.agent_id, "agent-a");
    assert_eq!(session.start_time, at(0));
    assert!(session.end_time.is_some());
    // Lossless round trip through the archive
    assert_eq!(session.iterations, before);
}

#[tokio::test]
async fn test_end_session_without_session_is_noop() {
    let (store, _) = open_store().await;
    assert_eq!(store.end_session("agent-a").await, EndOutcome::NoSession);
    assert!(store.historical_sessions("agent-a").await.is_empty());
}

#[tokio::test]
async fn test_empty_session_is_archived_with_current_time() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "s1").await;

    let before = Utc::now();
    assert!(store.end_session("agent-a").await.is_archived());

    let history = store.historical_sessions("agent-a").await;
    assert_eq!(history.len(), 1);
    assert!(history[0].iterations.is_empty());
    assert!(history[0].start_time >= before);
}

#[tokio::test]
async fn test_archive_merge_keeps_previous_sessions() {
    let (store, _) = open_store().await;

    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);
    store.end_session("agent-a").await;

    store.start_session("agent-a", "s2").await;
    full_iteration(&store, "agent-a", "i2", 100);
    store.end_session("agent-a").await;
    // Second end for the same agent finds nothing to do
    assert_eq!(store.end_session("agent-a").await, EndOutcome::NoSession);

    let ids: Vec<String> = store
        .historical_sessions("agent-a")
        .await
        .into_iter()
        .map(|s| s.session_id)
        .collect();
    assert_eq!(ids, vec!["s2", "s1"]);
}

#[tokio::test]
async fn test_new_session_restarts_numbering() {
    let (store, _) = open_store().await;

    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);
    full_iteration(&store, "agent-a", "i2", 5);
    store.end_session("agent-a").await;

    store.start_session("agent-a", "s2").await;
    full_iteration(&store, "agent-a", "i3", 10);

    let iterations = store.iterations_for_agent("agent-a");
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].session_iteration_number, 1);
}

#[tokio::test]
async fn test_starting_another_session_flushes_the_previous_one() {
    let (store, _) = open_store().await;

    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);
    store.start_session("agent-a", "s2").await;

    assert_eq!(store.current_session("agent-a").as_deref(), Some("s2"));
    assert!(store.iterations_for_agent("agent-a").is_empty());

    let history = store.historical_sessions("agent-a").await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].session_id, "s1");
    assert_eq!(history[0].iterations.len(), 1);
}

#[tokio::test]
async fn test_restarting_current_session_keeps_numbering() {
    let (store, _) = open_store().await;

    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);
    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i2", 5);

    let numbers: Vec<u32> = store
        .iterations_for_agent("agent-a")
        .iter()
        .map(|i| i.session_iteration_number)
        .collect();
    assert_eq!(numbers, vec![1, 2]);
    assert!(store.historical_sessions("agent-a").await.is_empty());
}

#[tokio::test]
async fn test_agents_are_independent() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "sa").await;
    store.start_session("agent-b", "sb").await;

    full_iteration(&store, "agent-a", "a1", 0);
    full_iteration(&store, "agent-b", "b1", 0);
    full_iteration(&store, "agent-b", "b2", 1);

    store.end_session("agent-b").await;

    assert_eq!(store.iterations_for_agent("agent-a").len(), 1);
    assert!(store.iterations_for_agent("agent-b").is_empty());
    assert!(store.historical_sessions("agent-a").await.is_empty());
    assert_eq!(store.historical_sessions("agent-b").await[0].iterations.len(), 2);
}

// ============================================================
// Durability and storage failures
// ============================================================

#[tokio::test]
async fn test_failed_archive_keeps_iterations_in_memory() {
    let (store, kv) = open_store().await;
    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);

    kv.set_available(false);
    let outcome = store.end_session("agent-a").await;
    assert_eq!(
        outcome,
        EndOutcome::Retained {
            session_id: "s1".to_string()
        }
    );
    assert_eq!(store.current_session("agent-a").as_deref(), Some("s1"));
    assert_eq!(store.iterations_for_agent("agent-a").len(), 1);
    assert!(store.historical_sessions("agent-a").await.is_empty());

    kv.set_available(true);
    assert!(store.end_session("agent-a").await.is_archived());
    assert_eq!(store.historical_sessions("agent-a").await.len(), 1);
}

#[tokio::test]
async fn test_stale_session_is_isolated_and_flushed_later() {
    let (store, kv) = open_store().await;
    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);

    // The auto-flush of s1 fails, so its iteration outlives the pointer
    kv.set_available(false);
    store.start_session("agent-a", "s2").await;
    kv.set_available(true);
    full_iteration(&store, "agent-a", "i2", 10);

    let current = store.iterations_for_agent("agent-a");
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].id, "i2");
    assert_eq!(current[0].session_iteration_number, 1);
    assert!(store.iteration("i1").is_none());
    assert_eq!(store.debug().iterations_by_session.get("s1"), Some(&1));

    // Ending the current session also archives the stale one
    let outcome = store.end_session("agent-a").await;
    assert_eq!(
        outcome,
        EndOutcome::Archived {
            session_id: "s2".to_string(),
            iterations: 1
        }
    );
    assert!(store.debug().iterations_by_session.is_empty());
    assert_eq!(store.historical_sessions("agent-a").await.len(), 2);

    let history = kv.get(Table::Histories, "agent-a").await.unwrap().unwrap();
    assert_eq!(history["currentSession"], "s2");
}

#[tokio::test]
async fn test_reads_return_empty_when_store_offline() {
    let (store, kv) = open_store().await;
    store.start_session("agent-a", "s1").await;
    store.end_session("agent-a").await;

    kv.set_available(false);
    assert!(store.historical_sessions("agent-a").await.is_empty());
    let usage = store.storage_usage("agent-a").await;
    assert_eq!(usage.total_history_mb, 0.0);
    // Clearing is best-effort and does not panic
    store.clear_all_history("agent-a").await;
}

/// Memory store whose history writes wait until [`GatedStore::release`].
#[derive(Default)]
struct GatedStore {
    inner: MemoryStore,
    gate: tokio::sync::Notify,
    open: AtomicBool,
}

impl GatedStore {
    fn release(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.gate.notify_one();
    }
}

#[async_trait]
impl KvStore for GatedStore {
    async fn get(&self, table: Table, key: &str) -> Result<Option<Value>, StoreError> {
        self.inner.get(table, key).await
    }

    async fn put(&self, table: Table, key: &str, value: Value) -> Result<(), StoreError> {
        if table == Table::Histories && !self.open.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        self.inner.put(table, key, value).await
    }

    async fn delete(&self, table: Table, key: &str) -> Result<bool, StoreError> {
        self.inner.delete(table, key).await
    }

    async fn entries(&self, table: Table) -> Result<Vec<(String, Value)>, StoreError> {
        self.inner.entries(table).await
    }

    async fn replace_all(&self, table: Table, entries: Vec<(String, Value)>) -> Result<(), StoreError> {
        self.inner.replace_all(table, entries).await
    }
}

#[tokio::test]
async fn test_concurrent_end_session_is_rejected() {
    let kv = Arc::new(GatedStore::default());
    let store = IterationStore::open(kv.clone(), StoreOptions::default()).await;
    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);

    let first = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.end_session("agent-a").await })
    };
    while store.debug().flushing.is_empty() {
        tokio::task::yield_now().await;
    }

    assert_eq!(store.end_session("agent-a").await, EndOutcome::InProgress);

    kv.release();
    let outcome = first.await.unwrap();
    assert_eq!(
        outcome,
        EndOutcome::Archived {
            session_id: "s1".to_string(),
            iterations: 1
        }
    );
    assert_eq!(store.historical_sessions("agent-a").await.len(), 1);
}

#[tokio::test]
async fn test_iteration_arriving_during_flush_is_archived_with_its_session() {
    let kv = Arc::new(GatedStore::default());
    let store = IterationStore::open(kv.clone(), StoreOptions::default()).await;
    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);

    let first = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.end_session("agent-a").await })
    };
    while store.debug().flushing.is_empty() {
        tokio::task::yield_now().await;
    }

    // The pointer is still live while the write is pending
    full_iteration(&store, "agent-a", "i2", 5);
    kv.release();

    assert_eq!(
        first.await.unwrap(),
        EndOutcome::Archived {
            session_id: "s1".to_string(),
            iterations: 2
        }
    );
    assert!(store.debug().iterations_by_session.is_empty());
    assert!(store.current_session("agent-a").is_none());

    store.start_session("agent-a", "s2").await;
    full_iteration(&store, "agent-a", "i3", 10);
    store.end_session("agent-a").await;

    let history = store.historical_sessions("agent-a").await;
    let s1 = history.iter().find(|s| s.session_id == "s1").unwrap();
    let ids: Vec<&str> = s1.iterations.iter().map(|i| i.id.as_str()).collect();
    assert_eq!(ids, vec!["i1", "i2"]);
    assert_eq!(s1.start_time, at(0));
}

// ============================================================
// Session pointers across runs
// ============================================================

#[tokio::test]
async fn test_pointers_survive_restart() {
    let kv = Arc::new(MemoryStore::new());
    {
        let store = IterationStore::open(kv.clone(), StoreOptions::default()).await;
        store.start_session("agent-a", "s1").await;
    }

    let store = IterationStore::open(kv.clone(), StoreOptions::default()).await;
    assert_eq!(store.current_session("agent-a").as_deref(), Some("s1"));

    full_iteration(&store, "agent-a", "i1", 0);
    assert_eq!(store.iterations_for_agent("agent-a").len(), 1);

    store.end_session("agent-a").await;
    let reopened = IterationStore::open(kv, StoreOptions::default()).await;
    assert!(reopened.current_session("agent-a").is_none());
}

#[tokio::test]
async fn test_events_before_pointer_load_are_replayed() {
    let kv = Arc::new(MemoryStore::new());
    kv.put(Table::CurrentSessions, "agent-a", json!("s-prev"))
        .await
        .unwrap();

    let store = Arc::new(IterationStore::new(kv.clone(), StoreOptions::default()));
    full_iteration(&store, "agent-a", "i1", 0);
    full_iteration(&store, "agent-z", "z1", 0);
    assert!(store.iterations_for_agent("agent-a").is_empty());
    assert_eq!(store.debug().pending_events, 8);

    store.load_pointers().await;

    let iterations = store.iterations_for_agent("agent-a");
    assert_eq!(iterations.len(), 1);
    assert_eq!(iterations[0].session_id, "s-prev");
    assert_eq!(iterations[0].tools.len(), 1);
    assert_eq!(iterations[0].duration, Some(2.0));
    // agent-z never resolved and is dropped once pointers are known
    let debug = store.debug();
    assert!(debug.pointers_loaded);
    assert_eq!(debug.pending_events, 0);
}

#[tokio::test]
async fn test_start_session_replays_held_events() {
    let kv = Arc::new(MemoryStore::new());
    let store = Arc::new(IterationStore::new(kv, StoreOptions::default()));

    full_iteration(&store, "agent-a", "i1", 0);
    store.start_session("agent-a", "s1").await;

    assert_eq!(store.iterations_for_agent("agent-a").len(), 1);
    assert_eq!(store.debug().pending_events, 0);
}

#[tokio::test]
async fn test_pending_queue_is_bounded() {
    let kv = Arc::new(MemoryStore::new());
    let options = StoreOptions {
        pending_capacity: 3,
        ..StoreOptions::default()
    };
    let store = Arc::new(IterationStore::new(kv, options));

    for n in 0..5 {
        store.handle(&event("agent-a", &format!("i{}", n), "model-prompt", json!("p"), n));
    }
    assert_eq!(store.debug().pending_events, 3);

    store.start_session("agent-a", "s1").await;
    let ids: Vec<String> = store
        .iterations_for_agent("agent-a")
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(ids, vec!["i2", "i3", "i4"]);
}

// ============================================================
// Queries and stats
// ============================================================

#[tokio::test]
async fn test_last_tools_spans_iterations_newest_first() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "s1").await;

    for (iteration, tools) in [("i1", ["t1", "t2"]), ("i2", ["t3", "t4"])] {
        for (n, tool) in tools.iter().enumerate() {
            store.handle(&event(
                "agent-a",
                iteration,
                "tool-success",
                json!({"tool": tool}),
                n as i64,
            ));
        }
    }

    let names = |tools: Vec<iterlog_sessions::ToolCall>| -> Vec<String> {
        tools.into_iter().map(|t| t.name).collect()
    };

    assert_eq!(names(store.last_tools("agent-a", 3)), vec!["t4", "t3", "t2"]);
    assert_eq!(names(store.last_tools("agent-a", 10)).len(), 4);
    assert!(store.last_tools("agent-a", 0).is_empty());
    assert_eq!(names(store.tools_from_last_iteration("agent-a")), vec!["t3", "t4"]);
    assert!(store.tools_from_last_iteration("agent-b").is_empty());
}

#[tokio::test]
async fn test_storage_usage() {
    let kv = Arc::new(MemoryStore::new());
    let options = StoreOptions {
        image_estimate_bytes: 1024 * 1024,
        ..StoreOptions::default()
    };
    let store = IterationStore::open(kv, options).await;
    store.start_session("agent-a", "s1").await;

    // Two screenshots without a recorded size: two estimated megabytes
    store.handle(&event("agent-a", "i1", "sensor-screenshot", json!({"data": "..."}), 0));
    store.handle(&event("agent-a", "i1", "sensor-screenshot", json!({"data": "..."}), 1));

    let usage = store.storage_usage("agent-a").await;
    assert_eq!(usage.current_session_mb, 2.0);
    assert_eq!(usage.total_history_mb, 2.0);

    store.end_session("agent-a").await;
    store.start_session("agent-a", "s2").await;
    store.handle(&event("agent-a", "i2", "sensor-camera", json!({"byteSize": 512 * 1024}), 0));

    let usage = store.storage_usage("agent-a").await;
    assert_eq!(usage.current_session_mb, 0.5);
    assert_eq!(usage.total_history_mb, 2.5);
}

#[tokio::test]
async fn test_clear_all_history_empties_current_session() {
    let (store, _) = open_store().await;
    store.start_session("agent-a", "s1").await;
    full_iteration(&store, "agent-a", "i1", 0);
    store.end_session("agent-a").await;

    store.start_session("agent-a", "s2").await;
    full_iteration(&store, "agent-a", "i2", 10);
    full_iteration(&store, "agent-a", "i3", 20);

    store.clear_all_history("agent-a").await;

    assert!(store.historical_sessions("agent-a").await.is_empty());
    assert!(store.iterations_for_agent("agent-a").is_empty());
    assert_eq!(store.current_session("agent-a").as_deref(), Some("s2"));

    // Numbering restarts within the still-current session
    full_iteration(&store, "agent-a", "i4", 30);
    assert_eq!(
        store.iterations_for_agent("agent-a")[0].session_iteration_number,
        1
    );
}

#[tokio::test]
async fn test_subscribers_receive_snapshots_until_cancelled() {
    let (store, _) = open_store().await;
    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&seen);
    let subscription = store.subscribe(move |snapshot| sink.lock().unwrap().push(snapshot.len()));
    assert_eq!(store.debug().listeners, 1);

    store.start_session("agent-a", "s1").await;
    store.handle(&event("agent-a", "i1", "model-prompt", json!("p"), 0));
    store.handle(&event("agent-a", "i2", "model-prompt", json!("p"), 1));
    // Entries without an iteration id change nothing and notify no one
    store.handle(&LogEntry::new("agent-a", LogLevel::Info, "noise"));

    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

    subscription.cancel();
    store.handle(&event("agent-a", "i3", "model-prompt", json!("p"), 2));
    assert_eq!(seen.lock().unwrap().len(), 3);
    assert_eq!(store.debug().listeners, 0);
}
