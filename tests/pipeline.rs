//! End-to-end pipeline: submit -> flush -> detect -> incident.

use chrono::{DateTime, Duration, Utc};
use logsentinel::config::{DetectConfig, IngestConfig};
use logsentinel::detect::engine::DetectionEngine;
use logsentinel::detect::incident::IncidentStore;
use logsentinel::detect::Severity;
use logsentinel::ingest::{buffer, LogBuffer, LogLevel, NewLogRecord};
use logsentinel::storage::{self, Pool};

fn record(level: LogLevel, at: DateTime<Utc>, msg: &str) -> NewLogRecord {
    NewLogRecord {
        service_id: "checkout".to_string(),
        timestamp: at,
        level,
        message: msg.to_string(),
        metadata: serde_json::json!({"host": "web-1"}),
    }
}

fn open_test_pool(dir: &tempfile::TempDir) -> Pool {
    let path = dir.path().join("pipeline.db");
    storage::open_pool(path.to_str().unwrap()).unwrap()
}

#[tokio::test]
async fn test_burst_flows_from_submit_to_critical_incident() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_test_pool(&dir);
    let buffer = LogBuffer::new(IngestConfig::default());
    let now = Utc::now();

    // a steady trickle of errors builds the baseline: [2,3,2,4,3] per minute
    for (i, count) in [2usize, 3, 2, 4, 3].into_iter().enumerate() {
        let at = now - Duration::minutes(i as i64 + 2);
        for n in 0..count {
            buffer
                .submit(record(LogLevel::Error, at, &format!("db timeout {n}")))
                .await
                .unwrap();
        }
        // background noise that must never feed the baseline
        buffer
            .submit(record(LogLevel::Info, at, "request served"))
            .await
            .unwrap();
    }
    // then a burst right now
    for n in 0..10 {
        buffer
            .submit(record(
                LogLevel::Error,
                now - Duration::seconds(5),
                &format!("connection pool exhausted {n}"),
            ))
            .await
            .unwrap();
    }

    buffer::flush_once(&buffer, &pool).await;
    assert_eq!(buffer.pending().await, 0);

    let engine = DetectionEngine::new(pool.clone(), DetectConfig::default());
    engine.run_tick().await.unwrap();

    let store = IncidentStore::new(pool.clone());
    let incidents = store.list_recent(10).unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].severity, Severity::Critical);
    assert!(incidents[0].title.contains("z-score"));

    // the burst is attributed; an immediate re-run must not re-flag it
    engine.run_tick().await.unwrap();
    assert_eq!(store.list_recent(10).unwrap().len(), 1);
    assert_eq!(
        storage::count_uncorrelated_errors(&pool, now - Duration::seconds(60)).unwrap(),
        0
    );
}

#[tokio::test]
async fn test_quiet_service_never_alarms() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_test_pool(&dir);
    let buffer = LogBuffer::new(IngestConfig::default());
    let now = Utc::now();

    for i in 2..8 {
        buffer
            .submit(record(
                LogLevel::Error,
                now - Duration::minutes(i),
                "transient retry",
            ))
            .await
            .unwrap();
    }
    buffer::flush_once(&buffer, &pool).await;

    let engine = DetectionEngine::new(pool.clone(), DetectConfig::default());
    engine.run_tick().await.unwrap();

    assert!(IncidentStore::new(pool).list_recent(10).unwrap().is_empty());
}
