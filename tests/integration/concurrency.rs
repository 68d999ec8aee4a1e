//! Concurrent generation on a file-backed database.
//!
//! Several connections write at once; each transaction must wait for the
//! write lock instead of failing with a busy error.

use chrono::Utc;
use rekur::{Event, SqliteStore, Store};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Harness, USER, at_nine, fast_worker_config, new_template, wait_for_idle};

const TIMEOUT: Duration = Duration::from_secs(20);

#[tokio::test]
async fn test_parallel_generation_and_sweep_on_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let harness =
        Harness::with_store(SqliteStore::new(dir.path().join("rekur.db")).await.unwrap()).await;

    let mut ids = Vec::new();
    for i in 0..8 {
        let template = harness
            .store
            .create_template(new_template(&format!("habit {}", i), "FREQ=DAILY", at_nine(1)))
            .await
            .unwrap();
        ids.push(template.id);
    }

    let mut handles = Vec::new();
    for id in ids.clone() {
        let generation = Arc::clone(&harness.generation);
        handles.push(tokio::spawn(async move {
            generation.generate_for_template(id, Utc::now(), None).await
        }));
    }
    let sweep = {
        let generation = Arc::clone(&harness.generation);
        tokio::spawn(async move { generation.sweep(Utc::now()).await })
    };

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
    let report = sweep.await.unwrap().unwrap();
    assert!(report.failed.is_empty(), "sweep failed on {:?}", report.failed);

    let expected = harness.templates.tasks(ids[0], USER).await.unwrap().len();
    assert!(expected >= 85);
    for id in ids {
        let tasks = harness.templates.tasks(id, USER).await.unwrap();
        assert_eq!(tasks.len(), expected);
    }

    harness.store.close().await;
}

#[tokio::test]
async fn test_worker_pool_on_file_store_has_no_busy_failures() {
    let dir = tempfile::tempdir().unwrap();
    let harness =
        Harness::with_store(SqliteStore::new(dir.path().join("rekur.db")).await.unwrap()).await;
    let mut config = fast_worker_config();
    config.concurrency = 4;
    let pool = harness.start_pool(config);

    let mut ids = Vec::new();
    for i in 0..12 {
        let template = harness
            .templates
            .create(new_template(&format!("habit {}", i), "FREQ=DAILY", at_nine(1)))
            .await
            .unwrap();
        ids.push(template.id);
    }
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    assert_eq!(
        harness
            .events
            .count(|e| matches!(
                e,
                Event::JobRetrying { .. } | Event::JobDeadLettered { .. }
            ))
            .await,
        0
    );
    for id in ids {
        assert!(!harness.templates.tasks(id, USER).await.unwrap().is_empty());
    }

    assert!(pool.shutdown().await);
    harness.store.close().await;
}
