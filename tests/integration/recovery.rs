//! Recovery integration tests.
//!
//! Jobs outlive the worker that claimed them: expired leases are redelivered,
//! queued jobs survive a restart and dead letters can be replayed.

use chrono::Utc;
use rekur::{Event, QueueClass, SqliteStore, Store, TemplateChanges};
use std::time::Duration;

use crate::common::{Harness, USER, at_nine, fast_worker_config, new_template, wait_for_idle};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_job_of_crashed_worker_is_redelivered_after_lease_expiry() {
    let harness = Harness::new().await;
    let template = harness
        .templates
        .create(new_template("floss", "FREQ=DAILY;COUNT=4", at_nine(1)))
        .await
        .unwrap();

    // A worker claims the job and dies before acknowledging it.
    let claimed = harness
        .queue
        .claim(QueueClass::Critical, Utc::now(), Duration::from_millis(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.attempts, 1);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let pool = harness.start_pool(fast_worker_config());
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();
    assert_eq!(tasks.len(), 4);

    let events = harness.events.events().await;
    assert!(events.iter().any(|e| matches!(
        e,
        Event::JobStarted { job_id, attempt: 2, .. } if *job_id == claimed.id
    )));

    assert!(pool.shutdown().await);
}

#[tokio::test]
async fn test_queued_jobs_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rekur.db");

    let template = {
        let harness = Harness::with_store(SqliteStore::new(&path).await.unwrap()).await;
        let template = harness
            .templates
            .create(new_template("plan week", "FREQ=WEEKLY;COUNT=3", at_nine(1)))
            .await
            .unwrap();
        assert_eq!(harness.queue.stats().await.unwrap().pending, 1);
        harness.store.close().await;
        template
    };

    let harness = Harness::with_store(SqliteStore::new(&path).await.unwrap()).await;
    let mut config = fast_worker_config();
    config.concurrency = 1;
    config.reap_interval = Duration::from_secs(1);
    let pool = harness.start_pool(config);

    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();
    assert_eq!(tasks.len(), 3);

    assert!(pool.shutdown().await);
    harness.store.close().await;
}

#[tokio::test]
async fn test_dead_letter_replay_after_fixing_the_template() {
    let harness = Harness::new().await;

    let template = harness
        .store
        .create_template(new_template("broken", "FREQ=BOGUS", at_nine(1)))
        .await
        .unwrap();
    harness.dispatcher.template_created(&template).await.unwrap();

    let pool = harness.start_pool(fast_worker_config());
    harness
        .events
        .wait_for(1, TIMEOUT, |e| matches!(e, Event::JobDeadLettered { .. }))
        .await;

    let mut changes = TemplateChanges::from(&template);
    changes.rule = "FREQ=DAILY;COUNT=2".to_string();
    harness
        .store
        .update_template(template.id, USER, changes)
        .await
        .unwrap();

    let dead = harness.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    harness.queue.replay(dead[0].id, Utc::now()).await.unwrap();

    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    // The job reloads the template, so the replay sees the fixed rule.
    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(harness.queue.stats().await.unwrap().dead, 0);

    assert!(pool.shutdown().await);
}
