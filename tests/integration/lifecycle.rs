//! Template lifecycle integration tests.
//!
//! Updates and deletes enqueue cleanup and regeneration jobs; these tests
//! check the resulting instance set once the worker pool has drained them.

use chrono::{Datelike, TimeDelta, Utc};
use rekur::{
    Event, GenerationHandler, JobHandler, QueueClass, Schedule, Store, SweepScheduler,
    TemplateChanges, TemplateError,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Harness, USER, at_nine, fast_worker_config, new_template, wait_for_idle};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_rule_change_replaces_future_instances_only() {
    let harness = Harness::new().await;
    let pool = harness.start_pool(fast_worker_config());

    let anchor = at_nine(-5);
    let template = harness
        .templates
        .create(new_template("run", "FREQ=DAILY", anchor))
        .await
        .unwrap();
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let before = harness.templates.tasks(template.id, USER).await.unwrap();
    assert_eq!(before[0].occurs_at, Some(anchor));
    harness.store.set_task_done(before[0].id, true).await.unwrap();

    let cutoff = Utc::now();
    let past: Vec<_> = before
        .iter()
        .filter(|t| t.occurs_at.unwrap() < cutoff)
        .map(|t| t.id)
        .collect();
    assert!(past.len() >= 5);

    let mut changes = TemplateChanges::from(&template);
    changes.rule = "FREQ=WEEKLY".to_string();
    let updated = harness
        .templates
        .update(template.id, USER, changes)
        .await
        .unwrap();
    assert_eq!(updated.rule, "FREQ=WEEKLY");

    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let after = harness.templates.tasks(template.id, USER).await.unwrap();

    // Past instances survive untouched, the completed one included.
    for id in &past {
        assert!(after.iter().any(|t| t.id == *id), "past task {} removed", id);
    }
    let done = after.iter().find(|t| t.id == before[0].id).unwrap();
    assert!(done.is_done);

    // The future follows the new rule only.
    let future: Vec<_> = after
        .iter()
        .filter(|t| t.occurs_at.unwrap() >= cutoff)
        .collect();
    assert!(future.len() >= 12, "only {} future instances", future.len());
    for task in &future {
        assert_eq!(task.scheduled_date.weekday(), anchor.weekday());
    }
    for pair in future.windows(2) {
        let gap = pair[1].occurs_at.unwrap() - pair[0].occurs_at.unwrap();
        assert_eq!(gap, TimeDelta::weeks(1));
    }

    let distinct: HashSet<_> = after.iter().map(|t| t.occurs_at).collect();
    assert_eq!(distinct.len(), after.len());

    assert!(pool.shutdown().await);
}

#[tokio::test]
async fn test_cleanup_running_after_regeneration_keeps_new_schedule() {
    let harness = Harness::new().await;
    let handler = GenerationHandler::new(Arc::clone(&harness.generation));
    let lease = Duration::from_secs(30);

    let anchor = at_nine(-5);
    let template = harness
        .templates
        .create(new_template("stretch", "FREQ=DAILY", anchor))
        .await
        .unwrap();
    let create = harness
        .queue
        .claim(QueueClass::Critical, Utc::now(), lease)
        .await
        .unwrap()
        .unwrap();
    handler.handle(&create).await.unwrap();

    let mut changes = TemplateChanges::from(&template);
    changes.rule = "FREQ=WEEKLY".to_string();
    harness
        .templates
        .update(template.id, USER, changes)
        .await
        .unwrap();

    // A worker picks up the cleanup and stalls while another one runs the
    // delayed regeneration.
    let cleanup = harness
        .queue
        .claim(QueueClass::Critical, Utc::now(), lease)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let regenerate = harness
        .queue
        .claim(QueueClass::Critical, Utc::now(), lease)
        .await
        .unwrap()
        .unwrap();
    assert_ne!(cleanup.id, regenerate.id);
    handler.handle(&regenerate).await.unwrap();
    handler.handle(&cleanup).await.unwrap();

    let cutoff = Utc::now();
    let after = harness.templates.tasks(template.id, USER).await.unwrap();
    let future: Vec<_> = after
        .iter()
        .filter(|t| t.occurs_at.unwrap() >= cutoff)
        .collect();
    assert!(future.len() >= 12, "only {} future instances", future.len());
    for pair in future.windows(2) {
        let gap = pair[1].occurs_at.unwrap() - pair[0].occurs_at.unwrap();
        assert_eq!(gap, TimeDelta::weeks(1));
    }
}

#[tokio::test]
async fn test_title_change_is_applied_to_regenerated_instances() {
    let harness = Harness::new().await;
    let pool = harness.start_pool(fast_worker_config());

    let template = harness
        .templates
        .create(new_template("read", "FREQ=DAILY;COUNT=5", at_nine(1)))
        .await
        .unwrap();
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let mut changes = TemplateChanges::from(&template);
    changes.title = "read fiction".to_string();
    harness
        .templates
        .update(template.id, USER, changes)
        .await
        .unwrap();
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();
    assert_eq!(tasks.len(), 5);
    assert!(tasks.iter().all(|t| t.title == "read fiction"));

    assert!(pool.shutdown().await);
}

#[tokio::test]
async fn test_delete_removes_future_open_instances() {
    let harness = Harness::new().await;
    let pool = harness.start_pool(fast_worker_config());

    let template = harness
        .templates
        .create(new_template("water plants", "FREQ=DAILY", at_nine(-3)))
        .await
        .unwrap();
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();
    let kept_done = tasks
        .iter()
        .find(|t| t.occurs_at == Some(at_nine(2)))
        .unwrap()
        .id;
    harness.store.set_task_done(kept_done, true).await.unwrap();

    harness.templates.delete(template.id, USER).await.unwrap();
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    assert!(matches!(
        harness.templates.get(template.id, USER).await,
        Err(TemplateError::NotFound(_))
    ));

    let remaining = harness
        .store
        .list_tasks_for_template(template.id)
        .await
        .unwrap();
    let now = Utc::now();
    assert!(remaining.iter().any(|t| t.id == kept_done));
    assert!(
        remaining
            .iter()
            .all(|t| t.is_done || t.occurs_at.unwrap() < now)
    );
    assert!(remaining.iter().filter(|t| !t.is_done).count() >= 3);

    assert!(pool.shutdown().await);
}

#[tokio::test]
async fn test_other_users_cannot_touch_a_template() {
    let harness = Harness::new().await;

    let template = harness
        .templates
        .create(new_template("private", "FREQ=DAILY;COUNT=2", at_nine(1)))
        .await
        .unwrap();
    let stranger = rekur::UserId::new(99);

    assert!(matches!(
        harness.templates.get(template.id, stranger).await,
        Err(TemplateError::NotFound(_))
    ));
    assert!(matches!(
        harness.templates.delete(template.id, stranger).await,
        Err(TemplateError::NotFound(_))
    ));
    assert!(harness.templates.list(stranger).await.unwrap().is_empty());
    assert_eq!(harness.templates.list(USER).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_sweep_materializes_templates_without_pending_jobs() {
    let harness = Harness::new().await;

    // Written straight to the store, so no creation job exists for them.
    let daily = harness
        .store
        .create_template(new_template("meditate", "FREQ=DAILY", at_nine(1)))
        .await
        .unwrap();
    let weekly = harness
        .store
        .create_template(new_template("review", "FREQ=WEEKLY", at_nine(2)))
        .await
        .unwrap();

    let scheduler = SweepScheduler::new(Schedule::new("@daily").unwrap(), harness.dispatcher.clone())
        .with_event_bus(harness.event_bus.clone());
    let (handle, _task) = scheduler.start();
    let pool = harness.start_pool(fast_worker_config());

    handle.trigger().await.unwrap();
    harness
        .events
        .wait_for(1, TIMEOUT, |e| matches!(e, Event::JobSucceeded { .. }))
        .await;
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let daily_tasks = harness.store.list_tasks_for_template(daily.id).await.unwrap();
    let weekly_tasks = harness.store.list_tasks_for_template(weekly.id).await.unwrap();
    assert!(daily_tasks.len() >= 88);
    assert!(weekly_tasks.len() >= 12);

    // Everything is generated to the horizon; a second sweep adds nothing.
    handle.trigger().await.unwrap();
    harness
        .events
        .wait_for(2, TIMEOUT, |e| matches!(e, Event::JobSucceeded { .. }))
        .await;
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    assert_eq!(
        harness.store.list_tasks_for_template(daily.id).await.unwrap().len(),
        daily_tasks.len()
    );

    handle.shutdown().await.unwrap();
    assert!(pool.shutdown().await);
}
