//! Materialization integration tests.
//!
//! New templates flow from the template service through the job queue to the
//! worker pool, which expands them up to the horizon and writes instances.

use chrono::{Datelike, Months, NaiveTime, TimeDelta, Utc, Weekday};
use rekur::{Event, GenerationOutcome, Store, TemplateError};
use std::time::Duration;

use crate::common::{Harness, USER, at_nine, fast_worker_config, new_template, wait_for_idle};

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_new_daily_template_is_materialized_up_to_the_horizon() {
    let harness = Harness::new().await;
    let pool = harness.start_pool(fast_worker_config());

    let anchor = at_nine(1);
    let template = harness
        .templates
        .create(new_template("stretch", "FREQ=DAILY", anchor))
        .await
        .unwrap();

    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();

    // Three calendar months hold at least 89 days; the anchor is tomorrow.
    assert!(tasks.len() >= 88, "only {} instances", tasks.len());
    assert_eq!(tasks[0].occurs_at, Some(anchor));
    for pair in tasks.windows(2) {
        let gap = pair[1].occurs_at.unwrap() - pair[0].occurs_at.unwrap();
        assert_eq!(gap, TimeDelta::days(1));
    }

    let horizon = Utc::now().checked_add_months(Months::new(3)).unwrap();
    let last = tasks.last().unwrap();
    assert!(last.occurs_at.unwrap() < horizon);

    for task in &tasks {
        assert_eq!(task.template_id, Some(template.id));
        assert_eq!(task.title, "stretch");
        assert_eq!(task.scheduled_time, NaiveTime::from_hms_opt(9, 0, 0));
        assert!(!task.is_done);
        assert_eq!(task.reschedule_count, 0);
    }

    let stored = harness.store.find_template(template.id).await.unwrap();
    assert_eq!(stored.last_generated_at, last.occurs_at);

    assert!(pool.shutdown().await);
}

#[tokio::test]
async fn test_weekly_rule_with_count_stops_after_count() {
    let harness = Harness::new().await;
    let pool = harness.start_pool(fast_worker_config());

    let template = harness
        .templates
        .create(new_template(
            "swim",
            "FREQ=WEEKLY;BYDAY=MO,WE,FR;COUNT=6",
            at_nine(1),
        ))
        .await
        .unwrap();

    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();
    assert_eq!(tasks.len(), 6);
    for task in &tasks {
        let weekday = task.scheduled_date.weekday();
        assert!(
            matches!(weekday, Weekday::Mon | Weekday::Wed | Weekday::Fri),
            "unexpected weekday {:?}",
            weekday
        );
    }

    assert!(pool.shutdown().await);
}

#[tokio::test]
async fn test_all_day_template_has_no_time_of_day() {
    let harness = Harness::new().await;
    let pool = harness.start_pool(fast_worker_config());

    let mut new = new_template("journal", "FREQ=DAILY;COUNT=3", at_nine(1));
    new.has_time = false;
    let template = harness.templates.create(new).await.unwrap();

    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let tasks = harness.templates.tasks(template.id, USER).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| !t.has_time && t.scheduled_time.is_none()));

    assert!(pool.shutdown().await);
}

#[tokio::test]
async fn test_invalid_rule_is_rejected_before_anything_is_queued() {
    let harness = Harness::new().await;

    let result = harness
        .templates
        .create(new_template("broken", "FREQ=BOGUS", at_nine(1)))
        .await;

    assert!(matches!(result, Err(TemplateError::InvalidRule(_))));
    assert!(harness.templates.list(USER).await.unwrap().is_empty());

    let stats = harness.queue.stats().await.unwrap();
    assert_eq!(stats.pending + stats.running + stats.dead, 0);
}

#[tokio::test]
async fn test_invalid_stored_rule_is_dead_lettered_without_rows() {
    let harness = Harness::new().await;

    // Bypasses validation, as a row written by another client would.
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
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let dead = harness.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 1);
    assert!(dead[0].last_error.as_deref().unwrap().contains("FREQ=BOGUS"));

    assert_eq!(
        harness
            .events
            .count(|e| matches!(e, Event::JobRetrying { .. }))
            .await,
        0
    );

    let tasks = harness
        .store
        .list_tasks_for_template(template.id)
        .await
        .unwrap();
    assert!(tasks.is_empty());

    let stored = harness.store.find_template(template.id).await.unwrap();
    assert_eq!(stored.last_generated_at, None);

    assert!(pool.shutdown().await);
}

#[tokio::test]
async fn test_duplicate_generation_jobs_write_each_occurrence_once() {
    let harness = Harness::new().await;
    let pool = harness.start_pool(fast_worker_config());

    let anchor = at_nine(1);
    let template = harness
        .templates
        .create(new_template("read", "FREQ=DAILY", anchor))
        .await
        .unwrap();
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;
    let before = harness.templates.tasks(template.id, USER).await.unwrap();

    // A redelivered creation job, then a regeneration reaching back past the
    // watermark.
    harness.dispatcher.template_created(&template).await.unwrap();
    wait_for_idle(harness.queue.as_ref(), TIMEOUT).await;

    let outcome = harness
        .generation
        .generate_for_template(template.id, Utc::now(), Some(anchor - TimeDelta::days(1)))
        .await
        .unwrap();
    assert!(matches!(outcome, GenerationOutcome::Materialized(_)));

    // Every open row is rewritten, none duplicated.
    let after = harness.templates.tasks(template.id, USER).await.unwrap();
    assert_eq!(outcome.inserted(), after.len());
    assert_eq!(
        after.iter().map(|t| t.occurs_at).collect::<Vec<_>>(),
        before.iter().map(|t| t.occurs_at).collect::<Vec<_>>()
    );

    assert!(pool.shutdown().await);
}
