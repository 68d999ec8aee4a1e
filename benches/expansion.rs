//! Benchmarks for recurrence parsing and horizon expansion.

use chrono::{TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rekur::{Expander, GoalId, Recurrence, RecurrenceTemplate, TemplateId, UserId};

fn template(rule: &str) -> RecurrenceTemplate {
    let anchor = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();
    RecurrenceTemplate {
        id: TemplateId::new(1),
        user_id: UserId::new(1),
        goal_id: GoalId::new(1),
        title: "bench".into(),
        anchor,
        has_time: true,
        duration_minutes: 30,
        rule: rule.into(),
        last_generated_at: None,
        created_at: anchor,
        updated_at: anchor,
    }
}

fn bench_parse(c: &mut Criterion) {
    let anchor = Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap();

    c.bench_function("parse_weekly_byday", |b| {
        b.iter(|| Recurrence::parse("FREQ=WEEKLY;BYDAY=MO,WE,FR", anchor).unwrap());
    });
}

fn bench_expand_horizon(c: &mut Criterion) {
    let mut group = c.benchmark_group("expand_horizon");

    let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
    let rules = [
        ("daily", "FREQ=DAILY"),
        ("weekdays", "FREQ=WEEKLY;BYDAY=MO,TU,WE,TH,FR"),
        ("hourly", "FREQ=HOURLY"),
    ];

    for months in [1u32, 3, 12].iter() {
        let expander = Expander::new(*months);
        for (name, rule) in rules.iter() {
            let template = template(rule);
            group.bench_with_input(BenchmarkId::new(*name, months), months, |b, _| {
                b.iter(|| expander.expand(&template, now, None).unwrap());
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_parse, bench_expand_horizon);

criterion_main!(benches);
