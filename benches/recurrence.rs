//! Benchmarks for next-occurrence computation.
//!
//! Measures calendar units across timezones and the catch-up path for jobs
//! that missed many occurrences.

use chrono::{Duration, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use kairos::{RecurrenceEngine, ScheduleRecurrence};
use std::hint::black_box;

fn bench_next(c: &mut Criterion) {
    let mut group = c.benchmark_group("recurrence_next");
    let from = Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap();

    let cases = [
        ("daily_utc", ScheduleRecurrence::daily()),
        (
            "daily_new_york",
            ScheduleRecurrence::daily()
                .with_timezone("America/New_York")
                .unwrap(),
        ),
        (
            "monthly_berlin",
            ScheduleRecurrence::monthly()
                .with_timezone("Europe/Berlin")
                .unwrap(),
        ),
        (
            "interval_15m",
            ScheduleRecurrence::every(std::time::Duration::from_secs(900)),
        ),
    ];

    for (name, recurrence) in cases.iter() {
        group.bench_with_input(BenchmarkId::from_parameter(name), recurrence, |b, rec| {
            b.iter(|| RecurrenceEngine::next(black_box(rec), black_box(from)).unwrap());
        });
    }

    group.finish();
}

fn bench_catch_up(c: &mut Criterion) {
    let mut group = c.benchmark_group("recurrence_catch_up");
    let from = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap();
    let recurrence = ScheduleRecurrence::daily()
        .with_timezone("Europe/London")
        .unwrap();

    for days_behind in [1i64, 30, 365].iter() {
        let now = from + Duration::days(*days_behind);
        group.bench_with_input(
            BenchmarkId::from_parameter(days_behind),
            &now,
            |b, &now| {
                b.iter(|| RecurrenceEngine::advance(&recurrence, from, black_box(now), 1).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_next, bench_catch_up);
criterion_main!(benches);
