use checks::hana::{HanaAggregator, HanaStatus, ObserveLayer, OnErrorAction};
use checks::health::HealthCounter;
use checks::pattern::Pattern;
use checks::status::ChkResult;
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn health_counter_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("health_counter");

    group.bench_function("pass_fail_cycle", |b| {
        let mut counter = HealthCounter::new(2, 3).unwrap();
        b.iter(|| {
            black_box(counter.apply(ChkResult::Passed));
            black_box(counter.apply(ChkResult::Failed));
        });
    });

    group.finish();
}

fn pattern_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("pattern");

    let payload = {
        let mut p = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n".to_vec();
        p.extend(std::iter::repeat_n(b'x', 4096));
        p
    };

    let literal = Pattern::String("200 OK".to_string());
    group.bench_function("literal_4k", |b| {
        b.iter(|| black_box(literal.matches(&payload, false)));
    });

    let regex = Pattern::regex(r"HTTP/1\.\d (\d{3})").unwrap();
    group.bench_function("regex_capture_4k", |b| {
        b.iter(|| black_box(regex.matches(&payload, true)));
    });

    let binary = Pattern::regex_binary("485454502f312e31").unwrap();
    group.bench_function("regex_binary_4k", |b| {
        b.iter(|| black_box(binary.matches(&payload, false)));
    });

    group.finish();
}

fn hana_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("hana");

    group.bench_function("observe_error_streak", |b| {
        let mut hana =
            HanaAggregator::new(ObserveLayer::Layer7, 10, OnErrorAction::Fastinter).unwrap();
        b.iter(|| {
            black_box(hana.observe(HanaStatus::HttpSts));
        });
    });

    group.finish();
}

criterion_group!(benches, health_counter_benchmark, pattern_benchmark, hana_benchmark);
criterion_main!(benches);
