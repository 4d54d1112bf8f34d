use coachgate::{select_hybrid, Candidate, SelectorConfig};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;

fn bench_select_hybrid(c: &mut Criterion) {
    let cfg = SelectorConfig::default();

    let mut group = c.benchmark_group("select_hybrid");
    for &n in &[4usize, 16usize, 128usize] {
        // Deterministic scores with every fifth action blocked.
        let candidates: Vec<Candidate> = (0..n)
            .map(|i| {
                let rule = ((i * 37 + 11) % 101) as f64 / 100.0;
                let learned = ((i * 53 + 7) % 97) as f64 / 50.0;
                let c = Candidate::new(format!("action{i}"), rule, learned);
                if i % 5 == 4 {
                    c.blocked_by("guard")
                } else {
                    c
                }
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("candidates", n), &n, |b, &_n| {
            b.iter(|| {
                let d = select_hybrid(black_box(&candidates), &cfg);
                black_box(d.ok());
            })
        });
    }
    group.finish();
}

#[cfg(feature = "stochastic")]
fn bench_sample_decision(c: &mut Criterion) {
    let cfg = SelectorConfig::default();
    let candidates: Vec<Candidate> = (0..16)
        .map(|i| Candidate::new(format!("action{i}"), i as f64 / 16.0, 1.0 - i as f64 / 16.0))
        .collect();
    c.bench_function("sample_decision/16", |b| {
        let mut ordinal = 0u64;
        b.iter(|| {
            ordinal += 1;
            let key = coachgate::decision_key("learner", ordinal);
            let d = coachgate::sample_decision(black_box(&candidates), &cfg, 7, &key);
            black_box(d.ok());
        })
    });
}

#[cfg(not(feature = "stochastic"))]
fn bench_sample_decision(_c: &mut Criterion) {}

criterion_group!(benches, bench_select_hybrid, bench_sample_decision);
criterion_main!(benches);
