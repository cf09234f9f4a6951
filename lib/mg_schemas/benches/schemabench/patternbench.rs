use criterion::{black_box, criterion_group, BenchmarkId, Criterion};
use mg_schemas::block::BlockState;
use mg_schemas::pattern::Pattern;
use rand::prelude::*;
use rand_pcg::Pcg64Mcg;

const RANDOM_SEED: u64 = 0x9e3779b97f4a7c15;

fn random_pattern(variants: u32) -> Pattern {
    let mut rng = Pcg64Mcg::seed_from_u64(RANDOM_SEED);
    Pattern::new((0..variants).map(|v| (BlockState::new(v + 1), rng.gen_range(0.5..100.0)))).unwrap()
}

fn bench_pattern_build(c: &mut Criterion) {
    for variants in [1, 4, 64, 1024] {
        c.bench_with_input(BenchmarkId::new("Pattern build", variants), &variants, |b, &variants| {
            b.iter(|| random_pattern(black_box(variants)))
        });
    }
}

fn bench_pattern_sample(c: &mut Criterion) {
    for variants in [1, 4, 64, 1024] {
        let pattern = random_pattern(variants);
        let mut rng = Pcg64Mcg::seed_from_u64(RANDOM_SEED);
        c.bench_with_input(BenchmarkId::new("Pattern sample", variants), &variants, |b, _| {
            b.iter(|| pattern.sample(&mut rng))
        });
    }
}

criterion_group!(pattern_benches, bench_pattern_build, bench_pattern_sample);
