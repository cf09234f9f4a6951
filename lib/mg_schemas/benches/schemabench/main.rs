use criterion::criterion_main;

pub mod lightbench;
pub mod patternbench;

criterion_main!(patternbench::pattern_benches, lightbench::light_benches);
