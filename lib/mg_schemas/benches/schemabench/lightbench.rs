use criterion::{black_box, criterion_group, Criterion};
use mg_schemas::coordinates::SECTION_VOLUME;
use mg_schemas::light::{LightLevel, NibbleArray};

fn bench_nibble_fill(c: &mut Criterion) {
    let levels: Vec<LightLevel> = (0..SECTION_VOLUME)
        .map(|i| LightLevel::try_new((i % 16) as i32).unwrap())
        .collect();
    c.bench_function("NibbleArray per-position fill", |b| {
        b.iter(|| {
            let mut arr = NibbleArray::new();
            for (idx, &level) in levels.iter().enumerate() {
                arr.set(idx, level);
            }
            black_box(arr)
        })
    });
}

fn bench_nibble_read(c: &mut Criterion) {
    let mut arr = NibbleArray::new();
    arr.fill(LightLevel::try_new(9).unwrap());
    c.bench_function("NibbleArray sum", |b| {
        b.iter(|| (0..SECTION_VOLUME).map(|i| u32::from(black_box(&arr).get(i))).sum::<u32>())
    });
}

criterion_group!(light_benches, bench_nibble_fill, bench_nibble_read);
