use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array1;
use secure_fl::{compress, decompress, GradientSet};

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    for &n_params in &[10_000usize, 1_000_000] {
        let grads: GradientSet =
            vec![Array1::from_shape_fn(n_params, |i| ((i * 7919) as f32).sin()).into_dyn()];

        for &ratio in &[0.01f64, 0.15] {
            let id = format!("{}p_r{}", n_params, ratio);

            group.bench_with_input(BenchmarkId::new("compress", &id), &grads, |b, g| {
                b.iter(|| compress(g, ratio, 16).unwrap())
            });

            let (update, meta) = compress(&grads, ratio, 16).unwrap();
            let bytes = update.to_bytes();
            group.bench_with_input(BenchmarkId::new("decompress", &id), &bytes, |b, bytes| {
                b.iter(|| decompress(bytes, &meta).unwrap())
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
