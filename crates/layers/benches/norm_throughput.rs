use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::norm::{BatchNorm2d, BatchNormConfig};

fn bench_batch_norm(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 16usize;
    let channel_sizes = &[16usize, 64, 256];
    let side = 28usize;

    let mut group = c.benchmark_group("batch_norm2d");
    for &channels in channel_sizes {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut norm = BatchNorm2d::new(BatchNormConfig::new(channels), vb.pp("bn"))
            .expect("batch norm");
        let input =
            Tensor::randn(0f32, 1.0, (batch, channels, side, side), &device).expect("input");

        let elements = (batch * channels * side * side) as u64;
        group.throughput(Throughput::Elements(elements));

        norm.set_training(true);
        group.bench_with_input(
            BenchmarkId::new("train", channels),
            &input,
            |b, input| {
                b.iter(|| {
                    let out = norm.forward(black_box(input)).expect("forward");
                    black_box(out);
                });
            },
        );

        norm.set_training(false);
        group.bench_with_input(
            BenchmarkId::new("eval", channels),
            &input,
            |b, input| {
                b.iter(|| {
                    let out = norm.forward(black_box(input)).expect("forward");
                    black_box(out);
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_batch_norm);
criterion_main!(benches);
