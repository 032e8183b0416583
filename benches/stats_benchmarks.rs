use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::{ArrayD, IxDyn};
use rand::prelude::*;

use bioimage_core::{AxisId, DatasetMeasure, Measure, Sample, Statistic, StatsCalculator, Tensor, TensorId};

fn random_sample(rng: &mut StdRng, size: usize) -> Sample {
    let values: Vec<f32> = (0..2 * size * size).map(|_| rng.gen_range(0.0..255.0)).collect();
    let data = ArrayD::from_shape_vec(IxDyn(&[1, 2, size, size]), values).unwrap();
    let tensor = Tensor::new(data, vec![AxisId::Batch, AxisId::Channel, AxisId::Y, AxisId::X]).unwrap();
    Sample::from_members([(TensorId::new("raw"), tensor)])
}

fn measures(per_channel: bool) -> Vec<Measure> {
    let axes = if per_channel {
        Some(vec![AxisId::Batch, AxisId::Y, AxisId::X])
    } else {
        None
    };
    [Statistic::Mean, Statistic::Std, Statistic::Quantile(0.01), Statistic::Quantile(0.99)]
        .into_iter()
        .map(|stat| Measure::Dataset(DatasetMeasure::new("raw", axes.clone(), stat)))
        .collect()
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut group = c.benchmark_group("dataset_statistics");

    for size in [64usize, 256] {
        let samples: Vec<Sample> = (0..8).map(|_| random_sample(&mut rng, size)).collect();
        for per_channel in [false, true] {
            let label = if per_channel { "per_channel" } else { "global" };
            group.bench_with_input(BenchmarkId::new(label, size), &samples, |b, samples| {
                b.iter(|| {
                    let mut calculator = StatsCalculator::new(measures(per_channel)).unwrap();
                    for sample in samples {
                        calculator.update(sample).unwrap();
                    }
                    calculator.finalize().unwrap()
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
