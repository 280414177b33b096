use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use metricval::synthetic::{SyntheticData, SyntheticParams, generate};
use metricval::{Pipeline, PipelineConfig};
use rand::SeedableRng;
use rand::rngs::StdRng;

fn synthetic(metrics: usize) -> SyntheticData {
    let params = SyntheticParams {
        subjects_per_group: 200,
        metrics,
        ..SyntheticParams::default()
    };
    let mut rng = StdRng::seed_from_u64(0x5EED + metrics as u64);
    generate(&params, &mut rng).expect("synthetic data")
}

fn run_pipeline(data: &SyntheticData, parallel: bool) {
    let config = PipelineConfig {
        parallel,
        ..PipelineConfig::default()
    };
    let results = Pipeline::new(
        data.schema.clone(),
        data.reference.clone(),
        data.impaired.clone(),
        config,
    )
    .expect("valid pipeline")
    .run_all()
    .expect("pipeline run");
    black_box(results);
}

fn benchmark_pipeline(c: &mut Criterion) {
    let metric_counts = [4_usize, 16, 48];
    let inputs: Vec<_> = metric_counts
        .iter()
        .map(|&count| (count, synthetic(count)))
        .collect();

    let mut group = c.benchmark_group("pipeline_run_all");
    group.sample_size(20);
    for (count, data) in inputs.iter() {
        group.throughput(Throughput::Elements(*count as u64));

        group.bench_with_input(BenchmarkId::new("sequential", count), data, |b, input| {
            b.iter(|| run_pipeline(black_box(input), false));
        });

        group.bench_with_input(BenchmarkId::new("parallel", count), data, |b, input| {
            b.iter(|| run_pipeline(black_box(input), true));
        });
    }
    group.finish();
}

criterion_group!(pipeline, benchmark_pipeline);
criterion_main!(pipeline);
