//! Performance Benchmarks for Generative Teaching
//!
//! Run with: cargo bench
//!
//! Benchmarks cover:
//! - Functional ops (im2col convolution vs candle conv2d)
//! - Modulated convolution strategies
//! - Inner-loop steps and full outer iterations
//! - Config serialisation

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use generative_teaching::{
    curriculum::cyclic_labels,
    functional::{conv2d_same, one_hot},
    inner_loop::{unroll, InnerHyper, SyntheticBatch, UnrollMode},
    stylegan::{ConvStrategy, ModConvConfig, ModulatedConv2d},
    GenerativeTeachingNetwork, GtnConfig, ImageDataset, Student, StudentArch,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

// ═══════════════════════════════════════════════════════════════════════════
// FUNCTIONAL BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_conv2d(c: &mut Criterion) {
    let device = Device::Cpu;

    let mut group = c.benchmark_group("conv2d");
    for channels in [4usize, 16, 32].iter() {
        let x = Tensor::randn(0.0f32, 1.0, (16, *channels, 14, 14), &device).unwrap();
        let w = Tensor::randn(0.0f32, 1.0, (*channels, *channels, 3, 3), &device).unwrap();
        let bias = Tensor::zeros(*channels, DType::F32, &device).unwrap();
        group.throughput(Throughput::Elements((16 * channels * 14 * 14) as u64));
        group.bench_with_input(BenchmarkId::new("im2col", channels), &(), |b, _| {
            b.iter(|| conv2d_same(black_box(&x), &w, &bias).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("candle", channels), &(), |b, _| {
            b.iter(|| black_box(&x).conv2d(&w, 1, 1, 1, 1).unwrap())
        });
    }
    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// MODULATED CONVOLUTION BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_modconv(c: &mut Criterion) {
    let device = Device::Cpu;
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let conv = ModulatedConv2d::new(ModConvConfig::new(16, 16, 3, 64), vb).unwrap();

    let mut group = c.benchmark_group("modconv");
    for batch in [1usize, 4, 16].iter() {
        let x = Tensor::randn(0.0f32, 1.0, (*batch, 16, 16, 16), &device).unwrap();
        let w = Tensor::randn(0.0f32, 1.0, (*batch, 64), &device).unwrap();
        for (name, strategy) in [("per_sample", ConvStrategy::PerSample), ("grouped", ConvStrategy::Grouped)] {
            group.bench_with_input(BenchmarkId::new(name, batch), &(), |b, _| {
                b.iter(|| conv.forward_with(black_box(&x), &w, strategy).unwrap())
            });
        }
    }
    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// TRAINING BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_inner_unroll(c: &mut Criterion) {
    let device = Device::Cpu;
    let config = GtnConfig::tiny();
    let student = Student::new(StudentArch { conv1: 8, conv2: 16 }, &config).unwrap();
    let mut rng = StdRng::seed_from_u64(0);
    let params = student.init_params(&mut rng, &device).unwrap();
    let batch = SyntheticBatch {
        images: Tensor::randn(0.0f32, 1.0, (32, 1, 8, 8), &device).unwrap(),
        one_hot: one_hot(&cyclic_labels(32, 10), 10, &device).unwrap(),
    };
    let hyper = InnerHyper::new(
        Tensor::new(&[0.02f32], &device).unwrap(),
        Tensor::new(&[0.5f32], &device).unwrap(),
    );

    let mut group = c.benchmark_group("inner_unroll");
    group.sample_size(10);
    for steps in [1usize, 4, 8].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(steps), steps, |b, &steps| {
            b.iter(|| {
                unroll(&student, params.clone(), &hyper, steps, UnrollMode::Differentiable, |_| {
                    Ok(batch.clone())
                })
                .unwrap()
            })
        });
    }
    group.finish();
}

fn bench_outer_step(c: &mut Criterion) {
    let device = Device::Cpu;
    let config = GtnConfig::tiny();
    let real = ImageDataset::synthetic_blocks(config.batch_size, 8, 10, 0.2, 0, &device).unwrap();
    let mut gtn = GenerativeTeachingNetwork::new(config, &device).unwrap();

    let mut group = c.benchmark_group("outer_step");
    group.sample_size(10);
    group.bench_function("tiny", |b| {
        b.iter(|| gtn.outer_step(real.images(), real.labels()).unwrap())
    });
    group.finish();
}

// ═══════════════════════════════════════════════════════════════════════════
// CONFIG BENCHMARKS
// ═══════════════════════════════════════════════════════════════════════════

fn bench_config_serialization(c: &mut Criterion) {
    let config = GtnConfig::default();
    c.bench_function("config_serialize", |b| {
        b.iter(|| serde_json::to_string(black_box(&config)).unwrap())
    });
}

// ═══════════════════════════════════════════════════════════════════════════
// CRITERION GROUPS
// ═══════════════════════════════════════════════════════════════════════════

criterion_group!(functional_benches, bench_conv2d,);

criterion_group!(modconv_benches, bench_modconv,);

criterion_group!(training_benches, bench_inner_unroll, bench_outer_step,);

criterion_group!(config_benches, bench_config_serialization,);

criterion_main!(
    functional_benches,
    modconv_benches,
    training_benches,
    config_benches,
);
