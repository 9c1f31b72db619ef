//! Matmul kernel benchmarks: dense f32 against streamed Q4/Q8 blocks

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use emberlm_engine::kernels::{matmul, quant_matmul, KernelDispatch};
use emberlm_engine::tensor::{Q4Tensor, Q8Tensor};

fn sample(len: usize, salt: u64) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let x = ((i as u64).wrapping_mul(6364136223846793005).wrapping_add(salt) >> 33) % 2000;
            x as f32 / 1000.0 - 1.0
        })
        .collect()
}

fn bench_matmul(c: &mut Criterion) {
    let (m, k, n) = (1, 512, 512);
    let a = sample(m * k, 1);
    let b = sample(k * n, 2);
    let q4 = Q4Tensor::quantize(&b, k, n, 32).unwrap();
    let q8 = Q8Tensor::quantize(&b, k, n, 32).unwrap();
    let mut out = vec![0.0f32; m * n];

    let detected = KernelDispatch::select(true);
    let scalar = KernelDispatch::scalar();

    let mut group = c.benchmark_group("matmul_512x512");
    group.bench_function("f32_detected", |bench| {
        bench.iter(|| {
            matmul::matmul(&detected, black_box(&mut out), &a, &b, m, k, n).unwrap();
        })
    });
    group.bench_function("f32_scalar", |bench| {
        bench.iter(|| {
            matmul::matmul(&scalar, black_box(&mut out), &a, &b, m, k, n).unwrap();
        })
    });
    group.bench_function("q4_detected", |bench| {
        bench.iter(|| {
            quant_matmul::matmul_q4(&detected, black_box(&mut out), &a, &q4, m, k, n).unwrap();
        })
    });
    group.bench_function("q8_detected", |bench| {
        bench.iter(|| {
            quant_matmul::matmul_q8(&detected, black_box(&mut out), &a, &q8, m, k, n).unwrap();
        })
    });
    group.finish();
}

fn bench_prefill_shape(c: &mut Criterion) {
    // A prompt-sized batch: 32 rows exercises the parallel row path.
    let (m, k, n) = (32, 512, 512);
    let a = sample(m * k, 3);
    let b = sample(k * n, 4);
    let mut out = vec![0.0f32; m * n];
    let detected = KernelDispatch::select(true);

    c.bench_function("matmul_prefill_32x512x512", |bench| {
        bench.iter(|| {
            matmul::matmul(&detected, black_box(&mut out), &a, &b, m, k, n).unwrap();
        })
    });
}

criterion_group!(benches, bench_matmul, bench_prefill_shape);
criterion_main!(benches);
