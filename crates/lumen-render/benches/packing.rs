//! Benchmarks for instance packing and batch building

use bytemuck::Zeroable;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use glam::{Vec2, Vec3};
use lumen_render::batch::{Batch, build_batches};
use lumen_render::half::{f16_to_f32, f32_to_f16};
use lumen_render::packer::{InstancePacker, pack_chunk};
use lumen_render::{CompactInstance, DrawRequest};

fn requests(count: usize) -> Vec<DrawRequest> {
    (0..count)
        .map(|i| DrawRequest {
            position: Vec3::new((i % 1920) as f32, (i / 1920) as f32, 0.5),
            rotation: i as f32 * 0.01,
            size: Vec2::new(16.0, 16.0),
            tint: [1.0, 0.5, 0.25, 1.0],
            ..Default::default()
        })
        .collect()
}

fn bench_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("instance_pack");
    let packer = InstancePacker::new(None).unwrap();

    for size in [1_000, 10_000, 65_536] {
        group.throughput(Throughput::Elements(size as u64));
        let queue = requests(size);
        let mut destination = vec![CompactInstance::zeroed(); size];

        group.bench_with_input(BenchmarkId::new("parallel", size), &size, |b, _| {
            b.iter(|| packer.pack(black_box(&queue), &mut destination).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("single_thread", size), &size, |b, _| {
            b.iter(|| pack_chunk(black_box(&queue), &mut destination));
        });
    }

    group.finish();
}

fn bench_build_batches(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_batches");

    for size in [1_000, 65_536] {
        group.throughput(Throughput::Elements(size as u64));
        let queue = requests(size);
        let mut batches: Vec<Batch> = Vec::new();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                build_batches(black_box(&queue), &mut batches);
                batches.len()
            });
        });
    }

    group.finish();
}

fn bench_half_conversion(c: &mut Criterion) {
    let values: Vec<f32> = (0..4096).map(|i| (i as f32 - 2048.0) * 0.37).collect();

    c.bench_function("f32_to_f16_round_trip", |b| {
        b.iter(|| {
            values
                .iter()
                .map(|&v| f16_to_f32(f32_to_f16(black_box(v))))
                .sum::<f32>()
        });
    });
}

criterion_group!(benches, bench_pack, bench_build_batches, bench_half_conversion);
criterion_main!(benches);
