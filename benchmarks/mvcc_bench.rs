//! LumaDB MVCC Column Store Benchmarks
//!
//! Key index probing, upsert throughput and versioned reads.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use luma_mvcc::memory::Buffer;
use luma_mvcc::tablet::PartialRowWriter;
use luma_mvcc::types::hash_code;
use luma_mvcc::{Config, HashIndex, MemTablet, ScanSpec, Schema, Value};
use std::sync::Arc;

// Benchmark configurations
const SMALL_BATCH: usize = 1_000;
const MEDIUM_BATCH: usize = 10_000;
const LARGE_BATCH: usize = 100_000;

fn schema() -> Schema {
    "int32 id,int32 uv,int32 pv,int8 city null".parse().unwrap()
}

fn loaded_tablet(rows: i32) -> Arc<MemTablet> {
    let tablet = MemTablet::create("/tmp/bench", schema(), Config::default()).unwrap();
    let schema = tablet.latest_schema();
    let mut row = PartialRowWriter::new(schema.clone());
    let mut writer = tablet.sub_tablet().begin_write(&schema).unwrap();
    for id in 0..rows {
        row.set("id", Some(Value::Int32(id))).unwrap();
        row.set("uv", Some(Value::Int32(id))).unwrap();
        row.set("pv", Some(Value::Int32(0))).unwrap();
        writer.apply_row(&row.build().unwrap()).unwrap();
    }
    writer.commit(1).unwrap();
    tablet
}

/// Benchmark hash index add and find
fn bench_hash_index(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_index");

    for size in [SMALL_BATCH, MEDIUM_BATCH, LARGE_BATCH] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("add", size), &size, |b, &size| {
            b.iter(|| {
                let mut index = HashIndex::new(size).unwrap();
                for i in 0..size as u64 {
                    index.add(hash_code(i), i as u32);
                }
                black_box(index.size())
            })
        });

        let mut index = HashIndex::new(size).unwrap();
        for i in 0..size as u64 {
            index.add(hash_code(i), i as u32);
        }
        group.bench_with_input(BenchmarkId::new("find", size), &size, |b, &size| {
            let mut entries = Vec::new();
            b.iter(|| {
                let mut found = 0;
                for i in 0..size as u64 {
                    index.find(hash_code(i), &mut entries);
                    found += entries.len();
                }
                black_box(found)
            })
        });
    }

    group.finish();
}

/// Benchmark upserts of new rows and of existing rows
fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert");
    group.sample_size(10);

    for size in [SMALL_BATCH, MEDIUM_BATCH] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("insert", size), &size, |b, &size| {
            b.iter(|| black_box(loaded_tablet(size as i32)))
        });
    }

    let tablet = loaded_tablet(MEDIUM_BATCH as i32);
    let schema = tablet.latest_schema();
    let mut version = 1;
    group.throughput(Throughput::Elements(MEDIUM_BATCH as u64));
    group.bench_function("update", |b| {
        let mut row = PartialRowWriter::new(schema.clone());
        b.iter(|| {
            version += 1;
            let mut writer = tablet.sub_tablet().begin_write(&schema).unwrap();
            for id in 0..MEDIUM_BATCH as i32 {
                row.set("id", Some(Value::Int32(id))).unwrap();
                row.set("pv", Some(Value::Int32(version as i32))).unwrap();
                writer.apply_row(&row.build().unwrap()).unwrap();
            }
            black_box(writer.commit(version).unwrap())
        })
    });

    group.finish();
}

/// Benchmark scans of the latest and of an older version
fn bench_versioned_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("versioned_scan");

    let tablet = loaded_tablet(LARGE_BATCH as i32);
    let schema = tablet.latest_schema();
    let mut row = PartialRowWriter::new(schema.clone());
    for version in 2..=6 {
        let mut writer = tablet.sub_tablet().begin_write(&schema).unwrap();
        for id in (0..LARGE_BATCH as i32).step_by(97) {
            row.set("id", Some(Value::Int32(id))).unwrap();
            row.set("pv", Some(Value::Int32(version))).unwrap();
            writer.apply_row(&row.build().unwrap()).unwrap();
        }
        writer.commit(version as u64).unwrap();
    }

    group.throughput(Throughput::Elements(LARGE_BATCH as u64));
    for version in [1u64, 3, 6] {
        group.bench_with_input(BenchmarkId::new("pv", version), &version, |b, &version| {
            b.iter(|| {
                let mut scan = tablet
                    .scan(ScanSpec::parse(version, "pv", false).unwrap())
                    .unwrap();
                let mut sum = 0i64;
                while let Some(block) = scan.next_scan_block().unwrap() {
                    let pv = block.column(0).unwrap().typed::<i32>().unwrap();
                    sum += pv.iter().map(|&v| v as i64).sum::<i64>();
                }
                black_box(sum)
            })
        });
    }

    group.finish();
}

/// Benchmark page-sized allocations
fn bench_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocation");

    group.bench_function("page_i64", |b| {
        b.iter(|| black_box(Buffer::alloc_elements::<i64>(luma_mvcc::BLOCK_SIZE).unwrap()))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_hash_index,
    bench_upsert,
    bench_versioned_scan,
    bench_allocation,
);

criterion_main!(benches);
