use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tempfile::TempDir;

use std::sync::Arc;
use std::time::Duration;

use relog::commitlog::CommitLogWriter;
use relog::encoding::Encoder;
use relog::{
    BootstrapSource, CommitLogOptions, CommitLogSource, Datapoint, FilesystemInspection, Options,
    RetentionOptions, SeriesId, ShardTimeRanges, TimeRange, TimeRanges, TimeUnit,
};

const SEED: u64 = 0x_5245_4C4F_475F_4245; // fixed seed for stable fixtures

const MINUTE: u64 = 60 * 1_000_000_000;
const BLOCK: u64 = 120 * MINUTE;
const BASE: u64 = 12 * BLOCK;

struct WriteOp {
    series: String,
    shard: u32,
    ts: u64,
    val: f64,
}

fn gen_ops(points: usize, series_count: usize, num_shards: u32) -> Vec<WriteOp> {
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut ops = Vec::with_capacity(points);

    for i in 0..points {
        let series_idx = i % series_count;
        ops.push(WriteOp {
            series: format!("series_{}", series_idx),
            shard: (series_idx as u32) % num_shards,
            // Mildly out of order, the way replayed commit logs arrive.
            ts: BASE + (i as u64) * 1_000 + rng.random_range(0..500u64),
            val: rng.random::<u32>() as f64 * 0.001,
        });
    }

    ops
}

fn make_options(prefix: &std::path::Path) -> Options {
    Options {
        retention: RetentionOptions {
            block_size: Duration::from_secs(2 * 60 * 60),
            buffer_past: Duration::from_secs(10 * 60),
            buffer_future: Duration::from_secs(2 * 60),
        },
        commit_log: CommitLogOptions {
            path_prefix: prefix.to_path_buf(),
            ..CommitLogOptions::default()
        },
        encoding_concurrency: 4,
        merge_shards_concurrency: 4,
        ..Options::default()
    }
}

fn bench_encoder_throughput(c: &mut Criterion) {
    let ops = gen_ops(20_000, 1, 1);

    c.bench_function("encode_20k_points_single_stream", |b| {
        b.iter_batched(
            || {
                let mut enc = Encoder::new();
                enc.reset(BASE, 4096);
                enc
            },
            |mut enc| {
                let mut last = 0u64;
                for op in &ops {
                    // Keep strictly increasing for the single-stream bench.
                    let ts = op.ts.max(last + 1);
                    last = ts;
                    enc.encode(
                        black_box(Datapoint {
                            timestamp: ts,
                            value: op.val,
                        }),
                        TimeUnit::Nanoseconds,
                        None,
                    )
                    .unwrap();
                }
                enc
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_read_pipeline(c: &mut Criterion) {
    let num_shards = 4u32;
    let ops = gen_ops(20_000, 64, num_shards);

    // Build the on-disk fixture once; read is non-destructive.
    let dir = TempDir::new().expect("tempdir");
    let mut writer =
        CommitLogWriter::create(dir.path(), BASE + 10 * MINUTE, 15 * MINUTE, 0).expect("writer");
    for op in &ops {
        writer
            .append(
                &SeriesId::new("metrics", &op.series),
                op.shard,
                Datapoint {
                    timestamp: op.ts,
                    value: op.val,
                },
                TimeUnit::Nanoseconds,
                None,
            )
            .expect("append");
    }
    writer.flush().expect("flush");

    let inspection = FilesystemInspection::capture(dir.path()).expect("inspection");
    let mut str_map = ShardTimeRanges::new();
    for shard in 0..num_shards {
        str_map.set(shard, TimeRanges::single(TimeRange::new(BASE, BASE + BLOCK)));
    }

    c.bench_function("bootstrap_read_20k_points_4_shards", |b| {
        b.iter(|| {
            let source = CommitLogSource::new(make_options(dir.path()), inspection.clone());
            let result = source
                .read("metrics", black_box(&str_map))
                .expect("read")
                .expect("result");
            black_box(Arc::new(result))
        })
    });
}

criterion_group!(benches, bench_encoder_throughput, bench_read_pipeline);
criterion_main!(benches);
