//! Measures request decoding and end-to-end dispatch through the worker pool.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tablekv::protocol::{write_request, FrameReader};
use tablekv::{Dispatcher, MemoryEngine, SledEngine, WorkerPool};
use tempfile::TempDir;

fn requests(n: usize, value_len: usize) -> Vec<u8> {
    let mut rng = SmallRng::seed_from_u64(42);
    let mut buf = Vec::new();
    for i in 0..n {
        let key = format!("bench:{}", i);
        let value: Vec<u8> = (0..value_len).map(|_| rng.gen()).collect();
        write_request(&mut buf, &[&b"SET"[..], key.as_bytes(), &value[..]]).unwrap();
    }
    buf
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");
    for value_len in [16, 1024, 64 * 1024] {
        let input = requests(100, value_len);
        group.throughput(Throughput::Bytes(input.len() as u64));
        group.bench_function(format!("set_{}b", value_len), |b| {
            b.iter(|| {
                let mut reader = FrameReader::new(input.as_slice());
                while let Some(args) = reader.read_request().unwrap() {
                    black_box(args);
                }
            })
        });
    }
    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    let pool = WorkerPool::new(MemoryEngine::new(), 4, 1024).unwrap();
    let dispatcher = Dispatcher::new(pool.queue().unwrap());
    dispatcher.dispatch(&[b"SET".to_vec(), b"hot".to_vec(), b"value".to_vec()]).unwrap();

    group.bench_function("memory_get", |b| {
        let args = vec![b"GET".to_vec(), b"hot".to_vec()];
        b.iter(|| black_box(dispatcher.dispatch(&args).unwrap()))
    });
    group.bench_function("memory_incr", |b| {
        let args = vec![b"INCR".to_vec(), b"counters:n".to_vec()];
        b.iter(|| black_box(dispatcher.dispatch(&args).unwrap()))
    });
    drop(dispatcher);
    pool.shutdown();

    let dir = TempDir::new().unwrap();
    let pool = WorkerPool::new(SledEngine::open(dir.path()).unwrap(), 4, 1024).unwrap();
    let dispatcher = Dispatcher::new(pool.queue().unwrap());
    group.bench_function("sled_set", |b| {
        let mut i = 0u64;
        b.iter_batched(
            || {
                i += 1;
                vec![b"SET".to_vec(), format!("t{}:k{}", i % 8, i).into_bytes(), b"value".to_vec()]
            },
            |args| black_box(dispatcher.dispatch(&args).unwrap()),
            BatchSize::SmallInput,
        )
    });
    drop(dispatcher);
    pool.shutdown();
    group.finish();
}

criterion_group!(benches, bench_decode, bench_dispatch);
criterion_main!(benches);
