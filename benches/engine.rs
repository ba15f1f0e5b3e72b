extern crate criterion;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use lsmkv::{Engine, MemTableSize};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fmt;
use tempfile::TempDir;

const THRESHOLD: usize = 100;
const TABLES: usize = 20;

#[derive(Debug, Clone, Copy)]
enum Position {
    MemTable,
    NewestTable,
    OldestTable,
    Missing,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::MemTable => write!(f, "memtable"),
            Position::NewestTable => write!(f, "newest table"),
            Position::OldestTable => write!(f, "oldest table"),
            Position::Missing => write!(f, "missing"),
        }
    }
}

fn random_value(rng: &mut StdRng, len: usize) -> Bytes {
    Bytes::from((0..len).map(|_| rng.random()).collect::<Vec<u8>>())
}

/// Engine with `TABLES` flushed tables plus a half full memtable. Keys are
/// `key<n>` with `n` growing with every put.
fn populated_engine() -> (TempDir, Engine, usize) {
    let dir = tempfile::tempdir().unwrap();
    let engine = Engine::open(dir.path(), MemTableSize::Is(THRESHOLD)).unwrap();
    let mut rng = StdRng::seed_from_u64(42);

    let total = TABLES * (THRESHOLD + 1) + THRESHOLD / 2;
    for i in 0..total {
        let len = rng.random_range(16..256);
        engine
            .put(Bytes::from(format!("key{}", i)), random_value(&mut rng, len))
            .unwrap();
    }

    (dir, engine, total)
}

fn key_at(position: Position, total: usize) -> Bytes {
    let n = match position {
        Position::MemTable => total - 1,
        Position::NewestTable => TABLES * (THRESHOLD + 1) - 1,
        Position::OldestTable => 0,
        Position::Missing => total + 1,
    };
    Bytes::from(format!("key{}", n))
}

fn get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");

    group.warm_up_time(std::time::Duration::from_millis(250));

    let (_dir, engine, total) = populated_engine();

    for position in [
        Position::MemTable,
        Position::NewestTable,
        Position::OldestTable,
        Position::Missing,
    ] {
        let key = key_at(position, total);
        group.bench_with_input(BenchmarkId::new("get", position), &key, |b, key| {
            b.iter(|| engine.get(key).unwrap());
        });
    }
}

fn put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");

    group.warm_up_time(std::time::Duration::from_millis(250));

    for value_len in [16usize, 256, 4096] {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::open(dir.path(), MemTableSize::Is(THRESHOLD)).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let value = random_value(&mut rng, value_len);
        let mut i = 0u64;

        // Flushes are included, every `THRESHOLD + 1` puts write a table.
        group.bench_with_input(BenchmarkId::new("put", value_len), &value, |b, value| {
            b.iter(|| {
                i += 1;
                engine
                    .put(Bytes::from(format!("key{}", i)), value.clone())
                    .unwrap();
            });
        });
    }
}

criterion_group!(engine_ops, get, put);

criterion_main!(engine_ops);
