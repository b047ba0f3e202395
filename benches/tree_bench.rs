//! Benchmarks for logtree tree and environment operations

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use logtree::{Config, Environment};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

fn random_keys(count: usize, seed: u64) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| {
            let len = rng.gen_range(1..=16);
            (0..len).map(|_| rng.gen()).collect()
        })
        .collect()
}

fn open(dir: &TempDir) -> Environment {
    let config = Config::builder()
        .data_dir(dir.path())
        .log_file_size(1024 * 1024)
        .tree_page_size(1024)
        .gc_enabled(false)
        .build();
    Environment::open(config).unwrap()
}

fn tree_benchmarks(c: &mut Criterion) {
    let keys = random_keys(10_000, 7);
    let value = [0xabu8; 32];

    c.bench_function("commit 1000 random puts", |b| {
        b.iter_batched(
            || TempDir::new().unwrap(),
            |dir| {
                let env = open(&dir);
                env.execute_in_transaction(|txn| {
                    let store = txn.open_store("bench")?;
                    for key in &keys[..1000] {
                        txn.put(&store, key, &value)?;
                    }
                    Ok(())
                })
                .unwrap();
                env.close().unwrap();
            },
            BatchSize::PerIteration,
        )
    });

    let dir = TempDir::new().unwrap();
    let env = open(&dir);
    env.execute_in_transaction(|txn| {
        let store = txn.open_store("bench")?;
        for key in &keys {
            txn.put(&store, key, &value)?;
        }
        Ok(())
    })
    .unwrap();

    c.bench_function("snapshot point reads", |b| {
        let txn = env.begin_read();
        let store = txn.store("bench").unwrap();
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(txn.get(&store, &keys[i]).unwrap());
        })
    });

    c.bench_function("full cursor scan", |b| {
        let txn = env.begin_read();
        let store = txn.store("bench").unwrap();
        b.iter(|| {
            let count = txn.open_cursor(&store).unwrap().count();
            black_box(count);
        })
    });
}

criterion_group!(benches, tree_benchmarks);
criterion_main!(benches);
