use criterion::{criterion_group, criterion_main, Criterion};
use domstore::{DomStore, Settings};
use rand::seq::SliceRandom;
use rand::SeedableRng;

criterion_group!(benches, put_benchmark, get_benchmark);
criterion_main!(benches);

pub fn put_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dom.db");

    let mut items = Vec::new();
    for i in 0..100000 {
        let key = format!("key{i:06}");
        let val = format!("val{i:06}");
        items.push((key, val));
    }
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);

    let store = DomStore::open(&path, Settings::default()).unwrap();
    let owner = store.new_owner();

    c.bench_function("put", |b| {
        b.iter(|| {
            let (key, val) = items.choose(&mut rng).unwrap();
            store.put(owner, key.as_bytes(), val.as_bytes()).unwrap();
        })
    });
}

pub fn get_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dom.db");

    let mut items = Vec::new();
    for i in 0..10000 {
        let key = format!("key{i:06}");
        let val = format!("val{i:0200}");
        items.push((key, val));
    }
    let mut rng = rand::rngs::StdRng::seed_from_u64(0);

    let store = DomStore::open(&path, Settings::default()).unwrap();
    let owner = store.new_owner();
    for (key, val) in &items {
        store.put(owner, key.as_bytes(), val.as_bytes()).unwrap();
    }

    c.bench_function("get", |b| {
        b.iter(|| {
            let (key, val) = items.choose(&mut rng).unwrap();
            assert_eq!(val.as_bytes(), store.get(key.as_bytes()).unwrap());
        })
    });
}
