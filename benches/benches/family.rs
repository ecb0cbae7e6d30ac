// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::json;
use understory_reactive::{CanonicalKey, CellSpec, FamilyPolicy, FamilySpec, Store};

fn bench_family(c: &mut Criterion) {
    let mut group = c.benchmark_group("understory_reactive_family");

    let params = json!({
        "dataset": "quickstart",
        "filters": { "label": ["cat", "dog"], "confidence": { "min": 0.5 } },
        "page": 3,
    });
    group.bench_function("canonical_key", |b| {
        b.iter(|| black_box(CanonicalKey::from_value(&params)));
    });

    let store = Store::new();
    let scale = store.cell(CellSpec::new("scale", 3_u64));
    let family = store.family(FamilySpec::new("scaled", move |ctx, n: &u64| {
        Ok(ctx.get(&scale)? * n)
    }));
    for n in 0..1_024_u64 {
        let _ = store.get(&family.get(&store, &n));
    }
    group.bench_function("hit(instances=1024)", |b| {
        let mut n = 0_u64;
        b.iter(|| {
            n = (n + 1) % 1_024;
            black_box(store.get(&family.get(&store, &n)).ok());
        });
    });

    let store = Store::new();
    let bounded = store.family(
        FamilySpec::new("bounded", |_, n: &u64| Ok(n + 1))
            .policy(FamilyPolicy::EvictUnobserved { capacity: 256 }),
    );
    group.bench_function("miss_with_eviction(capacity=256)", |b| {
        let mut n = 0_u64;
        b.iter(|| {
            n += 1;
            black_box(store.get(&bounded.get(&store, &n)).ok());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_family);
criterion_main!(benches);
