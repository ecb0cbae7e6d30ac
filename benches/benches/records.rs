// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use futures::FutureExt;
use futures::executor::block_on;
use futures::future::ready;
use serde_json::{Value, json};
use understory_reactive::Store;
use understory_resolver::{Bridge, BridgeConfig, FetchFuture, RecordId, Request, normalize};

fn members(count: usize) -> Value {
    let users: Vec<Value> = (0..count)
        .map(|i| {
            json!({
                "__typename": "User",
                "id": format!("u{i}"),
                "name": format!("user {i}"),
                "manager": { "__typename": "User", "id": format!("u{}", i / 2) },
            })
        })
        .collect();
    json!({ "team": { "__typename": "Team", "id": "t1", "members": users } })
}

fn bench_records(c: &mut Criterion) {
    let mut group = c.benchmark_group("understory_resolver");
    group.sample_size(30);

    for &count in &[64_usize, 1_024] {
        let response = members(count);
        group.bench_function(format!("normalize(members={count})"), |b| {
            b.iter(|| black_box(normalize(&response)));
        });

        let store = Store::new();
        let payload = response.clone();
        let bridge = Bridge::new(
            &store,
            move |_: &Request| -> FetchFuture { ready(Ok(payload.clone())).boxed_local() },
            BridgeConfig::default(),
        );
        let team = bridge.request("team", json!({ "id": "t1" }));
        let _ = block_on(store.resolve(&team.node()));

        let target = RecordId::new("User", "u1");
        let mut n = 0_u64;
        group.bench_function(format!("patch_then_materialize(members={count})"), |b| {
            b.iter(|| {
                n += 1;
                bridge.patch(&target, "name", json!(n));
                black_box(store.get(&team.node()).ok());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_records);
criterion_main!(benches);
