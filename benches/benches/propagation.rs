// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use understory_reactive::{Cell, CellSpec, Derivation, DerivationSpec, Store};

/// A cell feeding a chain of `len` derivations, each adding one.
fn build_chain(len: usize) -> (Store, Cell<u64>, Derivation<u64>) {
    let store = Store::new();
    let source = store.cell(CellSpec::new("source", 0_u64));
    let mut tail = store.derivation(DerivationSpec::new("d0", move |ctx| {
        Ok(ctx.get(&source)? + 1)
    }));
    for i in 1..len {
        let prev = tail;
        tail = store.derivation(DerivationSpec::new(format!("d{i}"), move |ctx| {
            Ok(ctx.get(&prev)? + 1)
        }));
    }
    (store, source, tail)
}

/// A cell read by `width` derivations that all collapse to its parity, then
/// summed by one root.
fn build_fan(width: usize) -> (Store, Cell<u64>, Derivation<u64>) {
    let store = Store::new();
    let source = store.cell(CellSpec::new("source", 0_u64));
    let leaves: Vec<Derivation<u64>> = (0..width)
        .map(|i| {
            store.derivation(DerivationSpec::new(format!("leaf{i}"), move |ctx| {
                Ok(ctx.get(&source)? % 2)
            }))
        })
        .collect();
    let root = store.derivation(DerivationSpec::new("root", move |ctx| {
        leaves.iter().try_fold(0_u64, |acc, leaf| Ok(acc + ctx.get(leaf)?))
    }));
    (store, source, root)
}

fn bench_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("understory_reactive");
    group.sample_size(50);

    for &len in &[16_usize, 256, 2_048] {
        group.bench_function(format!("chain_write_then_read(len={len})"), |b| {
            b.iter_batched(
                || {
                    let (store, source, tail) = build_chain(len);
                    let _ = store.get(&tail);
                    (store, source, tail)
                },
                |(store, source, tail)| {
                    store.set(&source, 1);
                    black_box(store.get(&tail).ok());
                },
                BatchSize::LargeInput,
            );
        });

        group.bench_function(format!("chain_clean_read(len={len})"), |b| {
            let (store, _, tail) = build_chain(len);
            let _ = store.get(&tail);
            b.iter(|| black_box(store.get(&tail).ok()));
        });
    }

    for &width in &[64_usize, 1_024] {
        // Even-to-even writes stop at the leaves.
        group.bench_function(format!("fan_early_cutoff(width={width})"), |b| {
            let (store, source, root) = build_fan(width);
            let _ = store.get(&root);
            let mut next = 0_u64;
            b.iter(|| {
                next += 2;
                store.set(&source, next);
                black_box(store.get(&root).ok());
            });
        });

        group.bench_function(format!("fan_batched_writes(width={width})"), |b| {
            let (store, source, root) = build_fan(width);
            let _ = store.get(&root);
            let mut next = 0_u64;
            b.iter(|| {
                store.batch(|s| {
                    for _ in 0..8 {
                        next += 1;
                        s.set(&source, next);
                    }
                });
                black_box(store.get(&root).ok());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_propagation);
criterion_main!(benches);
