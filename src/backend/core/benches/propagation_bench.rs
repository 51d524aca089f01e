//! Benchmarks for write propagation, aggregate state refresh, and saves.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use trellis_core::entity::{Entity, EntitySchema};
use trellis_core::persistence::{InMemoryStore, SaveOrchestrator};
use trellis_core::rules::{RuleRegistration, ShapeConstraint};

fn schemas() -> EntitySchema {
    let line = EntitySchema::builder("Line")
        .properties(["id", "sku", "qty", "price", "total"])
        .shape("sku", ShapeConstraint::Required)
        .shape("qty", ShapeConstraint::MinValue(1.0))
        .rule(RuleRegistration::derive("line-total", ["qty", "price"], "total", |ctx| {
            let qty = ctx.value("qty")?.as_f64().unwrap_or(0.0);
            let price = ctx.value("price")?.as_f64().unwrap_or(0.0);
            Ok(json!(qty * price))
        }))
        .build()
        .unwrap();
    EntitySchema::builder("Order")
        .properties(["id", "number"])
        .list("lines", &line)
        .build()
        .unwrap()
}

fn build_order(schema: &EntitySchema, lines: usize) -> Entity {
    let order = schema.create();
    order.set("number", "B-1").unwrap();
    let list = order.list("lines").unwrap();
    for i in 0..lines {
        let line = list.add_new().unwrap();
        line.set("sku", format!("SKU-{i}")).unwrap();
        line.set("qty", 1).unwrap();
        line.set("price", 9.5).unwrap();
    }
    order
}

fn bench_derived_write(c: &mut Criterion) {
    let schema = schemas();
    let order = build_order(&schema, 1);
    let line = order.list("lines").unwrap().first().unwrap();
    let mut qty = 1u64;

    c.bench_function("derived_write", |b| {
        b.iter(|| {
            qty = qty % 100 + 1;
            black_box(line.set("qty", qty).unwrap())
        });
    });
}

fn bench_state_propagation(c: &mut Criterion) {
    let schema = schemas();
    let mut group = c.benchmark_group("state_propagation");
    for size in [10, 100, 1_000] {
        let order = build_order(&schema, size);
        let last = order.list("lines").unwrap().get(size - 1).unwrap();
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                // Toggle validity so the change reaches the root every time
                last.set("sku", serde_json::Value::Null).unwrap();
                last.set("sku", "SKU").unwrap();
                black_box(order.is_valid())
            });
        });
    }
    group.finish();
}

fn bench_paused_bulk_load(c: &mut Criterion) {
    let schema = schemas();
    let mut group = c.benchmark_group("paused_bulk_load");
    for size in [10, 100, 1_000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            b.iter(|| {
                let order = schema.create();
                {
                    let _pause = order.pause();
                    let list = order.list("lines").unwrap();
                    for i in 0..n {
                        let line = list.add_new().unwrap();
                        line.set("sku", format!("SKU-{i}")).unwrap();
                        line.set("qty", 2).unwrap();
                    }
                }
                black_box(order.is_valid())
            });
        });
    }
    group.finish();
}

fn bench_save(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let schema = schemas();
    let orchestrator = SaveOrchestrator::new(Arc::new(InMemoryStore::new()));
    let mut group = c.benchmark_group("save_new_aggregate");
    for size in [10, 100] {
        group.throughput(Throughput::Elements(size as u64 + 1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &n| {
            b.to_async(&runtime).iter(|| {
                let order = build_order(&schema, n);
                let orchestrator = orchestrator.clone();
                async move {
                    let saved = orchestrator
                        .save(&order, &CancellationToken::new())
                        .await
                        .unwrap();
                    black_box(saved)
                }
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_derived_write,
    bench_state_propagation,
    bench_paused_bulk_load,
    bench_save
);
criterion_main!(benches);
