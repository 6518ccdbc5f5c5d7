//! Benchmarks for the hot normalization and classification paths.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use specforge::lowering::cache::IrCache;
use specforge::lowering::normalize;

fn bench_normalizer(c: &mut Criterion) {
    c.bench_function("to_snake_case", |b| {
        b.iter(|| normalize::to_snake_case(black_box("CustomerOrderLineItemQuantity")));
    });

    c.bench_function("normalize_operation", |b| {
        b.iter(|| normalize::normalize_operation(black_box("RemoveItemFromCart")));
    });

    c.bench_function("levenshtein_identifiers", |b| {
        b.iter(|| normalize::similarity(black_box("customer_order"), black_box("customer_orders")));
    });
}

fn bench_cache_key(c: &mut Criterion) {
    let spec = "# Shop\n\nAn order management API with customers, orders and payments.\n"
        .repeat(64);
    c.bench_function("canonicalize_and_key", |b| {
        b.iter(|| {
            let canonical = normalize::canonicalize_spec(black_box(&spec));
            IrCache::key(&canonical, "strict=false;mode=Hybrid")
        });
    });
}

criterion_group!(benches, bench_normalizer, bench_cache_key);
criterion_main!(benches);
