//! Benchmark for NaN-boxed value encoding and decoding.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use vesper_core::Value;

fn bench_encode(c: &mut Criterion) {
    c.bench_function("encode_int", |b| {
        b.iter(|| {
            for i in 0..1000i32 {
                black_box(Value::int(black_box(i)));
            }
        });
    });

    c.bench_function("encode_number_integral", |b| {
        b.iter(|| {
            for i in 0..1000 {
                black_box(Value::number(black_box(f64::from(i))));
            }
        });
    });
}

fn bench_decode(c: &mut Criterion) {
    let values: Vec<Value> = (0..1000i32).map(Value::int).collect();
    c.bench_function("kind_and_decode", |b| {
        b.iter(|| {
            let mut acc = 0i64;
            for v in &values {
                if v.is_int() {
                    acc += i64::from(v.as_int());
                }
            }
            black_box(acc)
        });
    });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
