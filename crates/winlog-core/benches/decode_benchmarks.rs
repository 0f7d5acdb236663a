//! Variant decoding benchmarks
//!
//! Run with: cargo bench -p winlog-core

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use winlog_core::variant::layout::encode_to_set;
use winlog_core::{FileTime, Guid, VariantKind, VariantValue};

fn system_like_values() -> Vec<VariantValue> {
    vec![
        VariantValue::String("Service Control Manager".into()),
        Guid::parse("{555908d1-a6d7-4695-8e1e-26931d2012f4}")
            .map(VariantValue::Guid)
            .unwrap_or(VariantValue::Null),
        VariantValue::UInt16(7036),
        VariantValue::UInt16(16384),
        VariantValue::Byte(4),
        VariantValue::UInt16(0),
        VariantValue::Byte(0),
        VariantValue::HexInt64(0x8080_0000_0000_0000),
        VariantValue::FileTime(FileTime::from_unix_seconds(1_700_000_000)),
        VariantValue::UInt64(10811),
        VariantValue::Null,
        VariantValue::Null,
        VariantValue::UInt32(712),
        VariantValue::UInt32(9304),
        VariantValue::String("System".into()),
        VariantValue::String("WIN-BUILD-01".into()),
        VariantValue::Null,
        VariantValue::Byte(0),
    ]
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    let set = encode_to_set(&system_like_values());
    group.throughput(Throughput::Bytes(set.byte_len() as u64));
    group.bench_function("system_values", |b| {
        b.iter(|| black_box(&set).to_values())
    });

    group.bench_function("record_id_only", |b| {
        b.iter(|| black_box(&set).get(9).and_then(|v| v.as_u64()).unwrap())
    });

    let strings: Vec<String> = (0..64).map(|i| format!("insert string {i}")).collect();
    let array = encode_to_set(&[VariantValue::Array {
        kind: VariantKind::String,
        items: strings.into_iter().map(VariantValue::String).collect(),
    }]);
    group.bench_function("string_array_64", |b| {
        b.iter(|| black_box(&array).to_values())
    });

    group.finish();
}

criterion_group!(benches, bench_decode);
criterion_main!(benches);
