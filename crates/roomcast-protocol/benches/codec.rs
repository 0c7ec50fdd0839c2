//! Codec benchmarks for roomcast-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use roomcast_protocol::{codec, Envelope};
use serde_json::value::RawValue;

fn chat_envelope(text_len: usize) -> Envelope {
    let data = serde_json::to_string(&"x".repeat(text_len)).unwrap();
    Envelope::chat("general", RawValue::from_string(data).unwrap()).with_sender("user-1")
}

fn bench_encode_small(c: &mut Criterion) {
    let envelope = chat_envelope(64);

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("chat_64B", |b| {
        b.iter(|| codec::encode(black_box(&envelope)))
    });
    group.finish();
}

fn bench_decode_small(c: &mut Criterion) {
    let encoded = codec::encode(&chat_envelope(64)).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("chat_64B", |b| b.iter(|| codec::decode(black_box(&encoded))));
    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let envelope = chat_envelope(1024);

    c.bench_function("roundtrip_1KiB", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&envelope)).unwrap();
            codec::decode(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_encode_small,
    bench_decode_small,
    bench_roundtrip
);
criterion_main!(benches);
