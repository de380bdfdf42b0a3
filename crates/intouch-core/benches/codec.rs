//! Codec benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use intouch_core::datas::{Datas, StatusChange};
use intouch_core::{decode, encode, MemoryImage, Package, PackageContent};

fn status_push() -> Package {
    let changes = (0..16)
        .map(|i| StatusChange {
            pos: i * 4,
            data: [i as u8, 0xff],
        })
        .collect();
    Package::authorized(
        Bytes::from_static(b"SPA00:11:22:33:44:55"),
        Bytes::from_static(b"IOS3f0c2a8e-5d1b-4c6e-9a7f-0b1c2d3e4f50"),
        PackageContent::Unknown(Datas::StatusPush(changes).compose()),
    )
}

fn encode_benchmark(c: &mut Criterion) {
    let package = status_push();

    c.bench_function("encode_status_push", |b| {
        b.iter(|| black_box(encode(&package)))
    });
}

fn decode_benchmark(c: &mut Criterion) {
    let encoded = encode(&status_push());

    c.bench_function("decode_status_push", |b| {
        b.iter(|| black_box(decode(&encoded)))
    });
}

fn stream_benchmark(c: &mut Criterion) {
    let ping = Package::authorized(&b"a"[..], &b"b"[..], PackageContent::Ping);
    let mut stream = Vec::new();
    for _ in 0..32 {
        stream.extend_from_slice(&encode(&ping));
        stream.extend_from_slice(&encode(&status_push()));
    }

    c.bench_function("decode_stream_64_frames", |b| {
        b.iter(|| black_box(decode(&stream)))
    });
}

fn memory_benchmark(c: &mut Criterion) {
    let mut image = MemoryImage::new(0x400);
    let update = vec![0x5a; 64];

    c.bench_function("apply_unchanged_update", |b| {
        b.iter(|| black_box(image.apply(0x100, &update).map(|changes| changes.len())))
    });
}

criterion_group!(
    benches,
    encode_benchmark,
    decode_benchmark,
    stream_benchmark,
    memory_benchmark
);
criterion_main!(benches);
