//! Wire codec throughput: encode/decode sit on the hot path of every chunk
//! the server receives, so they should stay well under a microsecond even
//! for full-size chunks.

use bytes::Bytes;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use dync_core::ClientToServer;
use dync_transport::codec::{decode_frames, encode_frames};
use serde_json::json;

fn bench_post_chunk_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("post_chunk");

    for size in [4 * 1024usize, 64 * 1024, 120 * 1024] {
        let msg = ClientToServer::PostChunk {
            is_last: false,
            seek: 0,
            data: Bytes::from(vec![0xAAu8; size]),
            checksum: None,
        };
        let envelope = encode_frames(&msg.encode());
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{size}"), |b| {
            b.iter(|| black_box(encode_frames(&msg.encode())))
        });

        group.bench_function(format!("decode_{size}"), |b| {
            b.iter(|| {
                let frames = decode_frames(black_box(envelope.clone())).unwrap();
                black_box(ClientToServer::decode(&frames).unwrap())
            })
        });
    }

    group.finish();
}

fn bench_post_file_decode(c: &mut Criterion) {
    let msg = ClientToServer::PostFile {
        flags: 0,
        name: "sample_QJFDC010EU.raw".to_string(),
        meta: json!({"passthrough": "lab_a"}),
    };
    let frames = msg.encode();

    c.bench_function("post_file_decode", |b| {
        b.iter(|| black_box(ClientToServer::decode(black_box(&frames))))
    });
}

criterion_group!(benches, bench_post_chunk_round_trip, bench_post_file_decode);
criterion_main!(benches);
