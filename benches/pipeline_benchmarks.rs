//! Criterion benchmarks for the per-packet hot path: queue operations and
//! Annex-B splitting.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use gridstream::bitstream::{parse_annex_b, parse_sps};
use gridstream::{BoundedQueue, Codec, Packet};

fn synthetic_access_unit() -> Vec<u8> {
    // SPS + PPS + IDR + two slices, roughly the shape of a camera keyframe
    // packet.
    let mut data = Vec::new();
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1F, 0x8C, 0x8D, 0x40]);
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x3C, 0x80]);
    data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x65]);
    data.extend(std::iter::repeat(0xA5).take(4096));
    data.extend_from_slice(&[0x00, 0x00, 0x01, 0x41]);
    data.extend(std::iter::repeat(0x5A).take(2048));
    data.extend_from_slice(&[0x00, 0x00, 0x01, 0x41]);
    data.extend(std::iter::repeat(0x3C).take(2048));
    data
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    group.bench_function("push_pop", |b| {
        let queue = BoundedQueue::with_capacity(64);
        b.iter(|| {
            queue
                .push(Packet {
                    data: Vec::new(),
                    pts: 0,
                    keyframe: false,
                })
                .ok();
            black_box(queue.pop());
        });
    });

    group.bench_function("push_or_drop_oldest_full", |b| {
        let queue = BoundedQueue::with_capacity(64);
        for i in 0..64 {
            queue.push(i).ok();
        }
        b.iter(|| {
            queue.push_or_drop_oldest(black_box(99));
        });
    });

    group.finish();
}

fn bench_bitstream(c: &mut Criterion) {
    let data = synthetic_access_unit();
    let mut group = c.benchmark_group("bitstream");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("parse_annex_b", |b| {
        b.iter(|| black_box(parse_annex_b(black_box(&data), 0, Codec::H264)));
    });

    group.bench_function("parse_sps", |b| {
        let sps = [0x67, 0x42, 0x00, 0x1F, 0x8C, 0x8D, 0x40];
        b.iter(|| black_box(parse_sps(black_box(&sps))));
    });

    group.finish();
}

criterion_group!(benches, bench_queue, bench_bitstream);
criterion_main!(benches);
