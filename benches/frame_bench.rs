use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use muxlink::{Destination, Frame};
use std::net::{IpAddr, Ipv4Addr};

fn bench_encode_data(c: &mut Criterion) {
    let frame = Frame::data(7, 4096);
    c.bench_function("encode_data_header", |b| {
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            black_box(&frame).encode_to(&mut buf);
            black_box(&buf);
        })
    });
}

fn bench_encode_open(c: &mut Criterion) {
    let dest = Destination::tcp(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)), 443);
    let frame = Frame::open(7, dest);
    c.bench_function("encode_open", |b| {
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            black_box(&frame).encode_to(&mut buf);
            black_box(&buf);
        })
    });
}

fn bench_decode(c: &mut Criterion) {
    let dest = Destination::tcp(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)), 443);
    let mut encoded = BytesMut::new();
    Frame::open(7, dest).encode_to(&mut encoded);
    Frame::window(7, 65536).encode_to(&mut encoded);
    Frame::data(7, 4096).encode_to(&mut encoded);
    Frame::close(7).encode_to(&mut encoded);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("four_frames", |b| {
        b.iter(|| {
            let mut cursor = &encoded[..];
            for _ in 0..4 {
                black_box(Frame::read_from(&mut cursor).unwrap());
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode_data, bench_encode_open, bench_decode);
criterion_main!(benches);
