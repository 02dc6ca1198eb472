//! Frame and Slice encoding/decoding benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use icebridge_protocol::{
    Context, Decoder, Encapsulation, Encoder, Identity, Message, Request, SliceDecoder,
    SliceEncoder,
};

fn create_test_request(payload_size: usize, context_entries: usize) -> Request {
    let params = Encapsulation::build(|encoder| {
        encoder.encode_string(&"x".repeat(payload_size));
        encoder.encode_i32(42);
        Ok(())
    })
    .unwrap();
    let context: Context = (0..context_entries)
        .map(|i| (format!("key-{i}"), format!("value-{i}")))
        .collect();
    let mut request = Request::new(Identity::new("bench"), "process", params).with_context(context);
    request.request_id = 1;
    request
}

fn bench_request_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_encode");

    for size in [100, 1000, 10000] {
        let message = Message::Request(create_test_request(size, 0));

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            b.iter(|| black_box(Encoder::encode_message(message).unwrap()));
        });
    }

    group.finish();
}

fn bench_request_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_decode");

    for size in [100, 1000, 10000] {
        let message = Message::Request(create_test_request(size, 0));
        let encoded = Encoder::encode_message(&message).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_message().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_context(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_context");

    for entries in [0, 16, 1024] {
        let message = Message::Request(create_test_request(16, entries));
        let encoded = Encoder::encode_message(&message).unwrap();

        group.throughput(Throughput::Elements(entries as u64));
        group.bench_with_input(BenchmarkId::from_parameter(entries), &encoded, |b, encoded| {
            b.iter(|| {
                let mut decoder = Decoder::new();
                decoder.extend(encoded);
                black_box(decoder.decode_message().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_sequence(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequence_i32");

    for len in [16usize, 1024, 65536] {
        let values: Vec<i32> = (0..len as i32).collect();
        let mut encoder = SliceEncoder::new();
        encoder.encode_sequence(&values, |e, v| e.encode_i32(*v));
        let encoded = encoder.freeze();

        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("encode", len), &values, |b, values| {
            b.iter(|| {
                let mut encoder = SliceEncoder::new();
                encoder.encode_sequence(values, |e, v| e.encode_i32(*v));
                black_box(encoder.freeze())
            });
        });
        group.bench_with_input(BenchmarkId::new("decode", len), &encoded, |b, encoded| {
            b.iter(|| {
                black_box(
                    SliceDecoder::new(encoded)
                        .decode_sequence(4, |d| d.decode_i32())
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_request_encode,
    bench_request_decode,
    bench_context,
    bench_sequence,
);

criterion_main!(benches);
