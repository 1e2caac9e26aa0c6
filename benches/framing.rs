use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;

use seeqd_net::network::framing::{encode_frame, Framer, DEFAULT_MAX_MESSAGE_SIZE};

fn payload(len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..len).map(|_| rng.gen()).collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");
    for len in [64usize, 1024, 16 * 1024] {
        let data = payload(len);
        group.throughput(Throughput::Bytes(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &data, |b, data| {
            b.iter(|| encode_frame(black_box(data), DEFAULT_MAX_MESSAGE_SIZE))
        });
    }
    group.finish();
}

/// A stream of small frames delivered in uneven chunks, as a socket would.
fn bench_decode_stream(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(11);
    let mut stream = Vec::new();
    for _ in 0..256 {
        let len = rng.gen_range(8..256);
        stream.extend(encode_frame(&payload(len), DEFAULT_MAX_MESSAGE_SIZE).unwrap());
    }
    let mut chunks = Vec::new();
    let mut at = 0;
    while at < stream.len() {
        let end = (at + rng.gen_range(1..4096)).min(stream.len());
        chunks.push(stream[at..end].to_vec());
        at = end;
    }

    let mut group = c.benchmark_group("framer");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("decode_256_frames", |b| {
        b.iter(|| {
            let mut framer = Framer::default();
            let mut count = 0;
            for chunk in &chunks {
                framer.push(chunk);
                while let Some(msg) = framer.next_message().unwrap() {
                    black_box(msg);
                    count += 1;
                }
            }
            assert_eq!(count, 256);
        })
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode_stream);
criterion_main!(benches);
