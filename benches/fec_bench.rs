//! FEC codec and checksum benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use veiltun::fec::{BlockDecoder, BlockEncoder, FecParams, Shard};
use veiltun::rawsock::checksum;

fn bench_encode(c: &mut Criterion) {
    let params = FecParams::new(8, 2, 1200).unwrap();
    let payload = vec![0xA5u8; 8 * 1200];

    c.bench_function("fec_encode_8+2_9600B", |b| {
        let mut enc = BlockEncoder::new(params).unwrap();
        b.iter(|| {
            enc.push(black_box(&payload)).unwrap();
            black_box(enc.flush().unwrap());
        })
    });
}

fn bench_decode_with_loss(c: &mut Criterion) {
    let params = FecParams::new(8, 2, 1200).unwrap();
    let payload = vec![0x5Au8; 8 * 1200];

    let mut enc = BlockEncoder::new(params).unwrap();
    enc.push(&payload).unwrap();
    let shards: Vec<Shard> = enc.flush().unwrap();

    c.bench_function("fec_decode_8+2_two_lost", |b| {
        b.iter_batched(
            || {
                (
                    BlockDecoder::new(params).unwrap(),
                    shards
                        .iter()
                        .filter(|s| s.index != 0 && s.index != 5)
                        .cloned()
                        .collect::<Vec<_>>(),
                )
            },
            |(mut dec, shards)| {
                for shard in shards {
                    if let Some(block) = dec.push(shard).unwrap() {
                        black_box(block);
                    }
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_checksum(c: &mut Criterion) {
    let frame = vec![0x42u8; 1400];
    c.bench_function("internet_checksum_1400B", |b| {
        b.iter(|| black_box(checksum(black_box(&frame))))
    });
}

criterion_group!(benches, bench_encode, bench_decode_with_loss, bench_checksum);
criterion_main!(benches);
