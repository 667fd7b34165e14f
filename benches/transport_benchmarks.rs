//! Performance benchmarks for the mirroring receive path

use airplay_mirror::StreamKind;
use airplay_mirror::pipeline::h264::{AvcConfig, split_length_prefixed};
use airplay_mirror::protocol::rtp::{PayloadType, RtpHeader};
use airplay_mirror::session::{KeyVault, derive_stream_key};
use airplay_mirror::testing::h264::{PPS, SpsBuilder, avcc_record, idr_unit};
use airplay_mirror::transport::{ReorderBuffer, TransportChannel, seal};
use airplay_mirror::types::TransportConfig;
use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use zeroize::Zeroizing;

const SECRET: [u8; 32] = [0x42; 32];
const CONNECTION_ID: u64 = 77;
const BATCH: u16 = 256;

fn sealed_packets(count: u16, size: usize) -> Vec<Vec<u8>> {
    let key = derive_stream_key(&SECRET, StreamKind::Video, CONNECTION_ID).unwrap();
    let body = vec![0xA5; size];
    (0..count)
        .map(|seq| {
            let header = RtpHeader::new(PayloadType::Video, seq, u32::from(seq) * 3000, 1).encode();
            let mut packet = header.to_vec();
            packet.extend(seal(&key, u64::from(seq), &header, &body).unwrap());
            packet
        })
        .collect()
}

fn channel() -> TransportChannel {
    let vault = KeyVault::new();
    vault.install(Zeroizing::new(SECRET)).unwrap();
    TransportChannel::new(1, StreamKind::Video, CONNECTION_ID, &vault, &TransportConfig::default())
        .unwrap()
}

fn seal_packet(c: &mut Criterion) {
    let key = derive_stream_key(&SECRET, StreamKind::Video, CONNECTION_ID).unwrap();
    let header = RtpHeader::new(PayloadType::Video, 1, 0, 1).encode();
    let body = vec![0u8; 1400];
    let mut seq = 0u64;

    c.bench_function("seal_1400", |b| {
        b.iter(|| {
            seq += 1;
            black_box(seal(&key, seq, &header, black_box(&body)).unwrap())
        });
    });
}

fn channel_in_order(c: &mut Criterion) {
    let packets = sealed_packets(BATCH, 1400);

    c.bench_function("channel_in_order_256", |b| {
        b.iter_batched(
            channel,
            |mut channel| {
                for packet in &packets {
                    black_box(channel.on_packet(1, packet).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn channel_reordered(c: &mut Criterion) {
    let mut packets = sealed_packets(BATCH, 1400);
    // swap neighbouring pairs after the first packet
    for pair in packets[1..].chunks_mut(2) {
        pair.reverse();
    }

    c.bench_function("channel_pairwise_swapped_256", |b| {
        b.iter_batched(
            channel,
            |mut channel| {
                for packet in &packets {
                    black_box(channel.on_packet(1, packet).unwrap());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn reorder_insert(c: &mut Criterion) {
    c.bench_function("reorder_insert", |b| {
        let mut buffer = ReorderBuffer::new(32);
        let mut seq = 0u64;
        b.iter(|| {
            black_box(buffer.insert(seq, seq));
            seq += 1;
        });
    });
}

fn h264_parsing(c: &mut Criterion) {
    let sps = SpsBuilder::new(1920, 1080).build();
    let record = avcc_record(&sps, &PPS);
    let unit = idr_unit(64 * 1024);

    c.bench_function("avcc_parse", |b| {
        b.iter(|| {
            let config = AvcConfig::parse(black_box(&record)).unwrap();
            black_box(config.sps_info().unwrap())
        });
    });

    c.bench_function("split_length_prefixed_64k", |b| {
        b.iter(|| black_box(split_length_prefixed(black_box(&unit), 4).unwrap().len()));
    });
}

criterion_group!(
    benches,
    seal_packet,
    channel_in_order,
    channel_reordered,
    reorder_insert,
    h264_parsing
);
criterion_main!(benches);
