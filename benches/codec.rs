//! Hot-path microbenchmarks: immediate-header codec and the shared event
//! ring's produce/consume/return cycle.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use unifabric::ring::{EventRing, RingConsumer};
use unifabric::wire::Header;

fn bench_header_codec(c: &mut Criterion) {
    c.bench_function("header_encode_decode", |b| {
        b.iter(|| {
            let header = Header::conn_payload(black_box(5), black_box(1024)).unwrap();
            let decoded = Header::from_wire(black_box(header.to_wire()));
            black_box(decoded.conn_payload_fields())
        })
    });
}

fn bench_ring_cycle(c: &mut Criterion) {
    let os_id = format!("uf_bench_ring_{}", std::process::id());
    let ring = EventRing::allocate(&os_id, 64, 256, b"ok").unwrap();
    let mut consumer = RingConsumer::new();
    let mut held = 0u32;
    let payload = [0x5Au8; 64];

    c.bench_function("ring_produce_consume_return", |b| {
        b.iter(|| {
            ring.produce(black_box(&payload)).unwrap();
            let offset = consumer.poll(&ring).unwrap();
            // Release the slot the cursor just moved off.
            ring.release(held).unwrap();
            held = offset;
            black_box(offset)
        })
    });
}

criterion_group!(benches, bench_header_codec, bench_ring_cycle);
criterion_main!(benches);
