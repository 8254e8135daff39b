use std::collections::VecDeque;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use flowtap::flow::FlowManager;
use flowtap::protocol::{decode_event, encode_frame, Event, FrameBuffer};

fn flow_payload(name: &str, flow_id: u64, ts: u64) -> Vec<u8> {
    json!({
        "flow_event_id": 7,
        "flow_event_name": name,
        "thread_id": flow_id % 4,
        "thread_ts_usec": ts,
        "alias": "bench-sensor",
        "source": "eth0",
        "flow_id": flow_id,
        "flow_state": "info",
        "flow_src_packets_processed": 12,
        "flow_dst_packets_processed": 9,
        "flow_first_seen": ts - 1_000,
        "flow_src_last_pkt_time": ts,
        "flow_dst_last_pkt_time": ts - 10,
        "flow_idle_time": 600_000_000u64,
        "l3_proto": "ip4",
        "src_ip": "10.0.0.1",
        "dst_ip": "10.0.0.2",
        "src_port": 443,
        "dst_port": 51234,
        "l4_proto": "tcp",
    })
    .to_string()
    .into_bytes()
}

fn build_wire(count: u64) -> Vec<u8> {
    let mut wire = Vec::new();
    for i in 0..count {
        wire.extend(encode_frame(&flow_payload("update", i, 1_000_000 + i)));
    }
    wire
}

fn bench_extract(c: &mut Criterion) {
    let wire = build_wire(64);

    c.bench_function("frame/extract_64", |b| {
        b.iter(|| {
            let mut buffer = FrameBuffer::new();
            let mut frames = VecDeque::new();
            for chunk in wire.chunks(4096) {
                buffer.extend(chunk);
                buffer.extract(&mut frames).expect("extract");
            }
            black_box(frames.len())
        })
    });
}

fn bench_decode(c: &mut Criterion) {
    let payload = flow_payload("detected", 42, 1_000_000);

    c.bench_function("decode/flow_event", |b| {
        b.iter(|| decode_event(black_box(&payload)).expect("decode"))
    });
}

fn bench_process(c: &mut Criterion) {
    let events: Vec<Event> = (0..256u64)
        .map(|i| {
            let name = if i % 8 == 7 { "end" } else { "update" };
            decode_event(&flow_payload(name, i % 64, 1_000_000 + i)).expect("decode")
        })
        .collect();

    c.bench_function("flow/process_256", |b| {
        b.iter(|| {
            let mut flows = FlowManager::new();
            let mut evicted = 0usize;
            for event in &events {
                evicted += flows.process(black_box(event)).expect("process").len();
            }
            black_box((evicted, flows.flow_count()))
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_extract(c);
    bench_decode(c);
    bench_process(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
