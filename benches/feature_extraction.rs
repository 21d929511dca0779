use std::hint::black_box;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, SystemTime};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

use ddos_shield::features::{extract, materialize, Schema};
use ddos_shield::flow::{Direction, Endpoint, FlowKey, FlowTable, ObservedPacket, Protocol};

fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
    Endpoint { addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port }
}

/// A flow with `packet_count` packets alternating direction, the shape
/// `simd_calculate_stats` and the ratio features are actually sensitive to.
fn build_flow(packet_count: u64) -> ddos_shield::flow::Flow {
    let table = FlowTable::new(1_000_000, Duration::from_secs(60), 10_000);
    let src = ep(10, 0, 0, 1, 40000);
    let dst = ep(203, 0, 113, 9, 80);
    let (key, _) = FlowKey::for_tcp_udp(src, dst, Protocol::Tcp);
    let t0 = SystemTime::now();
    for i in 0..packet_count {
        let (direction, endpoint) = if i % 3 == 0 {
            (Direction::Backward, dst)
        } else {
            (Direction::Forward, src)
        };
        table.observe(
            key.clone(),
            4,
            Some((direction, endpoint)),
            ObservedPacket {
                timestamp: t0 + Duration::from_micros(i),
                length: 64 + (i % 512) as u32,
                direction,
                tcp_flags: Some(if i == 0 { 0x02 } else { 0x10 }),
                tcp_window: Some(8192),
            },
        );
    }
    table.expiry_sweep(t0 + Duration::from_secs(120)).remove(0)
}

fn bench_extract(c: &mut Criterion) {
    let mut group = c.benchmark_group("feature_extraction");
    for &packet_count in &[10u64, 100, 1_000] {
        let flow = build_flow(packet_count);

        group.bench_with_input(
            BenchmarkId::new("cic_ddos", packet_count),
            &flow,
            |b, flow| b.iter(|| black_box(extract(flow, Schema::CicDdos))),
        );

        group.bench_with_input(
            BenchmarkId::new("suricata", packet_count),
            &flow,
            |b, flow| b.iter(|| black_box(extract(flow, Schema::Suricata))),
        );
    }
    group.finish();
}

fn bench_materialize(c: &mut Criterion) {
    let flow = build_flow(200);
    let features = extract(&flow, Schema::CicDdos);
    let names: Vec<String> = Schema::CicDdos.feature_names().iter().map(|s| s.to_string()).collect();

    c.bench_function("materialize_cic_ddos", |b| {
        b.iter(|| black_box(materialize(&features, &names)))
    });
}

criterion_group!(benches, bench_extract, bench_materialize);
criterion_main!(benches);
