//! Feature extraction (C2): turns a completed `Flow` into the fixed-order
//! numeric vector a classifier expects. Two schemas are supported, matching
//! the two model families in use (§3/§4.2).

use std::collections::HashMap;

use wide::f64x4;

use crate::flow::{Flow, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Schema {
    CicDdos,
    Suricata,
}

impl Schema {
    pub fn feature_names(&self) -> &'static [&'static str] {
        match self {
            Schema::CicDdos => &[
                "ack_flag_count",
                "urg_flag_count",
                "protocol",
                "fwd_packet_length_min",
                "fwd_packet_length_max",
                "fwd_packet_length_std",
                "init_win_bytes_forward",
                "bwd_packet_length_max",
            ],
            Schema::Suricata => &[
                "src_port",
                "dest_port",
                "bytes_toserver",
                "bytes_toclient",
                "pkts_toserver",
                "pkts_toclient",
                "total_bytes",
                "total_pkts",
                "avg_bytes_per_pkt",
                "byte_ratio",
                "packet_ratio",
                "well_known_port",
                "proto_tcp",
                "proto_TCP",
                "proto_udp",
                "proto_UDP",
                "proto_icmp",
                "proto_ICMP",
                "proto_ipv6-icmp",
                "proto_IPV6-ICMP",
            ],
        }
    }
}

const WELL_KNOWN_PORTS: &[u16] = &[
    20, 21, 22, 23, 25, 53, 80, 110, 143, 443, 465, 587, 993, 995, 3306, 3389, 5432, 8080, 8443,
];

/// Default used by `Materialize` when a name is absent from the extracted
/// map: 0 for counters, 1.0 for ratios, 6 (TCP) for protocol (§4.2).
fn default_for(name: &str) -> f64 {
    match name {
        "protocol" => 6.0,
        "byte_ratio" | "packet_ratio" => 1.0,
        _ => 0.0,
    }
}

/// SIMD mean/std/min/max over a length sequence, adapted from the
/// object-pool-era SIMD calculator: processes 4 lanes at a time, then the
/// remainder scalar.
pub struct SimdStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

pub fn simd_calculate_stats(values: &[u32]) -> SimdStats {
    if values.is_empty() {
        return SimdStats { mean: 0.0, std_dev: 0.0, min: 0.0, max: 0.0 };
    }
    let floats: Vec<f64> = values.iter().map(|&v| v as f64).collect();
    let mean = simd_mean(&floats);
    let std_dev = simd_std_dev(&floats, mean);
    let (min, max) = simd_min_max(&floats);
    SimdStats { mean, std_dev, min, max }
}

fn simd_mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sum = f64x4::splat(0.0);
    let chunks = values.chunks_exact(4);
    let remainder = chunks.remainder();
    for chunk in chunks {
        sum += f64x4::new([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    let mut total: f64 = sum.to_array().iter().sum();
    total += remainder.iter().sum::<f64>();
    total / values.len() as f64
}

fn simd_std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let mean_v = f64x4::splat(mean);
    let mut acc = f64x4::splat(0.0);
    let chunks = values.chunks_exact(4);
    let remainder = chunks.remainder();
    for chunk in chunks {
        let v = f64x4::new([chunk[0], chunk[1], chunk[2], chunk[3]]);
        let d = v - mean_v;
        acc += d * d;
    }
    let mut total: f64 = acc.to_array().iter().sum();
    for &r in remainder {
        let d = r - mean;
        total += d * d;
    }
    (total / values.len() as f64).sqrt()
}

fn simd_min_max(values: &[f64]) -> (f64, f64) {
    let mut min = values[0];
    let mut max = values[0];
    for &v in values {
        if v < min {
            min = v;
        }
        if v > max {
            max = v;
        }
    }
    (min, max)
}

/// `Extract(flow, schema) -> map<featureName, float64>` (§4.2).
pub fn extract(flow: &Flow, schema: Schema) -> HashMap<String, f64> {
    match schema {
        Schema::CicDdos => extract_cic_ddos(flow),
        Schema::Suricata => extract_suricata(flow),
    }
}

fn extract_cic_ddos(flow: &Flow) -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("ack_flag_count".to_string(), flow.tcp_flags.ack as f64);
    m.insert("urg_flag_count".to_string(), flow.tcp_flags.urg as f64);
    m.insert("protocol".to_string(), flow.key.protocol().numeric() as f64);

    let fwd_stats = simd_calculate_stats(&flow.forward_lengths);
    m.insert("fwd_packet_length_min".to_string(), fwd_stats.min);
    m.insert("fwd_packet_length_max".to_string(), fwd_stats.max);
    m.insert(
        "fwd_packet_length_std".to_string(),
        if flow.forward_lengths.len() > 1 { fwd_stats.std_dev } else { 0.0 },
    );

    m.insert(
        "init_win_bytes_forward".to_string(),
        flow.init_forward_window.unwrap_or(0) as f64,
    );

    let bwd_stats = simd_calculate_stats(&flow.backward_lengths);
    m.insert("bwd_packet_length_max".to_string(), bwd_stats.max);
    m
}

fn extract_suricata(flow: &Flow) -> HashMap<String, f64> {
    let mut m = HashMap::new();

    let (src_port, dst_port) = match (flow.forward_endpoint, flow.backward_endpoint) {
        (Some(f), Some(b)) => (f.port, b.port),
        (Some(f), None) => (f.port, 0),
        (None, Some(b)) => (0, b.port),
        (None, None) => (0, 0),
    };
    m.insert("src_port".to_string(), src_port as f64);
    m.insert("dest_port".to_string(), dst_port as f64);

    m.insert("bytes_toserver".to_string(), flow.forward_bytes as f64);
    m.insert("bytes_toclient".to_string(), flow.backward_bytes as f64);
    m.insert("pkts_toserver".to_string(), flow.forward_packets as f64);
    m.insert("pkts_toclient".to_string(), flow.backward_packets as f64);

    m.insert("total_bytes".to_string(), flow.total_bytes as f64);
    m.insert("total_pkts".to_string(), flow.total_packets as f64);

    let avg_bytes_per_pkt = flow.total_bytes as f64 / flow.total_packets.max(1) as f64;
    m.insert("avg_bytes_per_pkt".to_string(), avg_bytes_per_pkt);

    let byte_ratio = if flow.backward_bytes == 0 {
        flow.forward_bytes as f64
    } else {
        flow.forward_bytes as f64 / flow.backward_bytes.max(1) as f64
    };
    m.insert("byte_ratio".to_string(), byte_ratio);

    let packet_ratio = if flow.backward_packets == 0 {
        flow.forward_packets as f64
    } else {
        flow.forward_packets as f64 / flow.backward_packets.max(1) as f64
    };
    m.insert("packet_ratio".to_string(), packet_ratio);

    let well_known = WELL_KNOWN_PORTS.contains(&src_port) || WELL_KNOWN_PORTS.contains(&dst_port);
    m.insert("well_known_port".to_string(), if well_known { 1.0 } else { 0.0 });

    for name in [
        "proto_tcp", "proto_TCP", "proto_udp", "proto_UDP", "proto_icmp", "proto_ICMP",
        "proto_ipv6-icmp", "proto_IPV6-ICMP",
    ] {
        m.insert(name.to_string(), 0.0);
    }
    let (lower, upper) = match flow.key.protocol() {
        Protocol::Tcp => ("proto_tcp", "proto_TCP"),
        Protocol::Udp => ("proto_udp", "proto_UDP"),
        Protocol::Icmp => ("proto_icmp", "proto_ICMP"),
        Protocol::IcmpV6 => ("proto_ipv6-icmp", "proto_IPV6-ICMP"),
        Protocol::Other(_) => ("", ""),
    };
    if !lower.is_empty() {
        m.insert(lower.to_string(), 1.0);
        m.insert(upper.to_string(), 1.0);
    }
    m
}

/// `Materialize(featureMap, featureNameList) -> vector` (§4.2): fills
/// defaults for names absent from the map, in declared list order.
pub fn materialize(map: &HashMap<String, f64>, names: &[String]) -> Vec<f64> {
    names.iter().map(|n| *map.get(n).unwrap_or(&default_for(n))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, Endpoint, FlowKey, FlowTable, ObservedPacket};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::{Duration, SystemTime};

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
        Endpoint { addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port }
    }

    #[test]
    fn cic_ddos_vector_has_eight_features_in_declared_order() {
        let table = FlowTable::new(1000, Duration::from_secs(60), 10_000);
        let (key, dir) =
            FlowKey::for_tcp_udp(ep(10, 0, 0, 5, 40000), ep(203, 0, 113, 9, 80), Protocol::Tcp);
        let t0 = SystemTime::now();
        for i in 0..5u64 {
            table.observe(
                key.clone(),
                4,
                Some((dir, ep(10, 0, 0, 5, 40000))),
                ObservedPacket {
                    timestamp: t0 + Duration::from_millis(i * 5),
                    length: 60,
                    direction: dir,
                    tcp_flags: Some(0x02),
                    tcp_window: Some(8192),
                },
            );
        }
        let flows = table.expiry_sweep(t0 + Duration::from_secs(120));
        let flow = &flows[0];
        let names: Vec<String> = Schema::CicDdos.feature_names().iter().map(|s| s.to_string()).collect();
        let map = extract(flow, Schema::CicDdos);
        let vec = materialize(&map, &names);
        assert_eq!(vec.len(), 8);
        assert_eq!(vec[2], 6.0);
        assert_eq!(vec[6], 8192.0);
    }

    #[test]
    fn suricata_vector_sets_exactly_two_protocol_one_hots() {
        let table = FlowTable::new(1000, Duration::from_secs(60), 10_000);
        let (key, dir) =
            FlowKey::for_tcp_udp(ep(10, 0, 0, 5, 40000), ep(203, 0, 113, 9, 53), Protocol::Udp);
        let t0 = SystemTime::now();
        table.observe(
            key,
            4,
            Some((dir, ep(10, 0, 0, 5, 40000))),
            ObservedPacket { timestamp: t0, length: 64, direction: dir, tcp_flags: None, tcp_window: None },
        );
        let flows = table.expiry_sweep(t0 + Duration::from_secs(120));
        let flow = &flows[0];
        let names: Vec<String> = Schema::Suricata.feature_names().iter().map(|s| s.to_string()).collect();
        let map = extract(flow, Schema::Suricata);
        let vec = materialize(&map, &names);
        assert_eq!(vec.len(), 20);
        let one_hot_sum: f64 = vec[12..20].iter().sum();
        assert_eq!(one_hot_sum, 2.0);
        assert_eq!(vec[11], 1.0, "port 53 is well-known");
    }

    #[test]
    fn missing_fields_fall_back_to_schema_defaults() {
        let empty = HashMap::new();
        let names: Vec<String> = Schema::Suricata.feature_names().iter().map(|s| s.to_string()).collect();
        let vec = materialize(&empty, &names);
        assert_eq!(vec[9], 1.0, "byte_ratio defaults to 1.0");
        assert_eq!(vec[10], 1.0, "packet_ratio defaults to 1.0");
    }

    #[test]
    fn direction_of_unequal_packet_counts_skews_byte_ratio_correctly() {
        let table = FlowTable::new(1000, Duration::from_secs(60), 10_000);
        let (key, dir) =
            FlowKey::for_tcp_udp(ep(10, 0, 0, 5, 40000), ep(203, 0, 113, 9, 80), Protocol::Tcp);
        let t0 = SystemTime::now();
        table.observe(
            key.clone(),
            4,
            Some((dir, ep(10, 0, 0, 5, 40000))),
            ObservedPacket { timestamp: t0, length: 100, direction: dir, tcp_flags: None, tcp_window: None },
        );
        let flows = table.expiry_sweep(t0 + Duration::from_secs(120));
        let map = extract(&flows[0], Schema::Suricata);
        assert_eq!(*map.get("byte_ratio").unwrap(), 100.0);
    }
}
