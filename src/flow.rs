//! Bounded-memory bidirectional flow table (§4.1). Packets are aggregated
//! into a canonical 5-tuple flow; flows are emitted for scoring on a
//! packet-count threshold, an idle timeout, or LRU pressure when the table
//! grows past `buffer_size`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;

/// Numeric protocol tag used both as the flow-key discriminant and as the
/// CIC-DDoS "Protocol" feature value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// IPv6-ICMP is mapped to the same numeric value as ICMPv4 (§3).
    IcmpV6,
    Other(u8),
}

impl Protocol {
    pub fn from_ipv4_next_header(n: u8) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            1 => Protocol::Icmp,
            other => Protocol::Other(other),
        }
    }

    pub fn from_ipv6_next_header(n: u8) -> Self {
        match n {
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            58 => Protocol::IcmpV6,
            other => Protocol::Other(other),
        }
    }

    /// Numeric mapping used by the CIC-DDoS feature schema (§3/§4.2).
    pub fn numeric(&self) -> i64 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp | Protocol::IcmpV6 => 1,
            Protocol::Other(n) => *n as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

/// Canonical flow key: the smaller endpoint (by address, then port) is the
/// forward side. ICMP flows are unidirectional and keyed by type/code;
/// any other protocol forms a degenerate, unidirectional src/dst flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FlowKey {
    Tuple5 {
        low: Endpoint,
        high: Endpoint,
        protocol: Protocol,
    },
    Icmp {
        src: IpAddr,
        dst: IpAddr,
        protocol: Protocol,
        icmp_type: u8,
        icmp_code: u8,
    },
    Degenerate {
        src: IpAddr,
        dst: IpAddr,
        protocol: Protocol,
    },
}

impl FlowKey {
    pub fn for_tcp_udp(src: Endpoint, dst: Endpoint, protocol: Protocol) -> (Self, Direction) {
        if (src.addr, src.port) <= (dst.addr, dst.port) {
            (
                FlowKey::Tuple5 { low: src, high: dst, protocol },
                Direction::Forward,
            )
        } else {
            (
                FlowKey::Tuple5 { low: dst, high: src, protocol },
                Direction::Backward,
            )
        }
    }

    pub fn for_icmp(src: IpAddr, dst: IpAddr, protocol: Protocol, icmp_type: u8, icmp_code: u8) -> Self {
        FlowKey::Icmp { src, dst, protocol, icmp_type, icmp_code }
    }

    pub fn degenerate(src: IpAddr, dst: IpAddr, protocol: Protocol) -> Self {
        FlowKey::Degenerate { src, dst, protocol }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            FlowKey::Tuple5 { protocol, .. } => *protocol,
            FlowKey::Icmp { protocol, .. } => *protocol,
            FlowKey::Degenerate { protocol, .. } => *protocol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Default)]
pub struct TcpFlagCounts {
    pub syn: u32,
    pub ack: u32,
    pub fin: u32,
    pub rst: u32,
    pub psh: u32,
    pub urg: u32,
}

impl TcpFlagCounts {
    pub fn merge(&mut self, flags: u8) {
        const FIN: u8 = 0x01;
        const SYN: u8 = 0x02;
        const RST: u8 = 0x04;
        const PSH: u8 = 0x08;
        const ACK: u8 = 0x10;
        const URG: u8 = 0x20;
        if flags & FIN != 0 {
            self.fin += 1;
        }
        if flags & SYN != 0 {
            self.syn += 1;
        }
        if flags & RST != 0 {
            self.rst += 1;
        }
        if flags & PSH != 0 {
            self.psh += 1;
        }
        if flags & ACK != 0 {
            self.ack += 1;
        }
        if flags & URG != 0 {
            self.urg += 1;
        }
    }
}

/// A single observed packet, already classified by direction, as handed to
/// `Flow::record`. Produced by the capture layer (§4.1).
#[derive(Debug, Clone)]
pub struct ObservedPacket {
    pub timestamp: SystemTime,
    pub length: u32,
    pub direction: Direction,
    pub tcp_flags: Option<u8>,
    pub tcp_window: Option<u16>,
}

/// Aggregated bidirectional flow state (§3).
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: FlowKey,
    pub ip_version: u8,
    pub forward_endpoint: Option<Endpoint>,
    pub backward_endpoint: Option<Endpoint>,

    pub start_time: SystemTime,
    pub last_packet_time: SystemTime,

    pub total_packets: u64,
    pub total_bytes: u64,
    pub forward_packets: u64,
    pub forward_bytes: u64,
    pub backward_packets: u64,
    pub backward_bytes: u64,

    pub forward_lengths: Vec<u32>,
    pub backward_lengths: Vec<u32>,
    pub packet_times: Vec<SystemTime>,
    pub inter_arrival_times: Vec<f64>,
    pub all_packet_lengths: Vec<u32>,

    pub tcp_flags: TcpFlagCounts,
    pub init_forward_window: Option<u16>,
    pub init_backward_window: Option<u16>,

    pub analyzed: bool,
}

impl Flow {
    fn new(key: FlowKey, ip_version: u8, now: SystemTime, capacity_hint: usize) -> Self {
        Self {
            key,
            ip_version,
            forward_endpoint: None,
            backward_endpoint: None,
            start_time: now,
            last_packet_time: now,
            total_packets: 0,
            total_bytes: 0,
            forward_packets: 0,
            forward_bytes: 0,
            backward_packets: 0,
            backward_bytes: 0,
            forward_lengths: Vec::with_capacity(capacity_hint),
            backward_lengths: Vec::with_capacity(capacity_hint),
            packet_times: Vec::with_capacity(capacity_hint),
            inter_arrival_times: Vec::with_capacity(capacity_hint.saturating_sub(1)),
            all_packet_lengths: Vec::with_capacity(capacity_hint),
            tcp_flags: TcpFlagCounts::default(),
            init_forward_window: None,
            init_backward_window: None,
            analyzed: false,
        }
    }

    fn record(&mut self, pkt: &ObservedPacket) {
        if let Ok(iat) = pkt.timestamp.duration_since(self.last_packet_time) {
            if self.total_packets > 0 {
                self.inter_arrival_times.push(iat.as_secs_f64());
            }
        }

        match pkt.direction {
            Direction::Forward => {
                self.forward_packets += 1;
                self.forward_bytes += pkt.length as u64;
                self.forward_lengths.push(pkt.length);
                if self.init_forward_window.is_none() {
                    self.init_forward_window = pkt.tcp_window;
                }
            }
            Direction::Backward => {
                self.backward_packets += 1;
                self.backward_bytes += pkt.length as u64;
                self.backward_lengths.push(pkt.length);
                if self.init_backward_window.is_none() {
                    self.init_backward_window = pkt.tcp_window;
                }
            }
        }

        self.total_packets += 1;
        self.total_bytes += pkt.length as u64;
        self.all_packet_lengths.push(pkt.length);
        self.packet_times.push(pkt.timestamp);
        if let Some(flags) = pkt.tcp_flags {
            self.tcp_flags.merge(flags);
        }
        if pkt.timestamp > self.last_packet_time {
            self.last_packet_time = pkt.timestamp;
        }
    }

    pub fn duration(&self) -> Duration {
        self.last_packet_time
            .duration_since(self.start_time)
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone)]
pub struct FlowTableStats {
    pub total_flows_seen: u64,
    pub current_flows: usize,
    pub expired_flows: u64,
    pub size_triggered_flows: u64,
    pub pressure_evictions: u64,
    pub dropped_packets: u64,
}

struct Inner {
    flows: HashMap<FlowKey, Flow>,
    /// (last_packet_time, insertion sequence) -> key, kept in step with
    /// `flows` so the oldest entry can be found in O(log n) for LRU
    /// pressure eviction (§4.1).
    expiry_index: std::collections::BTreeMap<(SystemTime, u64), FlowKey>,
    index_of: HashMap<FlowKey, (SystemTime, u64)>,
    seq: u64,
    stats: FlowTableStats,
}

pub struct FlowTable {
    inner: RwLock<Inner>,
    max_packets_per_flow: u32,
    flow_idle_timeout: Duration,
    buffer_size: usize,
}

impl FlowTable {
    pub fn new(max_packets_per_flow: u32, flow_idle_timeout: Duration, buffer_size: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                flows: HashMap::new(),
                expiry_index: std::collections::BTreeMap::new(),
                index_of: HashMap::new(),
                seq: 0,
                stats: FlowTableStats::default(),
            }),
            max_packets_per_flow,
            flow_idle_timeout,
            buffer_size,
        }
    }

    /// Folds one packet into its flow, returning a completed flow if this
    /// packet triggered size-based emission (I2: at most once per flow
    /// lifetime, per the `analyzed` flag).
    pub fn observe(
        &self,
        key: FlowKey,
        ip_version: u8,
        endpoint: Option<(Direction, Endpoint)>,
        pkt: ObservedPacket,
    ) -> Option<Flow> {
        let mut inner = self.inner.write();
        let now = pkt.timestamp;

        if !inner.flows.contains_key(&key) {
            self.evict_if_over_capacity(&mut inner);
            let flow = Flow::new(key.clone(), ip_version, now, self.max_packets_per_flow as usize);
            inner.flows.insert(key.clone(), flow);
            inner.stats.total_flows_seen += 1;
        }

        if let Some((direction, ep)) = endpoint {
            let flow = inner.flows.get_mut(&key).expect("just inserted");
            match direction {
                Direction::Forward => flow.forward_endpoint.get_or_insert(ep),
                Direction::Backward => flow.backward_endpoint.get_or_insert(ep),
            };
        }

        let flow = inner.flows.get_mut(&key).expect("just inserted");
        flow.record(&pkt);
        let reached_size_trigger = !flow.analyzed && flow.total_packets >= self.max_packets_per_flow as u64;
        if reached_size_trigger {
            flow.analyzed = true;
        }

        self.reindex(&mut inner, &key, now);

        if reached_size_trigger {
            inner.stats.size_triggered_flows += 1;
            let flow = inner.flows.remove(&key).expect("present");
            if let Some(idx) = inner.index_of.remove(&key) {
                inner.expiry_index.remove(&idx);
            }
            return Some(flow);
        }

        None
    }

    fn reindex(&self, inner: &mut Inner, key: &FlowKey, now: SystemTime) {
        if let Some(old) = inner.index_of.remove(key) {
            inner.expiry_index.remove(&old);
        }
        inner.seq += 1;
        let idx = (now, inner.seq);
        inner.expiry_index.insert(idx, key.clone());
        inner.index_of.insert(key.clone(), idx);
    }

    fn evict_if_over_capacity(&self, inner: &mut Inner) {
        while inner.flows.len() > self.buffer_size.saturating_sub(1) && !inner.flows.is_empty() {
            let oldest = match inner.expiry_index.keys().next().cloned() {
                Some(k) => k,
                None => break,
            };
            if let Some(key) = inner.expiry_index.remove(&oldest) {
                inner.flows.remove(&key);
                inner.index_of.remove(&key);
                inner.stats.pressure_evictions += 1;
            }
        }
    }

    /// Returns flows whose idle time exceeds `flow_idle_timeout`, removing
    /// them from the live table. Idempotent: a flow that was already
    /// emitted via the size trigger is never returned again.
    pub fn expiry_sweep(&self, now: SystemTime) -> Vec<Flow> {
        let mut inner = self.inner.write();
        let mut expired_keys = Vec::new();
        for flow in inner.flows.values() {
            if now
                .duration_since(flow.last_packet_time)
                .unwrap_or_default()
                > self.flow_idle_timeout
            {
                expired_keys.push(flow.key.clone());
            }
        }

        let mut out = Vec::with_capacity(expired_keys.len());
        for key in expired_keys {
            if let Some(flow) = inner.flows.remove(&key) {
                if let Some(idx) = inner.index_of.remove(&key) {
                    inner.expiry_index.remove(&idx);
                }
                inner.stats.expired_flows += 1;
                out.push(flow);
            }
        }
        out
    }

    pub fn record_dropped_packet(&self) {
        self.inner.write().stats.dropped_packets += 1;
    }

    pub fn stats(&self) -> FlowTableStats {
        let inner = self.inner.read();
        let mut s = inner.stats.clone();
        s.current_flows = inner.flows.len();
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
        Endpoint { addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port }
    }

    fn pkt(t: SystemTime, len: u32, dir: Direction, flags: Option<u8>) -> ObservedPacket {
        ObservedPacket { timestamp: t, length: len, direction: dir, tcp_flags: flags, tcp_window: Some(65535) }
    }

    #[test]
    fn packet_and_byte_counters_sum_to_totals() {
        let table = FlowTable::new(1000, Duration::from_secs(60), 10_000);
        let (key, dir) = FlowKey::for_tcp_udp(ep(10, 0, 0, 5, 40000), ep(203, 0, 113, 9, 80), Protocol::Tcp);
        let t0 = SystemTime::now();
        for i in 0..10u64 {
            table.observe(
                key.clone(),
                4,
                Some((dir, ep(10, 0, 0, 5, 40000))),
                pkt(t0 + Duration::from_millis(i * 10), 64, dir, Some(0x02)),
            );
        }
        let flows = table.expiry_sweep(t0 + Duration::from_secs(120));
        assert_eq!(flows.len(), 1);
        let f = &flows[0];
        assert_eq!(f.forward_packets + f.backward_packets, f.total_packets);
        assert_eq!(f.forward_bytes + f.backward_bytes, f.total_bytes);
        assert_eq!(f.packet_times.len() as u64, f.total_packets);
        assert_eq!(f.inter_arrival_times.len() as u64, f.total_packets - 1);
    }

    #[test]
    fn size_trigger_emits_exactly_once() {
        let table = FlowTable::new(20, Duration::from_secs(60), 10_000);
        let (key, dir) = FlowKey::for_tcp_udp(ep(10, 0, 0, 5, 40000), ep(203, 0, 113, 9, 80), Protocol::Tcp);
        let t0 = SystemTime::now();
        let mut emitted = 0;
        for i in 0..30u64 {
            if table
                .observe(
                    key.clone(),
                    4,
                    Some((dir, ep(10, 0, 0, 5, 40000))),
                    pkt(t0 + Duration::from_millis(i), 60, dir, Some(0x02)),
                )
                .is_some()
            {
                emitted += 1;
            }
        }
        assert_eq!(emitted, 1);
    }

    #[test]
    fn lru_pressure_evicts_oldest_without_scoring() {
        let table = FlowTable::new(1000, Duration::from_secs(60), 2);
        let t0 = SystemTime::now();
        for i in 0..5u8 {
            let (key, dir) =
                FlowKey::for_tcp_udp(ep(10, 0, 0, i, 40000), ep(203, 0, 113, 9, 80), Protocol::Tcp);
            table.observe(
                key,
                4,
                Some((dir, ep(10, 0, 0, i, 40000))),
                pkt(t0 + Duration::from_secs(i as u64), 60, dir, Some(0x02)),
            );
        }
        assert!(table.stats().pressure_evictions >= 1);
        assert!(table.stats().current_flows <= 2);
    }

    #[test]
    fn icmp_flow_is_unidirectional_by_type_code() {
        let key = FlowKey::for_icmp(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            Protocol::Icmp,
            8,
            0,
        );
        assert_eq!(key.protocol().numeric(), 1);
    }
}
