//! Whitelist / Legitimacy Oracle (C7): a read-mostly allowlist built at
//! startup, plus the pure predicate the Detector Loop and Blocklist both
//! consult to suppress false positives for well-known services (§4.7).

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::flow::{Flow, Protocol};

/// A whitelist that can be atomically swapped on config reload (§5,
/// "Whitelist: ... may be atomically swapped on config reload"). Every
/// long-lived component that consults the whitelist holds one of these
/// rather than a bare `Arc<Whitelist>`, so a reload is visible everywhere
/// without re-threading constructor arguments.
pub type SharedWhitelist = Arc<RwLock<Arc<Whitelist>>>;

pub fn shared(whitelist: Whitelist) -> SharedWhitelist {
    Arc::new(RwLock::new(Arc::new(whitelist)))
}

/// Hard-coded /16-style prefixes for major CDN/streaming providers (§3,
/// "Whitelist"). String-prefix match on the dotted-decimal form is
/// acceptable because these are stable, publicly announced ranges.
const CDN_STREAMING_PREFIXES: &[&str] = &[
    "8.8.",       // Google public DNS
    "74.125.",    // Google / YouTube
    "172.217.",   // Google
    "142.250.",   // Google
    "31.13.",     // Facebook / Instagram
    "157.240.",   // Facebook / Instagram
    "23.246.",    // Netflix
    "45.57.",     // Netflix
    "13.32.",     // Amazon CloudFront
    "13.35.",     // Amazon CloudFront
    "104.16.",    // Cloudflare
];

/// Fixed "common web/streaming" destination ports (§4.7).
const COMMON_WEB_STREAMING_PORTS: &[u16] = &[80, 443, 8080, 1935, 33000, 33001];

#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    ips: HashSet<IpAddr>,
    ports: HashSet<u16>,
    /// IPv4 CIDR prefixes as (network, prefix_len).
    cidrs: Vec<(Ipv4Addr, u8)>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a comma-separated list of IPs and IPv4 CIDRs, as supplied by
    /// `Prevention.whitelist` (§6).
    pub fn from_entries(entries: &[String]) -> Self {
        let mut wl = Self::new();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if let Some((net, len)) = entry.split_once('/') {
                if let (Ok(addr), Ok(prefix_len)) = (net.parse::<Ipv4Addr>(), len.parse::<u8>()) {
                    wl.cidrs.push((addr, prefix_len));
                    continue;
                }
            }
            if let Ok(addr) = entry.parse::<IpAddr>() {
                wl.ips.insert(addr);
            }
        }
        wl
    }

    pub fn add_port(&mut self, port: u16) {
        self.ports.insert(port);
    }

    pub fn contains_ip(&self, addr: &IpAddr) -> bool {
        if self.ips.contains(addr) {
            return true;
        }
        if let IpAddr::V4(v4) = addr {
            return self.cidrs.iter().any(|(net, len)| ipv4_in_cidr(*v4, *net, *len));
        }
        false
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

fn ipv4_in_cidr(addr: Ipv4Addr, net: Ipv4Addr, prefix_len: u8) -> bool {
    if prefix_len == 0 {
        return true;
    }
    let mask = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
    (u32::from(addr) & mask) == (u32::from(net) & mask)
}

fn is_rfc1918_or_loopback(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || ipv4_in_cidr(*v4, Ipv4Addr::new(10, 0, 0, 0), 8)
                || ipv4_in_cidr(*v4, Ipv4Addr::new(172, 16, 0, 0), 12)
                || ipv4_in_cidr(*v4, Ipv4Addr::new(192, 168, 0, 0), 16)
        }
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn is_cdn_streaming_prefix(addr: &IpAddr) -> bool {
    let IpAddr::V4(v4) = addr else { return false };
    let s = v4.to_string();
    CDN_STREAMING_PREFIXES.iter().any(|p| s.starts_with(p))
}

/// A flow shows an explicit attack signature that overrides port-based
/// whitelist allowance (§4.7): a SYN-flood-shaped flag ratio, or a
/// flow-level UDP-flood/ACK-flood indicator.
fn has_attack_signature(flow: &Flow) -> bool {
    if flow.total_packets == 0 {
        return false;
    }
    let total = flow.total_packets as f64;
    let syn_rate = flow.tcp_flags.syn as f64 / total;
    let ack_rate = flow.tcp_flags.ack as f64 / total;
    if syn_rate > 0.8 && ack_rate < 0.2 {
        return true;
    }
    // ACK-flood indicator: overwhelming majority ACK with no SYN at all.
    if flow.tcp_flags.syn == 0 && ack_rate > 0.9 && flow.total_packets > 10 {
        return true;
    }
    // UDP-flood indicator: a high-rate, uniformly small-packet UDP flow.
    if flow.key.protocol() == Protocol::Udp && flow.total_packets > 50 {
        let mean_len: f64 =
            flow.all_packet_lengths.iter().map(|&l| l as f64).sum::<f64>() / total;
        if mean_len < 128.0 {
            return true;
        }
    }
    false
}

/// `IsLegitimate(src, dst, src_port, dst_port, protocol, flow) -> (bool, reason)` (§4.7).
pub fn is_legitimate(
    whitelist: &Whitelist,
    src: IpAddr,
    dst: IpAddr,
    src_port: u16,
    dst_port: u16,
    flow: &Flow,
) -> (bool, String) {
    if whitelist.contains_ip(&src) || whitelist.contains_ip(&dst) {
        return (true, "whitelisted IP".to_string());
    }

    if whitelist.contains_port(src_port) || whitelist.contains_port(dst_port) {
        if !has_attack_signature(flow) {
            return (true, "whitelisted port".to_string());
        }
    }

    if is_cdn_streaming_prefix(&dst) {
        return (true, "BigCDN/Streaming".to_string());
    }

    if is_rfc1918_or_loopback(&src) || is_rfc1918_or_loopback(&dst) {
        return (true, "private or loopback range".to_string());
    }

    if COMMON_WEB_STREAMING_PORTS.contains(&dst_port) {
        return (true, "common web/streaming port".to_string());
    }

    (false, String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, Endpoint, FlowKey, FlowTable, ObservedPacket};
    use std::net::Ipv4Addr;
    use std::time::{Duration, SystemTime};

    fn ep(a: u8, b: u8, c: u8, d: u8, port: u16) -> Endpoint {
        Endpoint { addr: IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port }
    }

    fn udp_flow(src: Endpoint, dst: Endpoint, count: u64, len: u32) -> Flow {
        let table = FlowTable::new(1000, Duration::from_secs(60), 10_000);
        let (key, dir) = FlowKey::for_tcp_udp(src, dst, Protocol::Udp);
        let t0 = SystemTime::now();
        for i in 0..count {
            table.observe(
                key.clone(),
                4,
                Some((dir, src)),
                ObservedPacket {
                    timestamp: t0 + Duration::from_millis(i),
                    length: len,
                    direction: dir,
                    tcp_flags: None,
                    tcp_window: None,
                },
            );
        }
        table.expiry_sweep(t0 + Duration::from_secs(120)).remove(0)
    }

    #[test]
    fn cdn_prefix_overrides_even_when_not_explicitly_whitelisted() {
        let wl = Whitelist::new();
        let flow = udp_flow(ep(74, 125, 1, 1, 443), ep(192, 168, 1, 10, 55555), 25, 1200);
        let (legit, reason) = is_legitimate(
            &wl,
            IpAddr::V4(Ipv4Addr::new(74, 125, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            443,
            55555,
            &flow,
        );
        assert!(legit);
        assert_eq!(reason, "BigCDN/Streaming");
    }

    #[test]
    fn private_range_is_legitimate() {
        let wl = Whitelist::new();
        let flow = udp_flow(ep(10, 0, 0, 1, 1000), ep(10, 0, 0, 2, 2000), 3, 100);
        let (legit, _) = is_legitimate(
            &wl,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            1000,
            2000,
            &flow,
        );
        assert!(legit);
    }

    #[test]
    fn whitelisted_port_allowance_is_overridden_by_attack_signature() {
        let mut wl = Whitelist::new();
        wl.add_port(53);
        let table = FlowTable::new(1000, Duration::from_secs(60), 10_000);
        let (key, dir) =
            FlowKey::for_tcp_udp(ep(198, 51, 100, 9, 40000), ep(203, 0, 113, 5, 53), Protocol::Tcp);
        let t0 = SystemTime::now();
        for i in 0..30u64 {
            table.observe(
                key.clone(),
                4,
                Some((dir, ep(198, 51, 100, 9, 40000))),
                ObservedPacket {
                    timestamp: t0 + Duration::from_millis(i),
                    length: 60,
                    direction: dir,
                    tcp_flags: Some(0x02),
                    tcp_window: Some(8192),
                },
            );
        }
        let flow = table.expiry_sweep(t0 + Duration::from_secs(120)).remove(0);
        let (legit, _) = is_legitimate(
            &wl,
            IpAddr::V4(Ipv4Addr::new(198, 51, 100, 9)),
            IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)),
            40000,
            53,
            &flow,
        );
        assert!(!legit, "SYN-flood signature must override the port-based allowance");
    }

    #[test]
    fn cidr_matching_respects_prefix_length() {
        let wl = Whitelist::from_entries(&["203.0.113.0/24".to_string()]);
        assert!(wl.contains_ip(&IpAddr::V4(Ipv4Addr::new(203, 0, 113, 42))));
        assert!(!wl.contains_ip(&IpAddr::V4(Ipv4Addr::new(203, 0, 114, 42))));
    }
}
