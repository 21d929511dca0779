//! Capture worker (§5): owns the NIC, reconstructs flows via the
//! `FlowTable`, and forwards emitted flows into the Capture->Detector
//! queue. Dispatches Ethernet frames over both IPv4 and IPv6, parsing
//! TCP/UDP/ICMP/ICMPv6 payloads into `ObservedPacket`s.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use log::{error, info, warn};
use pnet::datalink::{self, Channel::Ethernet, NetworkInterface};
use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::icmpv6::Icmpv6Packet;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;

use crate::detector::FlowQueue;
use crate::flow::{Direction, Endpoint, Flow, FlowKey, FlowTable, ObservedPacket, Protocol};

/// BPF-style filter string accepted at the interface (§6). Actual
/// per-protocol dispatch below implements the "MUST handle at least"
/// clause; `capture_filter` narrows what the datalink layer hands us.
pub const DEFAULT_FILTER: &str = "ip";

pub struct CaptureWorker {
    flow_table: Arc<FlowTable>,
    queue: Arc<FlowQueue>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureWorker {
    pub fn new(flow_table: Arc<FlowTable>, queue: Arc<FlowQueue>, shutdown: Arc<AtomicBool>) -> Self {
        Self { flow_table, queue, shutdown }
    }

    pub fn find_interface(name: &str) -> Option<NetworkInterface> {
        datalink::interfaces().into_iter().find(|iface| iface.name == name)
    }

    /// Opens the interface in promiscuous mode and loops until shutdown.
    /// Capture errors are logged and the loop continues (§4.1, "Failure
    /// modes").
    pub fn run(&self, interface: &NetworkInterface) {
        let (_, mut rx) = match datalink::channel(interface, Default::default()) {
            Ok(Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => {
                error!("unsupported channel type for interface {}", interface.name);
                return;
            }
            Err(e) => {
                error!("failed to open interface {}: {e}", interface.name);
                return;
            }
        };

        info!("capture started on {}", interface.name);
        while !self.shutdown.load(Ordering::SeqCst) {
            match rx.next() {
                Ok(packet) => {
                    if let Some(eth) = EthernetPacket::new(packet) {
                        self.dispatch_ethernet(&eth);
                    }
                }
                Err(e) => {
                    warn!("capture read error: {e}");
                }
            }
        }
        info!("capture stopped on {}", interface.name);
    }

    fn dispatch_ethernet(&self, eth: &EthernetPacket) {
        let now = SystemTime::now();
        match eth.get_ethertype() {
            EtherTypes::Ipv4 => {
                if let Some(ipv4) = Ipv4Packet::new(eth.payload()) {
                    self.handle_ipv4(&ipv4, now);
                }
            }
            EtherTypes::Ipv6 => {
                if let Some(ipv6) = Ipv6Packet::new(eth.payload()) {
                    self.handle_ipv6(&ipv6, now);
                }
            }
            _ => {}
        }
    }

    fn handle_ipv4(&self, ipv4: &Ipv4Packet, now: SystemTime) {
        let src = IpAddr::V4(ipv4.get_source());
        let dst = IpAddr::V4(ipv4.get_destination());
        let protocol = Protocol::from_ipv4_next_header(ipv4.get_next_level_protocol().0);
        let payload = ipv4.payload();
        let len = ipv4.packet().len() as u32;

        match ipv4.get_next_level_protocol() {
            IpNextHeaderProtocols::Tcp => {
                if let Some(tcp) = TcpPacket::new(payload) {
                    self.observe_transport(src, dst, tcp.get_source(), tcp.get_destination(), protocol, len, now, Some(tcp.get_flags()), Some(tcp.get_window()), 4);
                }
            }
            IpNextHeaderProtocols::Udp => {
                if let Some(udp) = UdpPacket::new(payload) {
                    self.observe_transport(src, dst, udp.get_source(), udp.get_destination(), protocol, len, now, None, None, 4);
                }
            }
            IpNextHeaderProtocols::Icmp => {
                if let Some(icmp) = IcmpPacket::new(payload) {
                    let icmp_type = icmp.get_icmp_type().0;
                    let icmp_code = icmp.get_icmp_code().0;
                    self.observe_icmp(src, dst, protocol, icmp_type, icmp_code, len, now, 4);
                }
            }
            _ => self.observe_degenerate(src, dst, protocol, len, now, 4),
        }
    }

    fn handle_ipv6(&self, ipv6: &Ipv6Packet, now: SystemTime) {
        let src = IpAddr::V6(ipv6.get_source());
        let dst = IpAddr::V6(ipv6.get_destination());
        let protocol = Protocol::from_ipv6_next_header(ipv6.get_next_header().0);
        let payload = ipv6.payload();
        let len = ipv6.packet().len() as u32;

        match ipv6.get_next_header() {
            IpNextHeaderProtocols::Tcp => {
                if let Some(tcp) = TcpPacket::new(payload) {
                    self.observe_transport(src, dst, tcp.get_source(), tcp.get_destination(), protocol, len, now, Some(tcp.get_flags()), Some(tcp.get_window()), 6);
                }
            }
            IpNextHeaderProtocols::Udp => {
                if let Some(udp) = UdpPacket::new(payload) {
                    self.observe_transport(src, dst, udp.get_source(), udp.get_destination(), protocol, len, now, None, None, 6);
                }
            }
            IpNextHeaderProtocols::Icmpv6 => {
                if let Some(icmp) = Icmpv6Packet::new(payload) {
                    let icmp_type = icmp.get_icmpv6_type().0;
                    let icmp_code = icmp.get_icmpv6_code().0;
                    self.observe_icmp(src, dst, protocol, icmp_type, icmp_code, len, now, 6);
                }
            }
            _ => self.observe_degenerate(src, dst, protocol, len, now, 6),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn observe_transport(
        &self,
        src: IpAddr,
        dst: IpAddr,
        src_port: u16,
        dst_port: u16,
        protocol: Protocol,
        len: u32,
        now: SystemTime,
        tcp_flags: Option<u8>,
        tcp_window: Option<u16>,
        ip_version: u8,
    ) {
        let (key, direction) = FlowKey::for_tcp_udp(
            Endpoint { addr: src, port: src_port },
            Endpoint { addr: dst, port: dst_port },
            protocol,
        );
        // Whichever direction this packet is tagged, the endpoint it fills
        // in is always the sender's own (addr, port).
        let observed_endpoint = Endpoint { addr: src, port: src_port };
        let pkt = ObservedPacket { timestamp: now, length: len, direction, tcp_flags, tcp_window };
        if let Some(flow) = self.flow_table.observe(key, ip_version, Some((direction, observed_endpoint)), pkt) {
            self.emit(flow);
        }
    }

    fn observe_icmp(
        &self,
        src: IpAddr,
        dst: IpAddr,
        protocol: Protocol,
        icmp_type: u8,
        icmp_code: u8,
        len: u32,
        now: SystemTime,
        ip_version: u8,
    ) {
        let key = FlowKey::for_icmp(src, dst, protocol, icmp_type, icmp_code);
        let pkt = ObservedPacket { timestamp: now, length: len, direction: Direction::Forward, tcp_flags: None, tcp_window: None };
        if let Some(flow) = self.flow_table.observe(key, ip_version, None, pkt) {
            self.emit(flow);
        }
    }

    fn observe_degenerate(&self, src: IpAddr, dst: IpAddr, protocol: Protocol, len: u32, now: SystemTime, ip_version: u8) {
        let key = FlowKey::degenerate(src, dst, protocol);
        let pkt = ObservedPacket { timestamp: now, length: len, direction: Direction::Forward, tcp_flags: None, tcp_window: None };
        if let Some(flow) = self.flow_table.observe(key, ip_version, None, pkt) {
            self.emit(flow);
        }
    }

    fn emit(&self, flow: Flow) {
        self.queue.push(flow);
    }
}

/// Walks the expiry index every tick and forwards timed-out flows to the
/// queue (§5, "Expiry sweeper").
pub fn run_expiry_sweeper(flow_table: Arc<FlowTable>, queue: Arc<FlowQueue>, shutdown: Arc<AtomicBool>, period: std::time::Duration) {
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(period);
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        for flow in flow_table.expiry_sweep(SystemTime::now()) {
            queue.push(flow);
        }
    }
}
