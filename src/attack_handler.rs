//! Attack Handler (C5): turns a confirmed attack verdict into a logged,
//! deduplicated, optionally-blocked event (§4.5).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;

use crate::blocklist::Blocklist;
use crate::ensemble::Verdict;
use crate::error::Result;
use crate::flow::Flow;
use crate::logging::{AttackLogRow, LogSink};
use crate::stats::DetectionStats;
use crate::whitelist::SharedWhitelist;

/// External notification transport (§1, out of scope for the core). The
/// core only depends on this trait boundary.
pub trait Notifier: Send + Sync {
    fn notify(&self, info: &AttackInfo) -> Result<()>;
}

/// A notifier that drops every notification; used where no transport is
/// configured, or in tests.
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _info: &AttackInfo) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AttackInfo {
    pub timestamp: SystemTime,
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub protocol: String,
    pub packet_rate: f64,
    pub byte_rate: f64,
    pub attack_type: String,
    pub confidence: f64,
    pub details: String,
    pub blocked: bool,
}

pub struct AttackHandlerConfig {
    pub auto_block: bool,
    pub auto_block_attack_types: Vec<String>,
    pub block_confidence_threshold: f64,
    pub block_duration: Duration,
    pub cooldown_period: Duration,
}

pub struct AttackHandler {
    blocklist: Arc<Blocklist>,
    whitelist: SharedWhitelist,
    log_sink: Arc<dyn LogSink>,
    notifier: Arc<dyn Notifier>,
    stats: Arc<DetectionStats>,
    config: Mutex<AttackHandlerConfig>,
    /// (attack_type, src_addr) -> last notification time (§4.5 step 5).
    last_notified: DashMap<(String, IpAddr), SystemTime>,
    last_attack_time: Mutex<Option<SystemTime>>,
}

impl AttackHandler {
    pub fn new(
        blocklist: Arc<Blocklist>,
        whitelist: SharedWhitelist,
        log_sink: Arc<dyn LogSink>,
        notifier: Arc<dyn Notifier>,
        stats: Arc<DetectionStats>,
        config: AttackHandlerConfig,
    ) -> Self {
        Self {
            blocklist,
            whitelist,
            log_sink,
            notifier,
            stats,
            config: Mutex::new(config),
            last_notified: DashMap::new(),
            last_attack_time: Mutex::new(None),
        }
    }

    pub fn update_config(&self, config: AttackHandlerConfig) {
        *self.config.lock() = config;
    }

    fn flow_rate(flow: &Flow) -> (f64, f64) {
        let secs = flow.duration().as_secs_f64().max(0.001);
        (flow.total_packets as f64 / secs, flow.total_bytes as f64 / secs)
    }

    pub fn handle(&self, flow: &Flow, verdict: &Verdict, now: SystemTime) -> Result<AttackInfo> {
        self.stats.record_attack(&verdict.attack_type);
        *self.last_attack_time.lock() = Some(now);

        let src = flow.forward_endpoint.or(flow.backward_endpoint);
        let dst = flow.backward_endpoint.or(flow.forward_endpoint);
        let src_addr = src.map(|e| e.addr).unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));
        let src_port = src.map(|e| e.port).unwrap_or(0);
        let dst_addr = dst.map(|e| e.addr).unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]));
        let dst_port = dst.map(|e| e.port).unwrap_or(0);
        let (packet_rate, byte_rate) = Self::flow_rate(flow);

        let mut info = AttackInfo {
            timestamp: now,
            src_addr,
            src_port,
            dst_addr,
            dst_port,
            protocol: format!("{:?}", flow.key.protocol()),
            packet_rate,
            byte_rate,
            attack_type: verdict.attack_type.clone(),
            confidence: verdict.confidence,
            details: format!("{} models scored this flow", verdict.per_model_results.len()),
            blocked: false,
        };

        let attack_ts = chrono::DateTime::<Utc>::from(now);
        self.log_sink.log_attack(&AttackLogRow {
            timestamp: attack_ts,
            src_addr: src_addr.to_string(),
            src_port,
            dst_addr: dst_addr.to_string(),
            dst_port,
            protocol: info.protocol.clone(),
            attack_type: info.attack_type.clone(),
            confidence: info.confidence,
            blocked: false,
        })?;

        let config = {
            let guard = self.config.lock();
            AttackHandlerConfig {
                auto_block: guard.auto_block,
                auto_block_attack_types: guard.auto_block_attack_types.clone(),
                block_confidence_threshold: guard.block_confidence_threshold,
                block_duration: guard.block_duration,
                cooldown_period: guard.cooldown_period,
            }
        };

        let type_allowed =
            config.auto_block_attack_types.is_empty() || config.auto_block_attack_types.contains(&info.attack_type);
        let should_block = config.auto_block
            && type_allowed
            && info.confidence >= config.block_confidence_threshold
            && !self.whitelist.read().contains_ip(&src_addr);

        if should_block {
            match self.blocklist.add(src_addr, &info.attack_type, Some(config.block_duration), now) {
                Ok(true) => {
                    info.blocked = true;
                    info!("blocked {src_addr} for {}", info.attack_type);
                }
                Ok(false) => {}
                Err(e) => warn!("failed to block {src_addr}: {e}"),
            }
        }

        let dedup_key = (info.attack_type.clone(), src_addr);
        let should_notify = match self.last_notified.get(&dedup_key) {
            Some(last) => now.duration_since(*last).unwrap_or_default() >= config.cooldown_period,
            None => true,
        };
        if should_notify {
            if let Err(e) = self.notifier.notify(&info) {
                warn!("notification dispatch failed: {e}");
            }
            self.last_notified.insert(dedup_key, now);
        }

        let block_count = self
            .blocklist
            .list(now)
            .into_iter()
            .find(|(addr, _, _, _)| *addr == src_addr)
            .map(|(_, _, _, count)| count)
            .unwrap_or(0);
        self.log_sink.upsert_ip_summary(src_addr, &info.attack_type, attack_ts, block_count, info.blocked)?;

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, Endpoint, FlowKey, FlowTable, ObservedPacket, Protocol};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    struct CountingNotifier {
        count: Mutex<u32>,
    }

    impl Notifier for CountingNotifier {
        fn notify(&self, _info: &AttackInfo) -> Result<()> {
            *self.count.lock() += 1;
            Ok(())
        }
    }

    struct NoopLogSink;
    impl LogSink for NoopLogSink {
        fn log_attack(&self, _row: &AttackLogRow) -> Result<()> {
            Ok(())
        }
        fn upsert_ip_summary(
            &self,
            _ip: IpAddr,
            _attack_type: &str,
            _now: chrono::DateTime<Utc>,
            _block_count: u32,
            _is_blocked: bool,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn make_flow() -> Flow {
        let table = FlowTable::new(1000, Duration::from_secs(60), 10_000);
        let src = Endpoint { addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), port: 40000 };
        let dst = Endpoint { addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), port: 80 };
        let (key, dir) = FlowKey::for_tcp_udp(src, dst, Protocol::Tcp);
        let t0 = SystemTime::now();
        table.observe(
            key,
            4,
            Some((dir, src)),
            ObservedPacket { timestamp: t0, length: 60, direction: dir, tcp_flags: Some(0x02), tcp_window: Some(8192) },
        );
        table.expiry_sweep(t0 + Duration::from_secs(120)).remove(0)
    }

    #[test]
    fn repeated_attack_within_cooldown_suppresses_second_notification() {
        use crate::blocklist::{Blocklist, FirewallEffector};

        struct NoopEffector;
        impl FirewallEffector for NoopEffector {
            fn init(&self) -> Result<()> {
                Ok(())
            }
            fn teardown(&self) -> Result<()> {
                Ok(())
            }
            fn block(&self, _addr: IpAddr) -> Result<()> {
                Ok(())
            }
            fn unblock(&self, _addr: IpAddr) -> Result<()> {
                Ok(())
            }
        }

        let whitelist = crate::whitelist::shared(crate::whitelist::Whitelist::new());
        let blocklist = Arc::new(Blocklist::new(Box::new(NoopEffector), whitelist.clone(), Duration::from_secs(300)));
        let notifier = Arc::new(CountingNotifier { count: Mutex::new(0) });
        let handler = AttackHandler::new(
            blocklist,
            whitelist,
            Arc::new(NoopLogSink),
            notifier.clone(),
            Arc::new(DetectionStats::new()),
            AttackHandlerConfig {
                auto_block: true,
                auto_block_attack_types: Vec::new(),
                block_confidence_threshold: 0.8,
                block_duration: Duration::from_secs(300),
                cooldown_period: Duration::from_secs(60),
            },
        );

        let flow = make_flow();
        let verdict = Verdict {
            is_attack: true,
            confidence: 0.95,
            attack_type: "SYN Flood".to_string(),
            per_model_results: vec![],
            missing_feature_names: vec![],
        };

        let t0 = SystemTime::now();
        handler.handle(&flow, &verdict, t0).unwrap();
        handler.handle(&flow, &verdict, t0 + Duration::from_secs(30)).unwrap();
        assert_eq!(*notifier.count.lock(), 1);

        handler.handle(&flow, &verdict, t0 + Duration::from_secs(90)).unwrap();
        assert_eq!(*notifier.count.lock(), 2);
    }
}
