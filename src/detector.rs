//! Detector Loop (C4): drains the flow queue in batches, runs the
//! classifier ensemble, applies the false-positive guard, and forwards
//! confirmed attacks to the Attack Handler (§4.4).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use crossbeam_queue::ArrayQueue;
use log::{debug, error};
use parking_lot::RwLock;
use threadpool::ThreadPool;

use crate::attack_handler::AttackHandler;
use crate::config::{AdvancedConfig, DetectionConfig};
use crate::ensemble::{self, Verdict};
use crate::flow::{Flow, FlowKey};
use crate::model::ModelHandle;
use crate::stats::DetectionStats;
use crate::whitelist::{is_legitimate, SharedWhitelist, Whitelist};

/// Bounded Capture -> Detector queue (§5). Full queue drops the incoming
/// flow and counts it, never blocks the capture worker.
pub struct FlowQueue {
    queue: ArrayQueue<Flow>,
    dropped: AtomicU64,
}

impl FlowQueue {
    pub fn new(capacity: usize) -> Self {
        Self { queue: ArrayQueue::new(capacity.max(1)), dropped: AtomicU64::new(0) }
    }

    pub fn push(&self, flow: Flow) {
        if self.queue.push(flow).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pop(&self) -> Option<Flow> {
        self.queue.pop()
    }

    pub fn dropped_flows(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub struct Detector {
    queue: Arc<FlowQueue>,
    models: Arc<Vec<Box<dyn ModelHandle>>>,
    whitelist: SharedWhitelist,
    attack_handler: Arc<AttackHandler>,
    stats: Arc<DetectionStats>,
    detection_config: RwLock<DetectionConfig>,
    advanced_config: RwLock<AdvancedConfig>,
    pool: ThreadPool,
    shutdown: Arc<AtomicBool>,
    /// Last `FlowQueue::dropped_flows` value folded into `stats`, so each
    /// loop iteration only reports the new drops since the last sync.
    reported_drops: AtomicU64,
}

impl Detector {
    pub fn new(
        queue: Arc<FlowQueue>,
        models: Vec<Box<dyn ModelHandle>>,
        whitelist: SharedWhitelist,
        attack_handler: Arc<AttackHandler>,
        stats: Arc<DetectionStats>,
        detection_config: DetectionConfig,
        advanced_config: AdvancedConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let pool = ThreadPool::new(advanced_config.max_analysis_threads.max(1));
        Self {
            queue,
            models: Arc::new(models),
            whitelist,
            attack_handler,
            stats,
            detection_config: RwLock::new(detection_config),
            advanced_config: RwLock::new(advanced_config),
            pool,
            shutdown,
            reported_drops: AtomicU64::new(0),
        }
    }

    /// Folds new `FlowQueue` drops since the last call into `stats`
    /// (§4.4/§6, `dropped_flows`).
    fn sync_dropped_flows(&self) {
        let total = self.queue.dropped_flows();
        let previous = self.reported_drops.swap(total, Ordering::Relaxed);
        self.stats.record_dropped_flows(total.saturating_sub(previous));
    }

    pub fn update_detection_config(&self, config: DetectionConfig) {
        *self.detection_config.write() = config;
    }

    /// `async_analysis` and `min_packets_for_analysis` can change in
    /// place; `max_analysis_threads` cannot (it is rejected earlier by
    /// `Config::update` as a restart-only key).
    pub fn update_advanced_config(&self, config: AdvancedConfig) {
        *self.advanced_config.write() = config;
    }

    /// Non-blocking pop up to `batch_size` flows, skipping flows below
    /// `min_packets_for_analysis` and deduplicating by flow key (§4.4).
    fn drain_batch(&self, batch_size: usize, min_packets: u32) -> Vec<Flow> {
        let mut batch = Vec::with_capacity(batch_size);
        let mut seen: HashSet<FlowKey> = HashSet::new();
        while batch.len() < batch_size {
            let Some(flow) = self.queue.pop() else { break };
            if flow.total_packets < min_packets as u64 {
                continue;
            }
            if !seen.insert(flow.key.clone()) {
                continue;
            }
            batch.push(flow);
        }
        batch
    }

    fn score_flow(
        flow: &Flow,
        models: &[Box<dyn ModelHandle>],
        whitelist: &Whitelist,
        config: &DetectionConfig,
        stats: &DetectionStats,
    ) -> Verdict {
        let mut verdict = ensemble::classify(
            flow,
            models,
            &config.model_weights,
            config.combination_method,
            config.detection_threshold,
            &config.attack_type_mapping,
        );

        if verdict.is_attack
            && verdict.confidence >= config.detection_threshold
            && verdict.confidence < config.false_positive_threshold
        {
            let src = flow.forward_endpoint.or(flow.backward_endpoint);
            let dst = flow.backward_endpoint.or(flow.forward_endpoint);
            if let (Some(src), Some(dst)) = (src, dst) {
                let (legitimate, reason) =
                    is_legitimate(whitelist, src.addr, dst.addr, src.port, dst.port, flow);
                if legitimate {
                    debug!("downgrading verdict for {}: {reason}", src.addr);
                    verdict.is_attack = false;
                    verdict.attack_type = "Normal".to_string();
                    stats.record_false_positive();
                }
            }
        }

        verdict
    }

    fn process_batch(&self, batch: Vec<Flow>, async_analysis: bool, now: SystemTime) {
        let config = self.detection_config.read().clone();
        let detection_threshold = config.detection_threshold;

        let results: Vec<(Flow, Verdict, Duration)> = if async_analysis {
            let (tx, rx) = crossbeam_channel::bounded(batch.len());
            for flow in batch {
                let models = self.models.clone();
                let whitelist = self.whitelist.read().clone();
                let config = config.clone();
                let stats = self.stats.clone();
                let tx = tx.clone();
                self.pool.execute(move || {
                    let start = Instant::now();
                    let verdict = Self::score_flow(&flow, &models, &whitelist, &config, &stats);
                    let elapsed = start.elapsed();
                    let _ = tx.send((flow, verdict, elapsed));
                });
            }
            drop(tx);
            rx.iter().collect()
        } else {
            let whitelist = self.whitelist.read().clone();
            batch
                .into_iter()
                .map(|flow| {
                    let start = Instant::now();
                    let verdict = Self::score_flow(&flow, &self.models, &whitelist, &config, &self.stats);
                    (flow, verdict, start.elapsed())
                })
                .collect()
        };

        for (flow, verdict, elapsed) in results {
            self.stats.record_processing_time(elapsed);
            if verdict.is_attack && verdict.confidence >= detection_threshold {
                if let Err(e) = self.attack_handler.handle(&flow, &verdict, now) {
                    error!("attack handler failed: {e}");
                }
            } else {
                self.stats.record_benign();
            }
        }
    }

    /// Runs until the shutdown flag is set, respecting `check_interval` as
    /// the idle sleep (§4.4, §5). Intended to be the body of a dedicated
    /// worker thread.
    pub fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.sync_dropped_flows();
            let detection = self.detection_config.read().clone();
            let advanced = self.advanced_config.read().clone();
            let batch = self.drain_batch(detection.batch_size, advanced.min_packets_for_analysis);
            if batch.is_empty() {
                std::thread::sleep(Duration::from_secs(detection.check_interval_secs));
                continue;
            }
            self.process_batch(batch, advanced.async_analysis, SystemTime::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Direction, Endpoint, FlowTable, ObservedPacket, Protocol};
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn drain_batch_skips_small_flows_and_dedups_by_key() {
        let queue = Arc::new(FlowQueue::new(16));
        let table = FlowTable::new(1000, Duration::from_secs(60), 10_000);
        let src = Endpoint { addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port: 1000 };
        let dst = Endpoint { addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), port: 80 };
        let (key, dir) = FlowKey::for_tcp_udp(src, dst, Protocol::Tcp);
        let t0 = SystemTime::now();

        // flow with only 2 packets: below min_packets_for_analysis (3)
        table.observe(key.clone(), 4, Some((dir, src)), ObservedPacket {
            timestamp: t0, length: 40, direction: dir, tcp_flags: Some(0x02), tcp_window: Some(1024),
        });
        table.observe(key.clone(), 4, Some((dir, src)), ObservedPacket {
            timestamp: t0, length: 40, direction: dir, tcp_flags: Some(0x10), tcp_window: Some(1024),
        });
        let small_flows = table.expiry_sweep(t0 + Duration::from_secs(120));
        for f in small_flows {
            queue.push(f);
        }

        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn full_queue_drops_and_counts_exactly_one() {
        let queue = FlowQueue::new(1);
        let table = FlowTable::new(1000, Duration::from_secs(60), 10_000);
        let t0 = SystemTime::now();
        for i in 0..2u8 {
            let src = Endpoint { addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, i)), port: 1000 };
            let dst = Endpoint { addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 200)), port: 80 };
            let (key, dir) = FlowKey::for_tcp_udp(src, dst, Protocol::Tcp);
            table.observe(key, 4, Some((dir, src)), ObservedPacket {
                timestamp: t0, length: 40, direction: dir, tcp_flags: Some(0x02), tcp_window: Some(1024),
            });
        }
        let flows = table.expiry_sweep(t0 + Duration::from_secs(120));
        for f in flows {
            queue.push(f);
        }
        assert_eq!(queue.dropped_flows(), 1);
    }
}
