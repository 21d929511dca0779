//! Control/status surface (§6): the small internal API the (out-of-scope)
//! web UI collaborator drives. Owns the dependency order from §9
//! (Whitelist -> Blocklist -> Detector) and the shutdown sequence from §5.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

use log::{info, warn};
use parking_lot::RwLock;

use crate::attack_handler::{AttackHandler, AttackHandlerConfig};
use crate::blocklist::Blocklist;
use crate::capture::{self, CaptureWorker};
use crate::config::Config;
use crate::detector::{Detector, FlowQueue};
use crate::error::{DDoSError, Result};
use crate::flow::FlowTable;
use crate::stats::{DetectionStats, DetectionStatsSnapshot};
use crate::whitelist::{SharedWhitelist, Whitelist};

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const BLOCKLIST_SWEEP_PERIOD: Duration = Duration::from_secs(10);
const EXPIRY_SWEEP_PERIOD: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Threads {
    capture: Option<JoinHandle<()>>,
    expiry_sweeper: Option<JoinHandle<()>>,
    detector: Option<JoinHandle<()>>,
    blocklist_sweeper: Option<JoinHandle<()>>,
}

/// Best-effort join with a bounded wait; a worker that outlives the
/// timeout is logged and left to finish on its own (§5, "worker join
/// timeout 2s").
fn join_with_timeout(name: &str, handle: JoinHandle<()>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let watched = std::thread::spawn(move || {
        let _ = handle.join();
        let _ = tx.send(());
    });
    if rx.recv_timeout(WORKER_JOIN_TIMEOUT).is_err() {
        warn!("{name} did not stop within the join timeout");
    }
    let _ = watched.join();
}

pub struct ControlSurface {
    config: RwLock<Config>,
    whitelist: SharedWhitelist,
    blocklist: Arc<Blocklist>,
    flow_table: Arc<FlowTable>,
    queue: Arc<FlowQueue>,
    detector: Arc<Detector>,
    attack_handler: Arc<AttackHandler>,
    stats: Arc<DetectionStats>,
    detection_shutdown: Arc<AtomicBool>,
    threads: Mutex<Threads>,
}

impl ControlSurface {
    /// `detection_shutdown` must be the same `Arc` handed to
    /// `Detector::new` for the detector being passed in here, so that
    /// flipping it in `start_detection`/`stop_detection` actually governs
    /// the detector loop rather than a second, independent flag.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        whitelist: SharedWhitelist,
        blocklist: Arc<Blocklist>,
        flow_table: Arc<FlowTable>,
        queue: Arc<FlowQueue>,
        detector: Arc<Detector>,
        attack_handler: Arc<AttackHandler>,
        stats: Arc<DetectionStats>,
        detection_shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            whitelist,
            blocklist,
            flow_table,
            queue,
            detector,
            attack_handler,
            stats,
            detection_shutdown,
            threads: Mutex::new(Threads::default()),
        }
    }

    /// `StartDetection` (§6): spawns the capture worker, the expiry
    /// sweeper, and the detector loop.
    pub fn start_detection(&self) -> Result<bool> {
        let interface_name = self.config.read().network.interface.clone();
        let interface = CaptureWorker::find_interface(&interface_name)
            .ok_or_else(|| DDoSError::NetworkError(format!("interface not found: {interface_name}")))?;

        self.detection_shutdown.store(false, Ordering::SeqCst);

        let flow_table = self.flow_table.clone();
        let queue = self.queue.clone();
        let shutdown = self.detection_shutdown.clone();
        let capture = std::thread::spawn(move || {
            let worker = CaptureWorker::new(flow_table, queue, shutdown);
            worker.run(&interface);
        });

        let flow_table = self.flow_table.clone();
        let queue = self.queue.clone();
        let shutdown = self.detection_shutdown.clone();
        let expiry_sweeper = std::thread::spawn(move || {
            capture::run_expiry_sweeper(flow_table, queue, shutdown, EXPIRY_SWEEP_PERIOD);
        });

        let detector = self.detector.clone();
        let detector_thread = std::thread::spawn(move || detector.run());

        let mut threads = self.threads.lock().unwrap();
        threads.capture = Some(capture);
        threads.expiry_sweeper = Some(expiry_sweeper);
        threads.detector = Some(detector_thread);
        info!("detection started on {interface_name}");
        Ok(true)
    }

    /// `StopDetection` (§6): stop capture -> drain expiry sweeper once ->
    /// stop detector workers, per the §5 shutdown sequence.
    pub fn stop_detection(&self) -> Result<bool> {
        self.detection_shutdown.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        if let Some(h) = threads.capture.take() {
            join_with_timeout("capture worker", h);
        }
        for flow in self.flow_table.expiry_sweep(SystemTime::now()) {
            self.queue.push(flow);
        }
        if let Some(h) = threads.expiry_sweeper.take() {
            join_with_timeout("expiry sweeper", h);
        }
        if let Some(h) = threads.detector.take() {
            join_with_timeout("detector loop", h);
        }
        info!("detection stopped");
        Ok(true)
    }

    /// `StartPrevention` (§6): installs the firewall chain and starts the
    /// blocklist sweeper.
    pub fn start_prevention(&self) -> Result<bool> {
        self.blocklist.start()?;
        let blocklist = self.blocklist.clone();
        let sweeper = std::thread::spawn(move || loop {
            std::thread::sleep(BLOCKLIST_SWEEP_PERIOD);
            blocklist.sweep(SystemTime::now());
        });
        self.threads.lock().unwrap().blocklist_sweeper = Some(sweeper);
        info!("prevention started");
        Ok(true)
    }

    /// `StopPrevention` (§6): tears down the firewall chain (§5, "remove
    /// firewall chain"). The sweeper thread is detached; it observes no
    /// further state once the chain is gone and exits with the process.
    pub fn stop_prevention(&self) -> Result<bool> {
        self.blocklist.shutdown()?;
        info!("prevention stopped");
        Ok(true)
    }

    /// `BlockIP` (§6): manual block, still subject to the whitelist check
    /// inside `Blocklist::add` (§4.6).
    pub fn block_ip(&self, addr: IpAddr, attack_type: &str, duration: Option<Duration>) -> Result<bool> {
        self.blocklist.add(addr, attack_type, duration, SystemTime::now())
    }

    pub fn unblock_ip(&self, addr: IpAddr) -> Result<bool> {
        self.blocklist.remove(addr)
    }

    pub fn get_blocked_ips(&self) -> Vec<(IpAddr, Vec<String>, Duration, u32)> {
        self.blocklist.list(SystemTime::now())
    }

    pub fn get_detection_stats(&self) -> DetectionStatsSnapshot {
        self.stats.snapshot()
    }

    /// `UpdateConfig(section, kv)` (§6): applies in place, or rejects keys
    /// that require a restart, per §7's "ConfigurationError" policy.
    pub fn update_config(&self, section: &str, key: &str, value: &str) -> Result<()> {
        {
            let mut config = self.config.write();
            config.update(section, key, value)?;
        }
        let config = self.config.read().clone();
        match section {
            "Detection" => self.detector.update_detection_config(config.detection),
            "Advanced" => self.detector.update_advanced_config(config.advanced),
            "Prevention" => {
                self.attack_handler.update_config(AttackHandlerConfig {
                    auto_block: config.prevention.auto_block,
                    auto_block_attack_types: config.prevention.auto_block_attack_types,
                    block_confidence_threshold: config.prevention.block_confidence_threshold,
                    block_duration: Duration::from_secs(config.prevention.block_duration_secs),
                    cooldown_period: Duration::from_secs(60),
                });
                if key == "whitelist" {
                    *self.whitelist.write() = Arc::new(Whitelist::from_entries(&config.prevention.whitelist));
                    info!("whitelist reloaded ({} entries)", config.prevention.whitelist.len());
                }
            }
            _ => {}
        }
        Ok(())
    }
}
