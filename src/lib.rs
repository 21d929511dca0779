//! Online DDoS detection/prevention pipeline: flow reconstruction, feature
//! extraction, ensemble classification, and blocklist enforcement, wired
//! together in the dependency order from §9 (Whitelist -> Blocklist ->
//! Detector).

pub mod attack_handler;
pub mod blocklist;
pub mod capture;
pub mod config;
pub mod control;
pub mod detector;
pub mod ensemble;
pub mod error;
pub mod features;
pub mod flow;
pub mod logging;
pub mod model;
pub mod stats;
pub mod whitelist;

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use attack_handler::{AttackHandler, AttackHandlerConfig, NullNotifier};
use blocklist::{Blocklist, IptablesEffector};
use config::Config;
use control::ControlSurface;
use detector::{Detector, FlowQueue};
use error::Result;
use flow::FlowTable;
use logging::CsvLogSink;
use model::{ModelHandle, ModelKind, PyModelHandle};
use stats::DetectionStats;
use whitelist::Whitelist;

/// Loads whichever joblib models are configured via environment variables,
/// skipping (and logging) any that fail to load rather than refusing to
/// start the whole pipeline (§7, "ModelExecutionFailure ... ensemble
/// continues with the remaining models").
fn load_models() -> Vec<Box<dyn ModelHandle>> {
    let mut models: Vec<Box<dyn ModelHandle>> = Vec::new();

    if let Ok(path) = env::var("DDOS_CIC_MODEL_PATH") {
        let scaler_path = env::var("DDOS_CIC_SCALER_PATH").ok();
        let label_map: HashMap<usize, String> =
            [(0, "Benign".to_string()), (1, "DDoS".to_string())].into_iter().collect();
        match PyModelHandle::load(
            &path,
            scaler_path.as_deref(),
            features::Schema::CicDdos.feature_names().iter().map(|s| s.to_string()).collect(),
            label_map,
            ModelKind::CicDdos,
            0.6,
        ) {
            Ok(handle) => models.push(Box::new(handle)),
            Err(e) => error!("failed to load CIC-DDoS model at {path}: {e}"),
        }
    }

    if let Ok(path) = env::var("DDOS_SURICATA_MODEL_PATH") {
        let scaler_path = env::var("DDOS_SURICATA_SCALER_PATH").ok();
        let label_map: HashMap<usize, String> =
            [(0, "Benign".to_string()), (1, "DDoS".to_string())].into_iter().collect();
        match PyModelHandle::load(
            &path,
            scaler_path.as_deref(),
            features::Schema::Suricata.feature_names().iter().map(|s| s.to_string()).collect(),
            label_map,
            ModelKind::Suricata,
            0.4,
        ) {
            Ok(handle) => models.push(Box::new(handle)),
            Err(e) => error!("failed to load Suricata model at {path}: {e}"),
        }
    }

    if models.is_empty() {
        warn!("no models configured (DDOS_CIC_MODEL_PATH / DDOS_SURICATA_MODEL_PATH unset)");
    }
    models
}

fn build_config() -> Config {
    let mut config = Config::default();
    if let Ok(interface) = env::var("DDOS_INTERFACE") {
        config.network.interface = interface;
    }
    config
}

/// Builds the full pipeline and runs it until a shutdown signal arrives.
pub fn run() -> Result<()> {
    info!("starting up");

    let config = build_config();
    let models = load_models();

    let whitelist = whitelist::shared(Whitelist::from_entries(&config.prevention.whitelist));

    let effector = Box::new(IptablesEffector::new());
    let blocklist = Arc::new(Blocklist::new(
        effector,
        whitelist.clone(),
        Duration::from_secs(config.prevention.block_duration_secs),
    ));

    let flow_table = Arc::new(FlowTable::new(
        config.network.max_packets_per_flow,
        Duration::from_secs(config.network.flow_idle_timeout_secs),
        config.network.buffer_size,
    ));
    let queue = Arc::new(FlowQueue::new(config.network.buffer_size));
    let stats = Arc::new(DetectionStats::new());

    let log_dir = env::var("DDOS_LOG_DIR").unwrap_or_else(|_| ".".to_string());
    let log_sink = Arc::new(CsvLogSink::open(
        PathBuf::from(&log_dir).join("attack_log.csv"),
        PathBuf::from(&log_dir).join("ip_summary.csv"),
    )?);

    let attack_handler = Arc::new(AttackHandler::new(
        blocklist.clone(),
        whitelist.clone(),
        log_sink,
        Arc::new(NullNotifier),
        stats.clone(),
        AttackHandlerConfig {
            auto_block: config.prevention.auto_block,
            auto_block_attack_types: config.prevention.auto_block_attack_types.clone(),
            block_confidence_threshold: config.prevention.block_confidence_threshold,
            block_duration: Duration::from_secs(config.prevention.block_duration_secs),
            cooldown_period: Duration::from_secs(60),
        },
    ));

    let detection_shutdown = Arc::new(AtomicBool::new(true));
    let detector = Arc::new(Detector::new(
        queue.clone(),
        models,
        whitelist.clone(),
        attack_handler.clone(),
        stats.clone(),
        config.detection.clone(),
        config.advanced.clone(),
        detection_shutdown.clone(),
    ));

    let control = Arc::new(ControlSurface::new(
        config,
        whitelist,
        blocklist,
        flow_table,
        queue,
        detector,
        attack_handler,
        stats,
        detection_shutdown,
    ));

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("shutdown requested");
            running.store(false, Ordering::SeqCst);
        })?;
    }

    control.start_prevention()?;
    if let Err(e) = control.start_detection() {
        error!("failed to start detection: {e}");
    }

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    control.stop_detection()?;
    control.stop_prevention()?;
    info!("shut down cleanly");
    Ok(())
}
