//! Runtime configuration. Parsing an on-disk file is an external concern
//! (the UI/config-loader collaborator); this module only defines the
//! recognized keys, their defaults, and how a hot reload is applied to a
//! running pipeline.

use std::collections::HashMap;

use crate::error::{DDoSError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinationMethod {
    MaxConfidence,
    Weighted,
    Voting,
}

impl Default for CombinationMethod {
    fn default() -> Self {
        CombinationMethod::MaxConfidence
    }
}

impl CombinationMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "max_confidence" => Some(CombinationMethod::MaxConfidence),
            "weighted" => Some(CombinationMethod::Weighted),
            "voting" => Some(CombinationMethod::Voting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectionConfig {
    pub detection_threshold: f64,
    pub check_interval_secs: u64,
    pub batch_size: usize,
    pub combination_method: CombinationMethod,
    pub model_weights: Vec<f64>,
    pub attack_type_mapping: HashMap<String, String>,
    pub false_positive_threshold: f64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            detection_threshold: 0.7,
            check_interval_secs: 1,
            batch_size: 32,
            combination_method: CombinationMethod::MaxConfidence,
            model_weights: vec![0.6, 0.4],
            attack_type_mapping: default_attack_type_mapping(),
            false_positive_threshold: 0.9,
        }
    }
}

pub fn default_attack_type_mapping() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("Benign".to_string(), "Normal".to_string());
    m.insert("LDAP".to_string(), "LDAP Amplification".to_string());
    m.insert("MSSQL".to_string(), "MSSQL Amplification".to_string());
    m.insert("NetBIOS".to_string(), "NetBIOS Amplification".to_string());
    m.insert("Syn".to_string(), "SYN Flood".to_string());
    m.insert("UDP".to_string(), "UDP Flood".to_string());
    m.insert("UDPLag".to_string(), "UDP Lag".to_string());
    m.insert("DDoS".to_string(), "Generic DDoS".to_string());
    m
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub interface: String,
    pub capture_filter: String,
    pub buffer_size: usize,
    pub max_packets_per_flow: u32,
    pub flow_idle_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            capture_filter: "ip".to_string(),
            buffer_size: 10_000,
            max_packets_per_flow: 1_000,
            flow_idle_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PreventionConfig {
    pub block_duration_secs: u64,
    pub whitelist: Vec<String>,
    pub auto_block: bool,
    pub auto_block_attack_types: Vec<String>,
    pub block_confidence_threshold: f64,
}

impl PreventionConfig {
    fn defaults_with(detection_threshold: f64) -> Self {
        Self {
            block_duration_secs: 300,
            whitelist: Vec::new(),
            auto_block: true,
            auto_block_attack_types: Vec::new(),
            block_confidence_threshold: detection_threshold + 0.1,
        }
    }
}

impl Default for PreventionConfig {
    fn default() -> Self {
        Self::defaults_with(DetectionConfig::default().detection_threshold)
    }
}

#[derive(Debug, Clone)]
pub struct AdvancedConfig {
    pub async_analysis: bool,
    pub max_analysis_threads: usize,
    pub min_packets_for_analysis: u32,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            async_analysis: true,
            max_analysis_threads: num_cpus::get().max(1),
            min_packets_for_analysis: 3,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub detection: DetectionConfig,
    pub network: NetworkConfig,
    pub prevention: PreventionConfig,
    pub advanced: AdvancedConfig,
}

/// A config section named by `UpdateConfig(section, kv)` on the control
/// surface (§6). Unknown sections/keys are rejected, never silently
/// dropped (see `ConfigurationError` in the error taxonomy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Detection,
    Network,
    Prevention,
    Advanced,
}

impl ConfigSection {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Detection" => Some(ConfigSection::Detection),
            "Network" => Some(ConfigSection::Network),
            "Prevention" => Some(ConfigSection::Prevention),
            "Advanced" => Some(ConfigSection::Advanced),
            _ => None,
        }
    }
}

/// Keys that require a clean stop/start of a running component rather
/// than an in-place swap (§5, "Config hot-reload").
fn requires_restart(section: ConfigSection, key: &str) -> bool {
    matches!(
        (section, key),
        (ConfigSection::Network, "interface")
            | (ConfigSection::Network, "buffer_size")
            | (ConfigSection::Advanced, "max_analysis_threads")
    )
}

impl Config {
    /// Applies a single key/value update to the given section. Fields that
    /// can change in place are applied immediately; fields that require a
    /// restart are rejected with `ConfigurationError` and must be retried
    /// by the caller after the owning component is stopped (the core never
    /// performs the restart itself — see §5/§7).
    pub fn update(&mut self, section: &str, key: &str, value: &str) -> Result<()> {
        let section = ConfigSection::parse(section)
            .ok_or_else(|| DDoSError::ConfigError(format!("unknown config section: {section}")))?;

        if requires_restart(section, key) {
            return Err(DDoSError::ConfigError(format!(
                "key '{key}' requires stopping the owning component before it can change"
            )));
        }

        match (section, key) {
            (ConfigSection::Detection, "detection_threshold") => {
                self.detection.detection_threshold = parse_f64(value)?;
            }
            (ConfigSection::Detection, "check_interval") => {
                self.detection.check_interval_secs = parse_u64(value)?;
            }
            (ConfigSection::Detection, "batch_size") => {
                self.detection.batch_size = parse_usize(value)?;
            }
            (ConfigSection::Detection, "combination_method") => {
                self.detection.combination_method = CombinationMethod::parse(value)
                    .ok_or_else(|| DDoSError::ConfigError(format!("invalid combination_method: {value}")))?;
            }
            (ConfigSection::Detection, "model_weights") => {
                self.detection.model_weights = value
                    .split(',')
                    .map(|w| w.trim().parse::<f64>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| DDoSError::ConfigError(e.to_string()))?;
            }
            (ConfigSection::Detection, "attack_type_mapping") => {
                for pair in value.split(';') {
                    if let Some((k, v)) = pair.split_once('=') {
                        self.detection
                            .attack_type_mapping
                            .insert(k.trim().to_string(), v.trim().to_string());
                    }
                }
            }
            (ConfigSection::Detection, "false_positive_threshold") => {
                self.detection.false_positive_threshold = parse_f64(value)?;
            }
            (ConfigSection::Network, "capture_filter") => {
                self.network.capture_filter = value.to_string();
            }
            (ConfigSection::Network, "max_packets_per_flow") => {
                self.network.max_packets_per_flow = parse_u64(value)? as u32;
            }
            (ConfigSection::Prevention, "block_duration") => {
                self.prevention.block_duration_secs = parse_u64(value)?;
            }
            (ConfigSection::Prevention, "whitelist") => {
                self.prevention.whitelist = value.split(',').map(|s| s.trim().to_string()).collect();
            }
            (ConfigSection::Prevention, "auto_block") => {
                self.prevention.auto_block = parse_bool(value)?;
            }
            (ConfigSection::Prevention, "auto_block_attack_types") => {
                self.prevention.auto_block_attack_types =
                    value.split(',').filter(|s| !s.is_empty()).map(|s| s.trim().to_string()).collect();
            }
            (ConfigSection::Prevention, "block_confidence_threshold") => {
                self.prevention.block_confidence_threshold = parse_f64(value)?;
            }
            (ConfigSection::Advanced, "async_analysis") => {
                self.advanced.async_analysis = parse_bool(value)?;
            }
            (ConfigSection::Advanced, "min_packets_for_analysis") => {
                self.advanced.min_packets_for_analysis = parse_u64(value)? as u32;
            }
            _ => {
                return Err(DDoSError::ConfigError(format!(
                    "unknown or restart-only key '{key}' in section {section:?}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_f64(s: &str) -> Result<f64> {
    s.trim().parse().map_err(|_| DDoSError::ConfigError(format!("not a float: {s}")))
}

fn parse_u64(s: &str) -> Result<u64> {
    s.trim().parse().map_err(|_| DDoSError::ConfigError(format!("not an integer: {s}")))
}

fn parse_usize(s: &str) -> Result<usize> {
    s.trim().parse().map_err(|_| DDoSError::ConfigError(format!("not an integer: {s}")))
}

fn parse_bool(s: &str) -> Result<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(DDoSError::ConfigError(format!("not a bool: {s}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_only_keys_are_rejected() {
        let mut cfg = Config::default();
        let err = cfg.update("Network", "interface", "eth1").unwrap_err();
        assert!(matches!(err, DDoSError::ConfigError(_)));
    }

    #[test]
    fn in_place_keys_apply_immediately() {
        let mut cfg = Config::default();
        cfg.update("Detection", "detection_threshold", "0.85").unwrap();
        assert_eq!(cfg.detection.detection_threshold, 0.85);
    }

    #[test]
    fn unknown_section_is_rejected() {
        let mut cfg = Config::default();
        assert!(cfg.update("Bogus", "x", "1").is_err());
    }

    #[test]
    fn attack_type_mapping_merges_kv_pairs() {
        let mut cfg = Config::default();
        cfg.update("Detection", "attack_type_mapping", "Syn=Custom Syn;UDP=Custom UDP").unwrap();
        assert_eq!(cfg.detection.attack_type_mapping.get("Syn").unwrap(), "Custom Syn");
        assert_eq!(cfg.detection.attack_type_mapping.get("Benign").unwrap(), "Normal");
    }
}
