//! Persisted state (§6): append-only attack log and an upserted IP summary
//! log, both line-oriented CSV. Log persistence itself is an external
//! concern per §1's scope note; this module only implements the sink
//! interface the Attack Handler writes through.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct AttackLogRow {
    pub timestamp: DateTime<Utc>,
    pub src_addr: String,
    pub src_port: u16,
    pub dst_addr: String,
    pub dst_port: u16,
    pub protocol: String,
    pub attack_type: String,
    pub confidence: f64,
    pub blocked: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpSummaryRow {
    pub ip: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub attack_types: String,
    pub block_count: u32,
    pub is_blocked: bool,
}

pub trait LogSink: Send + Sync {
    fn log_attack(&self, row: &AttackLogRow) -> Result<()>;
    fn upsert_ip_summary(
        &self,
        ip: IpAddr,
        attack_type: &str,
        now: DateTime<Utc>,
        block_count: u32,
        is_blocked: bool,
    ) -> Result<()>;
}

/// CSV-backed sink: the attack log is appended one row per call; the IP
/// summary is a small in-memory upsert table flushed to disk on every
/// update. Both files sit behind their own mutex (§9, "only the append-only
/// log file handle is process-global").
pub struct CsvLogSink {
    attack_log_path: PathBuf,
    ip_summary_path: PathBuf,
    attack_writer: Mutex<csv::Writer<std::fs::File>>,
    ip_summaries: Mutex<HashMap<IpAddr, IpSummaryRow>>,
}

impl CsvLogSink {
    pub fn open(attack_log_path: PathBuf, ip_summary_path: PathBuf) -> Result<Self> {
        let needs_header = !attack_log_path.exists();
        let file = OpenOptions::new().create(true).append(true).open(&attack_log_path)?;
        let attack_writer = csv::WriterBuilder::new().has_headers(needs_header).from_writer(file);

        let mut ip_summaries = HashMap::new();
        if ip_summary_path.exists() {
            if let Ok(mut reader) = csv::Reader::from_path(&ip_summary_path) {
                for record in reader.deserialize::<IpSummaryRow>().flatten() {
                    if let Ok(addr) = record.ip.parse::<IpAddr>() {
                        ip_summaries.insert(addr, record);
                    }
                }
            }
        }

        Ok(Self {
            attack_log_path,
            ip_summary_path,
            attack_writer: Mutex::new(attack_writer),
            ip_summaries: Mutex::new(ip_summaries),
        })
    }

    fn flush_ip_summaries(&self) -> Result<()> {
        let summaries = self.ip_summaries.lock();
        let mut writer = csv::Writer::from_path(&self.ip_summary_path)?;
        for row in summaries.values() {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl LogSink for CsvLogSink {
    fn log_attack(&self, row: &AttackLogRow) -> Result<()> {
        let mut writer = self.attack_writer.lock();
        writer.serialize(row)?;
        writer.flush()?;
        Ok(())
    }

    fn upsert_ip_summary(
        &self,
        ip: IpAddr,
        attack_type: &str,
        now: DateTime<Utc>,
        block_count: u32,
        is_blocked: bool,
    ) -> Result<()> {
        {
            let mut summaries = self.ip_summaries.lock();
            let entry = summaries.entry(ip).or_insert_with(|| IpSummaryRow {
                ip: ip.to_string(),
                first_seen: now,
                last_seen: now,
                attack_types: String::new(),
                block_count: 0,
                is_blocked: false,
            });
            entry.last_seen = now;
            entry.block_count = block_count;
            entry.is_blocked = is_blocked;
            if !entry.attack_types.split(';').any(|t| t == attack_type) {
                if entry.attack_types.is_empty() {
                    entry.attack_types = attack_type.to_string();
                } else {
                    entry.attack_types.push(';');
                    entry.attack_types.push_str(attack_type);
                }
            }
        }
        self.flush_ip_summaries()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn ip_summary_unions_attack_types_across_calls() {
        let dir = std::env::temp_dir().join(format!("ddos_shield_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let sink = CsvLogSink::open(dir.join("attacks.csv"), dir.join("ips.csv")).unwrap();
        let now = Utc::now();
        let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5));
        sink.upsert_ip_summary(ip, "SYN Flood", now, 1, true).unwrap();
        sink.upsert_ip_summary(ip, "UDP Flood", now, 2, true).unwrap();
        let summaries = sink.ip_summaries.lock();
        let row = summaries.get(&ip).unwrap();
        assert!(row.attack_types.contains("SYN Flood"));
        assert!(row.attack_types.contains("UDP Flood"));
        assert_eq!(row.block_count, 2);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
