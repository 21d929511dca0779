//! Blocklist (C6): a TTL-indexed set of blocked source addresses backed by
//! a pluggable firewall effector, swept every 10s by a dedicated sweeper
//! (§4.6). All mutation is serialized by a single writer mutex (§5).

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use crate::error::{DDoSError, Result};
use crate::whitelist::SharedWhitelist;

const CHAIN: &str = "DDOS_PROTECTION";

/// Firewall effector contract (§6): exactly two externalized mutating
/// calls, plus chain lifecycle hooks the Blocklist drives at startup and
/// teardown.
pub trait FirewallEffector: Send + Sync {
    fn init(&self) -> Result<()>;
    fn teardown(&self) -> Result<()>;
    fn block(&self, addr: IpAddr) -> Result<()>;
    fn unblock(&self, addr: IpAddr) -> Result<()>;
}

/// Linux iptables effector: a dedicated chain hooked into INPUT, installed
/// at startup and torn down on shutdown.
pub struct IptablesEffector;

impl IptablesEffector {
    pub fn new() -> Self {
        Self
    }

    fn run(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("iptables")
            .args(args)
            .output()
            .map_err(|e| DDoSError::FirewallEffectorFailure(e.to_string()))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DDoSError::FirewallEffectorFailure(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    fn chain_exists(&self) -> bool {
        Command::new("iptables")
            .args(["-L", CHAIN, "-n"])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

impl Default for IptablesEffector {
    fn default() -> Self {
        Self::new()
    }
}

impl FirewallEffector for IptablesEffector {
    fn init(&self) -> Result<()> {
        if !self.chain_exists() {
            self.run(&["-N", CHAIN])?;
            self.run(&["-I", "INPUT", "-j", CHAIN])?;
            info!("installed {CHAIN} chain into INPUT");
        }
        Ok(())
    }

    fn teardown(&self) -> Result<()> {
        let _ = self.run(&["-D", "INPUT", "-j", CHAIN]);
        let _ = self.run(&["-F", CHAIN]);
        self.run(&["-X", CHAIN])
    }

    fn block(&self, addr: IpAddr) -> Result<()> {
        self.run(&["-A", CHAIN, "-s", &addr.to_string(), "-j", "DROP"])
    }

    fn unblock(&self, addr: IpAddr) -> Result<()> {
        self.run(&["-D", CHAIN, "-s", &addr.to_string(), "-j", "DROP"])
    }
}

#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub addr: IpAddr,
    pub attack_types: Vec<String>,
    pub expiry_time: SystemTime,
    pub block_count: u32,
}

impl BlockEntry {
    pub fn remaining(&self, now: SystemTime) -> Duration {
        self.expiry_time.duration_since(now).unwrap_or_default()
    }
}

struct Inner {
    entries: HashMap<IpAddr, BlockEntry>,
    expiry_index: BTreeMap<(SystemTime, u64), IpAddr>,
    index_of: HashMap<IpAddr, (SystemTime, u64)>,
    seq: u64,
}

pub struct Blocklist {
    inner: Mutex<Inner>,
    effector: Box<dyn FirewallEffector>,
    whitelist: SharedWhitelist,
    shutdown: AtomicBool,
    default_block_duration: Duration,
}

impl Blocklist {
    /// Constructed after the Whitelist so the dependency order Whitelist ->
    /// Blocklist -> Detector (§9) holds without back-references.
    pub fn new(effector: Box<dyn FirewallEffector>, whitelist: SharedWhitelist, default_block_duration: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                expiry_index: BTreeMap::new(),
                index_of: HashMap::new(),
                seq: 0,
            }),
            effector,
            whitelist,
            shutdown: AtomicBool::new(false),
            default_block_duration,
        }
    }

    pub fn start(&self) -> Result<()> {
        self.effector.init()
    }

    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.effector.teardown()
    }

    fn reindex(inner: &mut Inner, addr: IpAddr, expiry: SystemTime) {
        if let Some(old) = inner.index_of.remove(&addr) {
            inner.expiry_index.remove(&old);
        }
        inner.seq += 1;
        let idx = (expiry, inner.seq);
        inner.expiry_index.insert(idx, addr);
        inner.index_of.insert(addr, idx);
    }

    /// `Add(addr, attack_type, confidence, duration?)` (§4.6). Returns
    /// `Ok(false)` for whitelisted addresses or post-shutdown calls,
    /// matching the "no-op reporting success=false" policy of §7.
    pub fn add(&self, addr: IpAddr, attack_type: &str, duration: Option<Duration>, now: SystemTime) -> Result<bool> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self.whitelist.read().contains_ip(&addr) {
            debug!("refusing to block whitelisted address {addr}");
            return Ok(false);
        }

        let duration = duration.unwrap_or(self.default_block_duration);
        let new_expiry = now + duration;

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get_mut(&addr) {
            if new_expiry > existing.expiry_time {
                existing.expiry_time = new_expiry;
                let expiry = existing.expiry_time;
                Self::reindex(&mut inner, addr, expiry);
            }
            if !existing.attack_types.iter().any(|t| t == attack_type) {
                existing.attack_types.push(attack_type.to_string());
            }
            existing.block_count += 1;
            return Ok(true);
        }
        drop(inner);

        self.effector.block(addr)?;

        let mut inner = self.inner.lock();
        inner.entries.insert(
            addr,
            BlockEntry { addr, attack_types: vec![attack_type.to_string()], expiry_time: new_expiry, block_count: 1 },
        );
        Self::reindex(&mut inner, addr, new_expiry);
        Ok(true)
    }

    /// `Remove(addr)` (§4.6): idempotent.
    pub fn remove(&self, addr: IpAddr) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&addr) {
            return Ok(false);
        }

        match self.effector.unblock(addr) {
            Ok(()) => {
                inner.entries.remove(&addr);
                if let Some(idx) = inner.index_of.remove(&addr) {
                    inner.expiry_index.remove(&idx);
                }
                Ok(true)
            }
            Err(e) => {
                warn!("failed to unblock {addr}, retaining state for retry: {e}");
                Err(e)
            }
        }
    }

    /// `List()` (§4.6): snapshot with remaining TTL.
    pub fn list(&self, now: SystemTime) -> Vec<(IpAddr, Vec<String>, Duration, u32)> {
        let inner = self.inner.lock();
        inner
            .entries
            .values()
            .map(|e| (e.addr, e.attack_types.clone(), e.remaining(now), e.block_count))
            .collect()
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.inner.lock().entries.contains_key(addr)
    }

    /// `Sweep()` (§4.6): called every 10s by the blocklist sweeper thread.
    /// Entries whose unblock fails are retained for the next sweep (§7).
    pub fn sweep(&self, now: SystemTime) -> usize {
        let expired_addrs: Vec<IpAddr> = {
            let inner = self.inner.lock();
            inner
                .expiry_index
                .range(..(now, u64::MAX))
                .map(|(_, addr)| *addr)
                .collect()
        };

        let mut removed = 0;
        for addr in expired_addrs {
            match self.effector.unblock(addr) {
                Ok(()) => {
                    let mut inner = self.inner.lock();
                    inner.entries.remove(&addr);
                    if let Some(idx) = inner.index_of.remove(&addr) {
                        inner.expiry_index.remove(&idx);
                    }
                    removed += 1;
                }
                Err(e) => {
                    error!("sweep failed to unblock {addr}, will retry next sweep: {e}");
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::whitelist::Whitelist;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockEffector {
        blocks: Mutex<Vec<IpAddr>>,
        unblocks: Mutex<Vec<IpAddr>>,
        fail_block: AtomicBool,
        fail_unblock_count: AtomicUsize,
    }

    impl FirewallEffector for MockEffector {
        fn init(&self) -> Result<()> {
            Ok(())
        }
        fn teardown(&self) -> Result<()> {
            Ok(())
        }
        fn block(&self, addr: IpAddr) -> Result<()> {
            if self.fail_block.load(Ordering::SeqCst) {
                return Err(DDoSError::FirewallEffectorFailure("mock failure".to_string()));
            }
            self.blocks.lock().push(addr);
            Ok(())
        }
        fn unblock(&self, addr: IpAddr) -> Result<()> {
            if self.fail_unblock_count.load(Ordering::SeqCst) > 0 {
                self.fail_unblock_count.fetch_sub(1, Ordering::SeqCst);
                return Err(DDoSError::FirewallEffectorFailure("mock failure".to_string()));
            }
            self.unblocks.lock().push(addr);
            Ok(())
        }
    }

    fn addr(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn whitelisted_address_is_never_added() {
        let whitelist = crate::whitelist::shared(Whitelist::from_entries(&["198.51.100.7".to_string()]));
        let bl = Blocklist::new(Box::new(MockEffector::default()), whitelist, Duration::from_secs(60));
        let added = bl.add(addr(198, 51, 100, 7), "SYN Flood", None, SystemTime::now()).unwrap();
        assert!(!added);
        assert!(!bl.contains(&addr(198, 51, 100, 7)));
    }

    #[test]
    fn repeat_add_extends_expiry_and_merges_attack_types() {
        let bl = Blocklist::new(Box::new(MockEffector::default()), crate::whitelist::shared(Whitelist::new()), Duration::from_secs(30));
        let now = SystemTime::now();
        bl.add(addr(10, 0, 0, 5), "SYN Flood", Some(Duration::from_secs(30)), now).unwrap();
        bl.add(addr(10, 0, 0, 5), "UDP Flood", Some(Duration::from_secs(60)), now + Duration::from_secs(10)).unwrap();
        let list = bl.list(now + Duration::from_secs(11));
        assert_eq!(list.len(), 1);
        let (_, types, remaining, count) = &list[0];
        assert_eq!(count, &2);
        assert!(types.contains(&"SYN Flood".to_string()));
        assert!(types.contains(&"UDP Flood".to_string()));
        assert!(*remaining >= Duration::from_secs(58));
    }

    #[test]
    fn sweep_removes_expired_entries_and_unblocks_once() {
        let bl = Blocklist::new(Box::new(MockEffector::default()), crate::whitelist::shared(Whitelist::new()), Duration::from_secs(5));
        let now = SystemTime::now();
        bl.add(addr(198, 51, 100, 7), "SYN Flood", Some(Duration::from_secs(5)), now).unwrap();
        let removed = bl.sweep(now + Duration::from_secs(6));
        assert_eq!(removed, 1);
        assert!(bl.list(now + Duration::from_secs(6)).is_empty());
    }

    #[test]
    fn failed_add_does_not_record_state() {
        let effector = MockEffector::default();
        effector.fail_block.store(true, Ordering::SeqCst);
        let bl = Blocklist::new(Box::new(effector), crate::whitelist::shared(Whitelist::new()), Duration::from_secs(30));
        let result = bl.add(addr(10, 0, 0, 9), "SYN Flood", None, SystemTime::now());
        assert!(result.is_err());
        assert!(!bl.contains(&addr(10, 0, 0, 9)));
    }

    #[test]
    fn block_then_unblock_restores_prior_snapshot() {
        let bl = Blocklist::new(Box::new(MockEffector::default()), crate::whitelist::shared(Whitelist::new()), Duration::from_secs(30));
        let before = bl.list(SystemTime::now());
        bl.add(addr(10, 0, 0, 9), "SYN Flood", None, SystemTime::now()).unwrap();
        bl.remove(addr(10, 0, 0, 9)).unwrap();
        let after = bl.list(SystemTime::now());
        assert_eq!(before.len(), after.len());
    }
}
