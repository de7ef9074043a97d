//! IP pool manager
//!
//! One pool per front. State machine:
//! ```text
//! EMPTY -> POPULATED -> DEGRADED -> EMPTY (cooldown) -> POPULATED
//! ```
//! All state sits behind one `std::sync::Mutex`; no method holds it across
//! an `.await`, so network I/O never runs under the lock.

use super::{IpError, IpRangeSet};
use crate::config::FrontConfig;
use rand::seq::IndexedRandom;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Each consecutive failure adds this much to an IP's rate (ms)
const FAILURE_PENALTY_MS: u64 = 1000;

/// A single success never raises the latency estimate by more than this (ms)
const MAX_LATENCY_STEP_MS: u64 = 500;

/// Scored candidate address
#[derive(Debug, Clone)]
pub struct IpRecord {
    pub address: IpAddr,
    /// Merged source range the address was drawn from
    pub source_range: Option<String>,
    pub last_handshake_ms: u64,
    pub consecutive_failures: u32,
    pub last_used_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
    pub blacklisted: bool,
    pub success_count: u64,
}

impl IpRecord {
    fn new(address: IpAddr, source_range: Option<String>, handshake_ms: u64) -> Self {
        Self {
            address,
            source_range,
            last_handshake_ms: handshake_ms,
            consecutive_failures: 0,
            last_used_at: None,
            last_failure_at: None,
            blacklisted: false,
            success_count: 0,
        }
    }

    /// Lower is better
    pub fn rate(&self) -> u64 {
        self.last_handshake_ms
            .saturating_add(FAILURE_PENALTY_MS.saturating_mul(self.consecutive_failures as u64))
    }

    /// Sort key: measured addresses by rate, then unmeasured ones
    fn rank(&self) -> (bool, u64) {
        (self.success_count == 0, self.rate())
    }
}

/// Pool health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// No working addresses; callers wait for the cooldown
    Empty,
    Populated,
    /// Fewer than half of the last refill remain
    Degraded,
}

/// Pool tuning
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Consecutive failures before an address is evicted
    pub max_failures: u32,
    /// Minimum time between the pool emptying and a refill
    pub refill_cooldown: Duration,
    /// Cap on addresses taken from the static source per refill
    pub max_pool_size: usize,
    /// `get_ip` gives up after this long
    pub get_ip_max_wait: Duration,
    /// Evicted addresses are skipped by refills for this long
    pub failure_quarantine: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            refill_cooldown: Duration::from_secs(20),
            max_pool_size: 1000,
            get_ip_max_wait: Duration::from_secs(60),
            failure_quarantine: Duration::from_secs(120),
        }
    }
}

impl From<&FrontConfig> for PoolConfig {
    fn from(front: &FrontConfig) -> Self {
        Self {
            max_failures: front.max_failures.max(1),
            refill_cooldown: front.refill_cooldown(),
            max_pool_size: front.max_pool_size.max(1),
            get_ip_max_wait: front.get_ip_max_wait(),
            failure_quarantine: front.failure_quarantine(),
        }
    }
}

struct PoolInner {
    working: HashMap<IpAddr, IpRecord>,
    blacklist: HashSet<IpAddr>,
    /// Recently evicted, with eviction time
    evicted: HashMap<IpAddr, Instant>,
    last_refill_size: usize,
    emptied_at: Option<Instant>,
    state: PoolState,
}

impl PoolInner {
    /// Random choice among the fastest quarter
    fn pick(&mut self, now: Instant) -> Option<IpAddr> {
        let ip = {
            let mut candidates: Vec<&IpRecord> =
                self.working.values().filter(|r| !r.blacklisted).collect();
            if candidates.is_empty() {
                return None;
            }
            candidates.sort_by_key(|r| r.rank());
            let top = (candidates.len() / 4).max(1);
            candidates[..top].choose(&mut rand::rng())?.address
        };

        if let Some(record) = self.working.get_mut(&ip) {
            record.last_used_at = Some(now);
        }
        Some(ip)
    }

    fn refill(&mut self, name: &str, source: &IpRangeSet, config: &PoolConfig, now: Instant) -> usize {
        self.evicted
            .retain(|_, at| now.duration_since(*at) < config.failure_quarantine);

        let candidates: Vec<IpAddr> = source
            .sample(config.max_pool_size)
            .into_iter()
            .filter(|ip| !self.blacklist.contains(ip))
            .collect();
        let fresh: Vec<IpAddr> = candidates
            .iter()
            .copied()
            .filter(|ip| !self.evicted.contains_key(ip))
            .collect();

        // Everything failed recently: retry them rather than stay empty.
        let chosen = if fresh.is_empty() { candidates } else { fresh };

        let mut added = 0;
        for ip in chosen {
            self.evicted.remove(&ip);
            if !self.working.contains_key(&ip) {
                let range = source.range_of(ip).map(|r| r.to_string());
                self.working.insert(ip, IpRecord::new(ip, range, 0));
                added += 1;
            }
        }

        self.last_refill_size = self.working.len();
        if !self.working.is_empty() {
            self.emptied_at = None;
        }
        self.update_state(name);
        added
    }

    fn update_state(&mut self, name: &str) {
        let next = if self.working.is_empty() {
            PoolState::Empty
        } else if self.working.len() * 2 < self.last_refill_size {
            PoolState::Degraded
        } else {
            PoolState::Populated
        };

        if next != self.state {
            info!(pool = %name, from = ?self.state, to = ?next, size = self.working.len(), "IP pool state change");
            self.state = next;
        }
    }
}

/// Scored set of candidate IPs for one front
pub struct IpPool {
    name: String,
    source: IpRangeSet,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    /// Signalled whenever addresses are added outside a refill
    refilled: Notify,
}

impl IpPool {
    /// Create a pool and fill it from `source`
    pub fn new(name: impl Into<String>, source: IpRangeSet, config: PoolConfig) -> Self {
        let name = name.into();
        let mut inner = PoolInner {
            working: HashMap::new(),
            blacklist: HashSet::new(),
            evicted: HashMap::new(),
            last_refill_size: 0,
            emptied_at: None,
            state: PoolState::Empty,
        };
        let added = inner.refill(&name, &source, &config, Instant::now());
        debug!(pool = %name, added, source_size = %source.len(), "IP pool created");

        Self {
            name,
            source,
            config,
            inner: Mutex::new(inner),
            refilled: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &IpRangeSet {
        &self.source
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Candidate address, waiting out the refill cooldown when the pool is empty
    pub async fn get_ip(&self) -> Result<IpAddr, IpError> {
        let deadline = Instant::now() + self.config.get_ip_max_wait;

        loop {
            let notified = self.refilled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let ready_at = {
                let mut inner = self.lock();
                let now = Instant::now();
                if let Some(ip) = inner.pick(now) {
                    return Ok(ip);
                }

                let emptied_at = *inner.emptied_at.get_or_insert(now);
                let ready_at = emptied_at + self.config.refill_cooldown;
                if now >= ready_at {
                    let added = inner.refill(&self.name, &self.source, &self.config, now);
                    info!(pool = %self.name, added, "IP pool refilled after cooldown");
                    if let Some(ip) = inner.pick(now) {
                        return Ok(ip);
                    }
                    // Source had nothing usable; start another cooldown.
                    inner.emptied_at = Some(now);
                    now + self.config.refill_cooldown
                } else {
                    ready_at
                }
            };

            if Instant::now() >= deadline {
                warn!(pool = %self.name, "IP pool exhausted");
                return Err(IpError::PoolExhausted(self.name.clone()));
            }

            tokio::select! {
                _ = tokio::time::sleep_until(ready_at.min(deadline)) => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Candidate address without waiting
    pub fn try_get_ip(&self) -> Option<IpAddr> {
        self.lock().pick(Instant::now())
    }

    /// Lowest-rate address that has succeeded at least once
    pub fn best_ip(&self) -> Option<IpAddr> {
        self.lock()
            .working
            .values()
            .filter(|r| r.success_count > 0 && r.consecutive_failures == 0)
            .min_by_key(|r| r.rate())
            .map(|r| r.address)
    }

    /// Clear failures and fold in a new latency sample
    pub fn report_success(&self, ip: IpAddr, latency: Duration) -> Result<(), IpError> {
        let mut inner = self.lock();
        if inner.blacklist.contains(&ip) || inner.evicted.contains_key(&ip) {
            return Err(IpError::AlreadyRemoved(ip));
        }
        let record = inner.working.get_mut(&ip).ok_or(IpError::NotFound(ip))?;

        let sample = latency.as_millis() as u64;
        let previous = record.last_handshake_ms;
        record.last_handshake_ms = if previous == 0 || sample <= previous {
            sample
        } else {
            sample.min(previous + MAX_LATENCY_STEP_MS)
        };
        record.consecutive_failures = 0;
        record.success_count += 1;

        debug!(pool = %self.name, %ip, handshake_ms = record.last_handshake_ms, "IP success");
        Ok(())
    }

    /// Count a failure; returns whether the address was evicted
    pub fn report_failure(&self, ip: IpAddr, force_remove: bool) -> Result<bool, IpError> {
        let mut inner = self.lock();
        let now = Instant::now();
        if inner.blacklist.contains(&ip) || inner.evicted.contains_key(&ip) {
            return Err(IpError::AlreadyRemoved(ip));
        }

        let max_failures = self.config.max_failures;
        let record = inner.working.get_mut(&ip).ok_or(IpError::NotFound(ip))?;
        record.consecutive_failures += 1;
        record.last_failure_at = Some(now);
        let failures = record.consecutive_failures;

        if !force_remove && failures < max_failures {
            debug!(pool = %self.name, %ip, failures, "IP failure");
            return Ok(false);
        }

        inner.working.remove(&ip);
        inner.evicted.insert(ip, now);
        if inner.working.is_empty() {
            inner.emptied_at = Some(now);
        }
        inner.update_state(&self.name);

        warn!(pool = %self.name, %ip, failures, force_remove, remaining = inner.working.len(), "IP evicted");
        Ok(true)
    }

    /// User blacklist; the address never returns
    pub fn blacklist(&self, ip: IpAddr) {
        let mut inner = self.lock();
        inner.blacklist.insert(ip);
        if inner.working.remove(&ip).is_some() && inner.working.is_empty() {
            inner.emptied_at = Some(Instant::now());
        }
        inner.update_state(&self.name);
    }

    /// Insert a probed address (scanner); returns false if blacklisted
    pub fn add_ip(&self, ip: IpAddr, handshake: Duration) -> bool {
        {
            let mut inner = self.lock();
            if inner.blacklist.contains(&ip) {
                return false;
            }
            inner.evicted.remove(&ip);

            let handshake_ms = handshake.as_millis() as u64;
            let range = self.source.range_of(ip).map(|r| r.to_string());
            let record = inner
                .working
                .entry(ip)
                .or_insert_with(|| IpRecord::new(ip, range, handshake_ms));
            record.last_handshake_ms = handshake_ms;
            record.consecutive_failures = 0;
            record.success_count += 1;

            inner.emptied_at = None;
            inner.last_refill_size = inner.last_refill_size.max(inner.working.len());
            inner.update_state(&self.name);
        }
        self.refilled.notify_waiters();
        true
    }

    /// Rebuild from the static source now, ignoring the cooldown
    pub fn refill(&self) -> usize {
        let added = {
            let mut inner = self.lock();
            inner.refill(&self.name, &self.source, &self.config, Instant::now())
        };
        self.refilled.notify_waiters();
        added
    }

    pub fn state(&self) -> PoolState {
        self.lock().state
    }

    /// Addresses in the working list
    pub fn len(&self) -> usize {
        self.lock().working.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().working.is_empty()
    }

    /// Addresses with a recorded success and no outstanding failures
    pub fn good_count(&self) -> usize {
        self.lock()
            .working
            .values()
            .filter(|r| r.success_count > 0 && r.consecutive_failures == 0)
            .count()
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.lock().working.contains_key(&ip)
    }

    pub fn record(&self, ip: IpAddr) -> Option<IpRecord> {
        self.lock().working.get(&ip).cloned()
    }

    /// Working list sorted best first
    pub fn snapshot(&self) -> Vec<IpRecord> {
        let mut records: Vec<IpRecord> = self.lock().working.values().cloned().collect();
        records.sort_by_key(|r| r.rank());
        records
    }

    /// One-line summary for status output
    pub fn status(&self) -> String {
        let inner = self.lock();
        format!(
            "pool {}: {:?}, working {}, evicted {}, blacklisted {}",
            self.name,
            inner.state,
            inner.working.len(),
            inner.evicted.len(),
            inner.blacklist.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_of(text: &str, config: PoolConfig) -> IpPool {
        IpPool::new("test", IpRangeSet::parse(text).unwrap(), config)
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_eviction_after_threshold() {
        let pool = pool_of("10.0.0.1\n10.0.0.2\n10.0.0.3", PoolConfig::default());
        let bad = ip("10.0.0.2");

        assert!(!pool.report_failure(bad, false).unwrap());
        assert!(!pool.report_failure(bad, false).unwrap());
        assert!(pool.report_failure(bad, false).unwrap());

        assert!(!pool.contains(bad));
        assert!(pool.contains(ip("10.0.0.1")));
        assert!(pool.contains(ip("10.0.0.3")));
        assert!(matches!(
            pool.report_failure(bad, false),
            Err(IpError::AlreadyRemoved(_))
        ));
        assert!(matches!(
            pool.report_failure(ip("192.168.0.1"), false),
            Err(IpError::NotFound(_))
        ));
    }

    #[test]
    fn test_force_remove() {
        let pool = pool_of("10.0.0.1\n10.0.0.2", PoolConfig::default());
        assert!(pool.report_failure(ip("10.0.0.1"), true).unwrap());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_success_clears_failures_and_caps_latency_growth() {
        let pool = pool_of("10.0.0.1", PoolConfig::default());
        let addr = ip("10.0.0.1");

        pool.report_success(addr, Duration::from_millis(100)).unwrap();
        pool.report_failure(addr, false).unwrap();
        pool.report_success(addr, Duration::from_millis(2000)).unwrap();

        let record = pool.record(addr).unwrap();
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.last_handshake_ms, 600);

        pool.report_success(addr, Duration::from_millis(50)).unwrap();
        assert_eq!(pool.record(addr).unwrap().last_handshake_ms, 50);
    }

    #[test]
    fn test_pick_prefers_fast_addresses() {
        let pool = pool_of("10.0.0.0/29", PoolConfig::default());
        for (i, record) in pool.snapshot().iter().enumerate() {
            let latency = if record.address == ip("10.0.0.5") { 10 } else { 900 + i as u64 };
            pool.report_success(record.address, Duration::from_millis(latency)).unwrap();
        }

        // 8 addresses -> top quarter is 2; 10.0.0.5 is always among them.
        let mut seen = HashSet::new();
        for _ in 0..200 {
            seen.insert(pool.try_get_ip().unwrap());
        }
        assert!(seen.contains(&ip("10.0.0.5")));
        assert!(seen.len() <= 2);
        assert_eq!(pool.best_ip(), Some(ip("10.0.0.5")));
    }

    #[test]
    fn test_measured_address_outranks_unmeasured() {
        let pool = pool_of("10.0.0.0/29", PoolConfig::default());
        let fast = ip("10.0.0.5");
        pool.report_success(fast, Duration::from_millis(10)).unwrap();

        let picked = (0..200).filter(|_| pool.try_get_ip() == Some(fast)).count();
        assert!(picked > 50, "measured address picked {}/200", picked);
        assert_eq!(pool.snapshot()[0].address, fast);
        assert_eq!(pool.best_ip(), Some(fast));
    }

    #[test]
    fn test_state_transitions() {
        let config = PoolConfig {
            max_failures: 1,
            ..PoolConfig::default()
        };
        let pool = pool_of("10.0.0.1\n10.0.0.2\n10.0.0.3\n10.0.0.4", config);
        assert_eq!(pool.state(), PoolState::Populated);

        pool.report_failure(ip("10.0.0.1"), false).unwrap();
        pool.report_failure(ip("10.0.0.2"), false).unwrap();
        assert_eq!(pool.state(), PoolState::Populated);

        pool.report_failure(ip("10.0.0.3"), false).unwrap();
        assert_eq!(pool.state(), PoolState::Degraded);

        pool.report_failure(ip("10.0.0.4"), false).unwrap();
        assert_eq!(pool.state(), PoolState::Empty);
    }

    #[tokio::test]
    async fn test_exhaustion_waits_for_cooldown_then_refills() {
        tokio::time::pause();
        let config = PoolConfig {
            max_failures: 1,
            refill_cooldown: Duration::from_secs(20),
            ..PoolConfig::default()
        };
        let pool = pool_of("10.0.0.1\n10.0.0.2\n10.0.0.3", config);
        for addr in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            pool.report_failure(ip(addr), false).unwrap();
        }
        assert_eq!(pool.state(), PoolState::Empty);

        let started = Instant::now();
        let blocked = tokio::time::timeout(Duration::from_secs(5), pool.get_ip()).await;
        assert!(blocked.is_err(), "get_ip must block during cooldown");

        let got = pool.get_ip().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(20));
        assert!(pool.source().contains(got));
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.state(), PoolState::Populated);
    }

    #[tokio::test]
    async fn test_blacklisted_source_reports_exhausted() {
        tokio::time::pause();
        let config = PoolConfig {
            refill_cooldown: Duration::from_secs(5),
            get_ip_max_wait: Duration::from_secs(12),
            ..PoolConfig::default()
        };
        let pool = pool_of("10.0.0.1", config);
        pool.blacklist(ip("10.0.0.1"));

        let err = pool.get_ip().await.unwrap_err();
        assert!(matches!(err, IpError::PoolExhausted(_)));
    }

    #[tokio::test]
    async fn test_add_ip_wakes_waiters() {
        tokio::time::pause();
        let config = PoolConfig {
            refill_cooldown: Duration::from_secs(600),
            get_ip_max_wait: Duration::from_secs(900),
            ..PoolConfig::default()
        };
        let pool = std::sync::Arc::new(pool_of("10.0.0.1", config));
        pool.blacklist(ip("10.0.0.1"));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_ip().await })
        };
        tokio::task::yield_now().await;
        assert!(pool.add_ip(ip("10.9.9.9"), Duration::from_millis(80)));

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, ip("10.9.9.9"));
    }
}
