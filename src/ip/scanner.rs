//! Background pool top-up
//!
//! While a pool has fewer good addresses than wanted, random addresses
//! from its source ranges are probed and the working ones added with their
//! measured handshake time.

use super::{IpPool, Prober};
use crate::config::FrontConfig;
use futures::future::join_all;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub min_good_ips: usize,
    pub interval: Duration,
    /// Probes per scan round
    pub batch: usize,
}

impl ScannerConfig {
    pub fn from_front(front: &FrontConfig) -> Self {
        Self {
            min_good_ips: front.min_good_ips,
            interval: front.scan_interval(),
            batch: front.max_connecting.max(1) * 2,
        }
    }
}

pub struct IpScanner {
    pool: Arc<IpPool>,
    prober: Arc<Prober>,
    config: ScannerConfig,
}

impl IpScanner {
    pub fn new(pool: Arc<IpPool>, prober: Arc<Prober>, config: ScannerConfig) -> Self {
        Self { pool, prober, config }
    }

    /// One scan round; returns how many addresses were added
    pub async fn scan_once(&self) -> usize {
        let good = self.pool.good_count();
        if good >= self.config.min_good_ips {
            return 0;
        }

        let candidates: HashSet<IpAddr> = (0..self.config.batch)
            .filter_map(|_| self.pool.source().random_ip())
            .filter(|ip| self.pool.record(*ip).map_or(true, |r| r.success_count == 0))
            .collect();
        if candidates.is_empty() {
            return 0;
        }
        debug!(
            "Scanning {} addresses for pool {} ({} good)",
            candidates.len(),
            self.pool.name(),
            good
        );

        let probes = candidates
            .into_iter()
            .map(|ip| async move { (ip, self.prober.check(ip, None, None, None, Vec::new()).await) });

        let mut added = 0;
        for (ip, result) in join_all(probes).await {
            match result {
                Ok(found) => {
                    found.connection.close();
                    if self.pool.add_ip(ip, found.handshake) {
                        added += 1;
                    }
                }
                Err(e) => debug!("Scan of {} failed: {}", ip, e),
            }
        }

        if added > 0 {
            info!("Scanner added {} IPs to pool {}", added, self.pool.name());
        }
        added
    }

    /// Scan every `interval` until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.scan_once().await;
                }
                _ = cancel.cancelled() => break,
            }
        }
    }
}
