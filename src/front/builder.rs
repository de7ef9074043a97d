//! Assemble a front from its `[[fronts]]` section

use super::{AppidProbe, ConnectCreator, Front, FrontSettings};
use crate::config::FrontConfig;
use crate::identity::{AppidManager, HostManager, IdentitySelector, SniManager};
use crate::ip::{IpPool, IpRangeSet, IpScanner, PoolConfig, Prober, ProberConfig, ScannerConfig};
use crate::transport::TlsProvider;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A front together with the pieces it was built from
pub struct FrontStack {
    pub front: Arc<Front>,
    pub pool: Arc<IpPool>,
    pub prober: Arc<Prober>,
    pub identity: Arc<IdentitySelector>,
    scanner_config: ScannerConfig,
}

impl FrontStack {
    pub fn build(config: &FrontConfig, tls: Arc<dyn TlsProvider>) -> Result<Self, crate::Error> {
        let mut source = IpRangeSet::parse(&config.inline_ranges())?;
        if let Some(path) = &config.ip_range_file {
            source = source.merge(&IpRangeSet::from_file(path)?);
        }
        if source.is_empty() {
            return Err(crate::Error::Config(format!(
                "front {} has no IP ranges",
                config.name
            )));
        }
        let pool = Arc::new(IpPool::new(&config.name, source, PoolConfig::from(config)));

        let sni = if !config.sni_list.is_empty() {
            SniManager::fixed(config.sni_list.clone())
        } else if let Some(path) = &config.sni_words_file {
            SniManager::from_file(path)?
        } else {
            SniManager::builtin()
        };

        let appids = (!config.appids.is_empty())
            .then(|| Arc::new(AppidManager::new(config.appids.clone(), config.appid_reset())));
        let hosts = match (&appids, &config.host) {
            (Some(manager), _) => HostManager::with_appids(manager.clone(), &config.host_suffix),
            (None, Some(host)) => HostManager::fixed(host),
            (None, None) => HostManager::Sni,
        };
        let identity = Arc::new(IdentitySelector::new(sni, hosts));

        let prober = Arc::new(Prober::new(
            tls.clone(),
            identity.clone(),
            ProberConfig::from_front(config),
        ));
        if let Some(manager) = &appids {
            manager.set_verifier(Arc::new(AppidProbe::new(
                prober.clone(),
                pool.clone(),
                &config.host_suffix,
            )));
        }

        let creator = ConnectCreator::new(pool.clone(), identity.clone(), tls, config);
        let front = Arc::new(Front::new(&config.name, creator, FrontSettings::from_front(config)));

        info!(
            "Front {} ready: {} addresses in range, {} appids",
            config.name,
            pool.source().len(),
            config.appids.len()
        );

        Ok(Self {
            front,
            pool,
            prober,
            identity,
            scanner_config: ScannerConfig::from_front(config),
        })
    }

    /// Connection maintenance plus the IP scanner, until `cancel` fires
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let scanner = IpScanner::new(
            self.pool.clone(),
            self.prober.clone(),
            self.scanner_config.clone(),
        );
        vec![
            self.front.spawn_maintenance(),
            tokio::spawn(scanner.run(cancel)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::FrontRequester;
    use crate::transport::PlainTcpProvider;

    fn front_config() -> FrontConfig {
        FrontConfig {
            name: "gae".into(),
            ip_ranges: vec!["127.0.0.1".into()],
            appids: vec!["alpha".into(), "beta".into()],
            ..FrontConfig::default()
        }
    }

    #[tokio::test]
    async fn test_build_wires_appids() {
        let stack = FrontStack::build(&front_config(), Arc::new(PlainTcpProvider::http1())).unwrap();
        assert_eq!(stack.front.name(), "gae");
        assert_eq!(stack.pool.source().len(), 1);

        let identity = stack.identity.next().unwrap();
        assert!(identity.host.ends_with(".appspot.com"));
        assert_eq!(stack.identity.appids().unwrap().working_count(), 2);
    }

    #[tokio::test]
    async fn test_build_rejects_empty_ranges() {
        let config = FrontConfig {
            ip_ranges: Vec::new(),
            ..front_config()
        };
        assert!(FrontStack::build(&config, Arc::new(PlainTcpProvider::http1())).is_err());
    }
}
