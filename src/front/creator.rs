//! Connection creation: pool IP + fresh identity + TLS

use super::{open_connection, FrontConnection, FrontError, Http2Settings};
use crate::config::FrontConfig;
use crate::identity::{AppidVerifier, IdentitySelector};
use crate::ip::{IpPool, ProbeError, Prober};
use crate::transport::{TlsProvider, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds labelled connections for one front
pub struct ConnectCreator {
    pool: Arc<IpPool>,
    identity: Arc<IdentitySelector>,
    tls: Arc<dyn TlsProvider>,
    port: u16,
    connect_timeout: Duration,
    max_attempts: usize,
    max_life: Duration,
    h2: Http2Settings,
}

impl ConnectCreator {
    pub fn new(
        pool: Arc<IpPool>,
        identity: Arc<IdentitySelector>,
        tls: Arc<dyn TlsProvider>,
        front: &FrontConfig,
    ) -> Self {
        Self {
            pool,
            identity,
            tls,
            port: front.port,
            connect_timeout: front.connect_timeout(),
            max_attempts: front.connect_attempts.max(1),
            max_life: front.connection_max_life(),
            h2: Http2Settings {
                max_concurrent: front.http2_target_concurrent,
                ..Http2Settings::default()
            },
        }
    }

    pub fn pool(&self) -> &Arc<IpPool> {
        &self.pool
    }

    pub fn identity(&self) -> &Arc<IdentitySelector> {
        &self.identity
    }

    /// Open a connection, trying a different IP after each failure
    pub async fn connect(&self) -> Result<Arc<dyn FrontConnection>, FrontError> {
        let mut last = String::from("no attempt made");

        for attempt in 1..=self.max_attempts {
            let ip = self.pool.get_ip().await?;
            // NoAppid surfaces immediately so the front can back off.
            let identity = self.identity.next()?;

            let session = match self
                .tls
                .connect_tls(ip, self.port, &identity.sni, self.connect_timeout)
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    // A certificate for someone else means this IP is not our front.
                    let force = matches!(&e, TransportError::Tls(m) if m.contains("certificate"));
                    debug!("Connect {} (sni {}) attempt {} failed: {}", ip, identity.sni, attempt, e);
                    if let Err(report) = self.pool.report_failure(ip, force) {
                        debug!("Failure report for {}: {}", ip, report);
                    }
                    last = e.to_string();
                    continue;
                }
            };

            let handshake = session.handshake;
            match open_connection(session, ip, self.port, identity, self.max_life, &self.h2).await {
                Ok(conn) => {
                    if let Err(e) = self.pool.report_success(ip, handshake) {
                        debug!("Success report for {}: {}", ip, e);
                    }
                    info!("Connected {} in {}ms", conn.peer_label(), handshake.as_millis());
                    return Ok(conn);
                }
                Err(e) => {
                    debug!("Protocol setup on {} failed: {}", ip, e);
                    if let Err(report) = self.pool.report_failure(ip, false) {
                        debug!("Failure report for {}: {}", ip, report);
                    }
                    last = e.to_string();
                }
            }
        }

        warn!("Giving up connecting after {} attempts: {}", self.max_attempts, last);
        Err(FrontError::ConnectFailed {
            attempts: self.max_attempts,
            last,
        })
    }
}

/// Re-checks a suspect App-ID over the best known IP
pub struct AppidProbe {
    prober: Arc<Prober>,
    pool: Arc<IpPool>,
    host_suffix: String,
}

impl AppidProbe {
    pub fn new(prober: Arc<Prober>, pool: Arc<IpPool>, host_suffix: impl Into<String>) -> Self {
        Self {
            prober,
            pool,
            host_suffix: host_suffix.into(),
        }
    }
}

#[async_trait]
impl AppidVerifier for AppidProbe {
    async fn verify(&self, appid: &str) -> bool {
        let Some(ip) = self.pool.best_ip().or_else(|| self.pool.try_get_ip()) else {
            // Cannot tell; keep it.
            return true;
        };

        let host = format!("{}{}", appid, self.host_suffix);
        match self.prober.check(ip, None, Some(&host), None, Vec::new()).await {
            Ok(result) => {
                result.connection.close();
                true
            }
            Err(ProbeError::BadStatus(404)) => false,
            Err(e) => {
                debug!("App-ID {} check via {} inconclusive: {}", appid, ip, e);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{AppidManager, HostManager, IdentityError, SniManager};
    use crate::ip::{IpRangeSet, PoolConfig};
    use crate::transport::PlainTcpProvider;
    use tokio::net::TcpListener;

    fn front(port: u16) -> FrontConfig {
        FrontConfig {
            port,
            connect_attempts: 3,
            connect_timeout_secs: 2,
            ..FrontConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_reports_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _keep = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let pool = Arc::new(IpPool::new(
            "t",
            IpRangeSet::parse("127.0.0.1").unwrap(),
            PoolConfig::default(),
        ));
        let identity = Arc::new(IdentitySelector::new(SniManager::builtin(), HostManager::Sni));
        let creator = ConnectCreator::new(
            pool.clone(),
            identity,
            Arc::new(PlainTcpProvider::http1()),
            &front(addr.port()),
        );

        let conn = creator.connect().await.unwrap();
        assert_eq!(conn.info().ip, addr.ip());
        assert_eq!(conn.info().identity.host, conn.info().identity.sni);
        assert_eq!(pool.good_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_failures_hit_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = Arc::new(IpPool::new(
            "t",
            IpRangeSet::parse("127.0.0.1").unwrap(),
            PoolConfig {
                max_failures: 10,
                ..PoolConfig::default()
            },
        ));
        let identity = Arc::new(IdentitySelector::new(SniManager::builtin(), HostManager::Sni));
        let creator = ConnectCreator::new(
            pool.clone(),
            identity,
            Arc::new(PlainTcpProvider::http1()),
            &front(addr.port()),
        );

        let err = creator.connect().await.err().unwrap();
        assert!(matches!(err, FrontError::ConnectFailed { attempts: 3, .. }));
        let record = pool.record(addr.ip()).unwrap();
        assert_eq!(record.consecutive_failures, 3);
    }

    #[tokio::test]
    async fn test_no_appid_is_immediate() {
        let appids = Arc::new(AppidManager::new(vec!["a".into()], Duration::from_secs(600)));
        appids.report_out_of_quota("a");

        let pool = Arc::new(IpPool::new(
            "t",
            IpRangeSet::parse("127.0.0.1").unwrap(),
            PoolConfig::default(),
        ));
        let identity = Arc::new(IdentitySelector::new(
            SniManager::builtin(),
            HostManager::with_appids(appids, ".appspot.com"),
        ));
        let creator = ConnectCreator::new(pool, identity, Arc::new(PlainTcpProvider::http1()), &front(1));

        let err = creator.connect().await.err().unwrap();
        assert!(matches!(err, FrontError::Identity(IdentityError::NoAppid)));
    }
}
