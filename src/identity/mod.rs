//! Disguise identity selection
//!
//! Every connection attempt gets a fresh [`Identity`]: the SNI shown on
//! the wire, the Host header the front routes on, and the App-ID baked into
//! that host when the front uses one.

mod appid;
mod host;
mod sni;

pub use appid::{AppidManager, AppidVerifier};
pub use host::HostManager;
pub use sni::SniManager;

use std::sync::Arc;
use thiserror::Error;

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("No App-ID available")]
    NoAppid,

    #[error("SNI corpus is empty")]
    EmptyCorpus,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Disguise for one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub sni: String,
    pub host: String,
    pub app_id: Option<String>,
}

/// Combines the SNI and Host selectors
pub struct IdentitySelector {
    sni: SniManager,
    hosts: HostManager,
}

impl IdentitySelector {
    pub fn new(sni: SniManager, hosts: HostManager) -> Self {
        Self { sni, hosts }
    }

    /// Fresh identity for a connection attempt
    pub fn next(&self) -> Result<Identity, IdentityError> {
        self.build(None, None)
    }

    /// Identity with optional overrides (prober, `check-ip`)
    pub fn build(&self, sni: Option<&str>, host: Option<&str>) -> Result<Identity, IdentityError> {
        let sni = match sni {
            Some(s) => s.to_string(),
            None => self.sni.get(),
        };

        let (host, app_id) = match host {
            Some(h) => (h.to_string(), None),
            None => self.hosts.host_for(&sni)?,
        };

        Ok(Identity { sni, host, app_id })
    }

    pub fn sni(&self) -> &SniManager {
        &self.sni
    }

    pub fn hosts(&self) -> &HostManager {
        &self.hosts
    }

    /// App-ID pool behind the host selector, if any
    pub fn appids(&self) -> Option<&Arc<AppidManager>> {
        self.hosts.appids()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_win() {
        let selector = IdentitySelector::new(SniManager::builtin(), HostManager::fixed("front.example"));

        let id = selector.build(Some("cdn.example.net"), Some("real.example")).unwrap();
        assert_eq!(id.sni, "cdn.example.net");
        assert_eq!(id.host, "real.example");
        assert_eq!(id.app_id, None);

        let id = selector.next().unwrap();
        assert_eq!(id.host, "front.example");
        assert!(!id.sni.is_empty());
    }

    #[test]
    fn test_appid_identity() {
        let appids = Arc::new(AppidManager::new(vec!["app1".into()], std::time::Duration::from_secs(60)));
        let selector = IdentitySelector::new(
            SniManager::builtin(),
            HostManager::with_appids(appids.clone(), ".appspot.com"),
        );

        let id = selector.next().unwrap();
        assert_eq!(id.host, "app1.appspot.com");
        assert_eq!(id.app_id.as_deref(), Some("app1"));

        appids.report_out_of_quota("app1");
        assert!(matches!(selector.next(), Err(IdentityError::NoAppid)));
    }
}
