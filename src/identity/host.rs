//! Host header selection

use super::{AppidManager, IdentityError};
use std::sync::Arc;

/// Where the Host header comes from
pub enum HostManager {
    /// `<appid><suffix>`, rotating through the App-ID pool
    Appid {
        manager: Arc<AppidManager>,
        suffix: String,
    },
    /// Same host for every request
    Fixed(String),
    /// Host equals the SNI
    Sni,
}

impl HostManager {
    pub fn with_appids(manager: Arc<AppidManager>, suffix: impl Into<String>) -> Self {
        HostManager::Appid {
            manager,
            suffix: suffix.into(),
        }
    }

    pub fn fixed(host: impl Into<String>) -> Self {
        HostManager::Fixed(host.into())
    }

    /// Host header and App-ID for a connection using `sni`
    pub fn host_for(&self, sni: &str) -> Result<(String, Option<String>), IdentityError> {
        match self {
            HostManager::Appid { manager, suffix } => {
                let appid = manager.get_appid().ok_or(IdentityError::NoAppid)?;
                Ok((format!("{}{}", appid, suffix), Some(appid)))
            }
            HostManager::Fixed(host) => Ok((host.clone(), None)),
            HostManager::Sni => Ok((sni.to_string(), None)),
        }
    }

    pub fn appids(&self) -> Option<&Arc<AppidManager>> {
        match self {
            HostManager::Appid { manager, .. } => Some(manager),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes() {
        assert_eq!(
            HostManager::fixed("a.example").host_for("x.com").unwrap(),
            ("a.example".to_string(), None)
        );
        assert_eq!(
            HostManager::Sni.host_for("x.com").unwrap().0,
            "x.com"
        );
        assert!(HostManager::Sni.appids().is_none());
    }
}
