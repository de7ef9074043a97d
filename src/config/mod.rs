//! Configuration management

use crate::crypto::EncryptMethod;
use crate::transport::BrowserProfile;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Remote server login
    pub session: SessionConfig,
    /// Reliable transport knobs
    pub tunnel: TunnelConfig,
    /// One entry per disguise channel
    pub fronts: Vec<FrontConfig>,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject combinations the session cannot run with
    pub fn validate(&self) -> Result<(), crate::Error> {
        let t = &self.tunnel;

        if self.fronts.is_empty() {
            return Err(crate::Error::Config("at least one [[fronts]] entry is required".into()));
        }
        if t.max_payload == 0 {
            return Err(crate::Error::Config("tunnel.max_payload must be > 0".into()));
        }
        // Ack batching must settle before the resend sweep fires.
        if t.resend_timeout_ms <= t.ack_delay_ms {
            return Err(crate::Error::Config(format!(
                "tunnel.resend_timeout_ms ({}) must exceed tunnel.ack_delay_ms ({})",
                t.resend_timeout_ms, t.ack_delay_ms
            )));
        }
        if t.concurent_thread_num == 0 || t.concurent_thread_num < t.min_on_road {
            return Err(crate::Error::Config(
                "tunnel.concurent_thread_num must be >= tunnel.min_on_road and > 0".into(),
            ));
        }
        if t.max_retry == 0 {
            return Err(crate::Error::Config("tunnel.max_retry must be > 0".into()));
        }
        if t.encrypt_data {
            t.encrypt_method
                .parse::<EncryptMethod>()
                .map_err(|e| crate::Error::Config(e.to_string()))?;
            if t.encrypt_password.is_empty() {
                return Err(crate::Error::Config(
                    "tunnel.encrypt_password is required when encrypt_data is set".into(),
                ));
            }
        }

        for front in &self.fronts {
            if front.name.is_empty() {
                return Err(crate::Error::Config("front name must not be empty".into()));
            }
            if front.ip_ranges.is_empty() && front.ip_range_file.is_none() {
                return Err(crate::Error::Config(format!(
                    "front {}: ip_ranges or ip_range_file is required",
                    front.name
                )));
            }
            if front.max_workers == 0 {
                return Err(crate::Error::Config(format!(
                    "front {}: max_workers must be > 0",
                    front.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a front by name
    pub fn front(&self, name: &str) -> Option<&FrontConfig> {
        self.fronts.iter().find(|f| f.name == name)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Remote server login
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Host header used on the fronted `/data` endpoint
    pub server_host: String,
    pub login_account: String,
    pub login_password: String,
    /// Give up establishing a session after this long
    pub login_timeout_secs: u64,
    /// Close the session after this long without a successful roundtrip
    pub max_silence_secs: u64,
    /// Pause before a fresh login after a failed one
    pub reconnect_delay_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_host: String::new(),
            login_account: String::new(),
            login_password: String::new(),
            login_timeout_secs: 30,
            max_silence_secs: 300,
            reconnect_delay_secs: 5,
        }
    }
}

impl SessionConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn max_silence(&self) -> Duration {
        Duration::from_secs(self.max_silence_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Reliable transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Bytes per block
    pub max_payload: usize,
    /// Concurrent roundtrip workers
    pub concurent_thread_num: usize,
    /// Requests kept outstanding while streams are open
    pub min_on_road: usize,
    /// Session window = max_payload * concurent_thread_num * window_multiplier
    pub window_multiplier: usize,
    /// Per-stream flow control window (bytes)
    pub windows_size: u32,
    /// Per-stream ack threshold (bytes consumed before an ack is sent)
    pub windows_ack: u32,
    pub send_delay_ms: u64,
    pub resend_timeout_ms: u64,
    pub ack_delay_ms: u64,
    pub max_retry: u32,
    /// Long-poll hold time requested from the server
    pub roundtrip_timeout_secs: u64,
    pub network_timeout_secs: u64,
    pub server_time_max_deviation_ms: u64,
    pub server_download_timeout_retry_secs: u64,
    pub encrypt_data: bool,
    pub encrypt_method: String,
    pub encrypt_password: String,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            max_payload: 128 * 1024,
            concurent_thread_num: 20,
            min_on_road: 1,
            window_multiplier: 2,
            windows_size: 16 * 1024 * 1024,
            windows_ack: 3 * 1024 * 1024,
            send_delay_ms: 10,
            resend_timeout_ms: 5000,
            ack_delay_ms: 300,
            max_retry: 10,
            roundtrip_timeout_secs: 15,
            network_timeout_secs: 10,
            server_time_max_deviation_ms: 600,
            server_download_timeout_retry_secs: 4,
            encrypt_data: false,
            encrypt_method: "chacha20-poly1305".to_string(),
            encrypt_password: String::new(),
        }
    }
}

impl TunnelConfig {
    /// Session-level send window in bytes
    pub fn window_size(&self) -> usize {
        self.max_payload
            .saturating_mul(self.concurent_thread_num)
            .saturating_mul(self.window_multiplier.max(1))
    }

    pub fn send_delay(&self) -> Duration {
        Duration::from_millis(self.send_delay_ms)
    }

    pub fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout_ms)
    }

    pub fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms)
    }

    pub fn roundtrip_timeout(&self) -> Duration {
        Duration::from_secs(self.roundtrip_timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn server_time_max_deviation(&self) -> Duration {
        Duration::from_millis(self.server_time_max_deviation_ms)
    }

    pub fn server_download_timeout_retry(&self) -> Duration {
        Duration::from_secs(self.server_download_timeout_retry_secs)
    }
}

/// One disguise channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontConfig {
    pub name: String,
    pub port: u16,
    /// Inline range entries (CIDR, `a-b`, single address or `a.b.c.` prefix)
    pub ip_ranges: Vec<String>,
    pub ip_range_file: Option<String>,
    /// Fixed SNI list; generated names are used when empty
    pub sni_list: Vec<String>,
    /// Word corpus for generated SNI names
    pub sni_words_file: Option<String>,
    pub appids: Vec<String>,
    /// Appended to an appid to form the Host header (e.g. `.appspot.com`)
    pub host_suffix: String,
    /// Fixed Host header for fronts without appids
    pub host: Option<String>,
    /// Name the server certificate is verified against instead of the SNI
    pub cert_name: Option<String>,
    /// TLS fingerprint profile (chrome, firefox, safari, edge, random)
    pub tls_profile: String,
    pub check_ip_path: String,
    pub check_ip_content: Option<String>,
    pub check_ip_accept_status: Vec<u16>,

    pub max_workers: usize,
    pub max_connecting: usize,
    pub http2_target_concurrent: usize,
    pub connection_max_life_secs: u64,
    pub idle_timeout_secs: u64,
    pub request_retry: usize,
    pub connect_attempts: usize,
    pub connect_timeout_secs: u64,

    pub max_failures: u32,
    pub refill_cooldown_secs: u64,
    pub max_pool_size: usize,
    pub get_ip_max_wait_secs: u64,
    pub failure_quarantine_secs: u64,
    pub min_good_ips: usize,
    pub scan_interval_secs: u64,
    pub appid_reset_secs: u64,
}

impl Default for FrontConfig {
    fn default() -> Self {
        Self {
            name: "front".to_string(),
            port: 443,
            ip_ranges: Vec::new(),
            ip_range_file: None,
            sni_list: Vec::new(),
            sni_words_file: None,
            appids: Vec::new(),
            host_suffix: ".appspot.com".to_string(),
            host: None,
            cert_name: None,
            tls_profile: "chrome".to_string(),
            check_ip_path: "/_gh/".to_string(),
            check_ip_content: None,
            check_ip_accept_status: vec![200],
            max_workers: 16,
            max_connecting: 4,
            http2_target_concurrent: 60,
            connection_max_life_secs: 600,
            idle_timeout_secs: 230,
            request_retry: 3,
            connect_attempts: 5,
            connect_timeout_secs: 5,
            max_failures: 3,
            refill_cooldown_secs: 20,
            max_pool_size: 1000,
            get_ip_max_wait_secs: 60,
            failure_quarantine_secs: 120,
            min_good_ips: 10,
            scan_interval_secs: 10,
            appid_reset_secs: 600,
        }
    }
}

impl FrontConfig {
    /// Get the browser profile from the tls_profile string
    pub fn browser_profile(&self) -> BrowserProfile {
        BrowserProfile::from_name(&self.tls_profile)
    }

    /// All inline range entries joined in the range-file syntax
    pub fn inline_ranges(&self) -> String {
        self.ip_ranges.join("\n")
    }

    pub fn connection_max_life(&self) -> Duration {
        Duration::from_secs(self.connection_max_life_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn refill_cooldown(&self) -> Duration {
        Duration::from_secs(self.refill_cooldown_secs)
    }

    pub fn get_ip_max_wait(&self) -> Duration {
        Duration::from_secs(self.get_ip_max_wait_secs)
    }

    pub fn failure_quarantine(&self) -> Duration {
        Duration::from_secs(self.failure_quarantine_secs)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn appid_reset(&self) -> Duration {
        Duration::from_secs(self.appid_reset_secs)
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        logging: LoggingConfig::default(),
        session: SessionConfig {
            server_host: "tunnel.example.com".to_string(),
            login_account: "user@example.com".to_string(),
            login_password: "change-me".to_string(),
            ..SessionConfig::default()
        },
        tunnel: TunnelConfig::default(),
        fronts: vec![
            FrontConfig {
                name: "gae".to_string(),
                ip_ranges: vec!["142.250.0.0/15".to_string(), "172.217.0.0/16".to_string()],
                appids: vec!["xxnet-1".to_string(), "xxnet-2".to_string()],
                cert_name: Some("www.google.com".to_string()),
                ..FrontConfig::default()
            },
            FrontConfig {
                name: "cdn".to_string(),
                ip_ranges: vec!["104.16.0.0-104.16.255.255".to_string()],
                host: Some("tunnel.example.com".to_string()),
                host_suffix: String::new(),
                check_ip_path: "/".to_string(),
                ..FrontConfig::default()
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_config_roundtrips_through_toml() {
        let config = generate_example_config();
        config.validate().expect("example config should be valid");

        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();

        assert_eq!(parsed.fronts.len(), 2);
        assert_eq!(parsed.fronts[0].appids, vec!["xxnet-1", "xxnet-2"]);
        assert_eq!(parsed.tunnel.max_payload, config.tunnel.max_payload);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let text = r#"
            [session]
            login_account = "a"

            [[fronts]]
            name = "direct"
            ip_ranges = ["10.0.0.1"]
        "#;
        let config: Config = toml::from_str(text).unwrap();
        config.validate().unwrap();

        assert_eq!(config.tunnel.concurent_thread_num, 20);
        assert_eq!(config.fronts[0].port, 443);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_resend_timeout_must_exceed_ack_delay() {
        let mut config = generate_example_config();
        config.tunnel.ack_delay_ms = 5000;
        config.tunnel.resend_timeout_ms = 5000;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("resend_timeout_ms"));
    }

    #[test]
    fn test_encryption_requires_password() {
        let mut config = generate_example_config();
        config.tunnel.encrypt_data = true;
        assert!(config.validate().is_err());

        config.tunnel.encrypt_password = "secret".into();
        config.validate().unwrap();

        config.tunnel.encrypt_method = "rot13".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_size_derivation() {
        let tunnel = TunnelConfig {
            max_payload: 1000,
            concurent_thread_num: 4,
            window_multiplier: 2,
            ..TunnelConfig::default()
        };
        assert_eq!(tunnel.window_size(), 8000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = generate_example_config();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.session.login_account, "user@example.com");
        assert!(loaded.front("cdn").is_some());
    }
}
