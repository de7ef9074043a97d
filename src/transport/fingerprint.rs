//! Browser profiles
//!
//! A front connection should look like ordinary browser traffic at both
//! layers: the ClientHello (cipher order, ALPN) and the HTTP headers
//! (User-Agent). The profile ties the two together so they never disagree.

use rand::Rng;

/// Browser fingerprint profiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserProfile {
    /// Chrome 120+ on Windows/Mac/Linux
    #[default]
    Chrome,
    /// Firefox 121+ on Windows/Mac/Linux
    Firefox,
    /// Safari 17+ on macOS
    Safari,
    /// Microsoft Edge (Chromium-based)
    Edge,
    /// Random selection from profiles
    Random,
}

impl BrowserProfile {
    /// Parse a config name; unknown names fall back to Chrome
    pub fn from_name(name: &str) -> Self {
        match name.to_lowercase().as_str() {
            "chrome" => Self::Chrome,
            "firefox" => Self::Firefox,
            "safari" => Self::Safari,
            "edge" => Self::Edge,
            "random" => Self::Random,
            _ => Self::Chrome,
        }
    }

    /// Get a random concrete profile
    pub fn random() -> Self {
        match rand::rng().random_range(0..4u8) {
            0 => Self::Chrome,
            1 => Self::Firefox,
            2 => Self::Safari,
            _ => Self::Edge,
        }
    }

    /// Resolve `Random` once so TLS and HTTP layers agree
    pub fn resolve(self) -> Self {
        match self {
            Self::Random => Self::random(),
            p => p,
        }
    }

    /// Get the User-Agent string for this profile
    pub fn user_agent(&self) -> &'static str {
        match self {
            Self::Chrome | Self::Edge => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
            }
            Self::Firefox => {
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0"
            }
            Self::Safari => {
                "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15"
            }
            Self::Random => Self::random().user_agent(),
        }
    }

    /// Get ALPN protocols for this profile
    pub fn alpn_protocols(&self) -> Vec<Vec<u8>> {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agents() {
        assert!(BrowserProfile::Chrome.user_agent().contains("Chrome"));
        assert!(BrowserProfile::Firefox.user_agent().contains("Firefox"));
        assert!(BrowserProfile::Safari.user_agent().contains("Safari"));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(BrowserProfile::from_name("FireFox"), BrowserProfile::Firefox);
        assert_eq!(BrowserProfile::from_name("netscape"), BrowserProfile::Chrome);
        assert_ne!(BrowserProfile::Random.resolve(), BrowserProfile::Random);
    }
}
