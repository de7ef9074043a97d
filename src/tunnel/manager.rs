//! Session manager: one live session, logged in on demand

use super::{SessionSettings, StreamHandle, TunnelError, TunnelSession};
use crate::config::Config;
use crate::crypto::{derive_block_key, Cipher, EncryptMethod};
use crate::front::FrontRequester;
use crate::protocol::{BlockCodec, EncryptedCodec, XTunnelCodec};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

/// Plain or sealed codec per `[tunnel]` settings
pub fn build_codec(config: &Config) -> Result<Arc<dyn BlockCodec>, crate::Error> {
    let tunnel = &config.tunnel;
    if !tunnel.encrypt_data {
        return Ok(Arc::new(XTunnelCodec::new()));
    }
    let method: EncryptMethod = tunnel.encrypt_method.parse()?;
    let key = derive_block_key(&tunnel.encrypt_password)?;
    let cipher = Cipher::new(method, &key)?;
    Ok(Arc::new(EncryptedCodec::new(XTunnelCodec::new(), cipher)))
}

struct Slot {
    session: Option<Arc<TunnelSession>>,
    /// Last failed login, for the reconnect delay
    failed_at: Option<(Instant, String)>,
}

/// Owns the active [`TunnelSession`]
///
/// A closed session (fatal error, silence, server forgot it) is replaced
/// by a fresh login on the next `open_stream`.
pub struct SessionManager {
    fronts: Vec<Arc<dyn FrontRequester>>,
    codec: Arc<dyn BlockCodec>,
    settings: SessionSettings,
    reconnect_delay: Duration,
    slot: Mutex<Slot>,
    stopped: AtomicBool,
}

impl SessionManager {
    pub fn new(
        fronts: Vec<Arc<dyn FrontRequester>>,
        codec: Arc<dyn BlockCodec>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            fronts,
            codec,
            settings,
            reconnect_delay: Duration::ZERO,
            slot: Mutex::new(Slot {
                session: None,
                failed_at: None,
            }),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        config: &Config,
        fronts: Vec<Arc<dyn FrontRequester>>,
    ) -> Result<Self, crate::Error> {
        let codec = build_codec(config)?;
        let settings = SessionSettings::from_config(&config.session, &config.tunnel);
        Ok(Self::new(fronts, codec, settings).with_reconnect_delay(config.session.reconnect_delay()))
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn fronts(&self) -> &[Arc<dyn FrontRequester>] {
        &self.fronts
    }

    /// The established session, logging in if there is none
    pub async fn session(&self) -> Result<Arc<TunnelSession>, TunnelError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(TunnelError::SessionClosed("manager stopped".into()));
        }

        let mut slot = self.slot.lock().await;
        if let Some(session) = &slot.session {
            if session.is_established() {
                return Ok(session.clone());
            }
            info!(
                session = session.session_id(),
                reason = session.close_reason().as_deref().unwrap_or("-"),
                "replacing closed session"
            );
            slot.session = None;
        }

        if let Some((at, reason)) = &slot.failed_at {
            if at.elapsed() < self.reconnect_delay {
                return Err(TunnelError::SessionClosed(format!(
                    "waiting to reconnect: {}",
                    reason
                )));
            }
        }

        let session = Arc::new(TunnelSession::new(
            self.fronts.clone(),
            self.codec.clone(),
            self.settings.clone(),
        )?);
        match session.login().await {
            Ok(()) => {
                slot.failed_at = None;
                slot.session = Some(session.clone());
                Ok(session)
            }
            Err(e) => {
                warn!(error = %e, "could not establish session");
                slot.failed_at = Some((Instant::now(), e.to_string()));
                Err(e)
            }
        }
    }

    /// The current session without logging in
    pub async fn current(&self) -> Option<Arc<TunnelSession>> {
        self.slot.lock().await.session.clone()
    }

    /// Open a stream to `host:port`, logging in first if needed
    pub async fn open_stream(&self, host: &str, port: u16) -> Result<StreamHandle, TunnelError> {
        let session = self.session().await?;
        match session.open_stream(host, port) {
            // Died between the check and the open: one fresh try
            Err(TunnelError::SessionClosed(_)) => self.session().await?.open_stream(host, port),
            other => other,
        }
    }

    pub async fn write(&self, handle: &StreamHandle, data: Bytes) -> Result<(), TunnelError> {
        handle.write(data).await
    }

    pub async fn read(&self, handle: &mut StreamHandle) -> Result<Option<Bytes>, TunnelError> {
        handle.read().await
    }

    /// Idempotent
    pub fn close(&self, handle: &StreamHandle) -> bool {
        handle.close()
    }

    pub async fn status(&self) -> String {
        match self.current().await {
            Some(session) => session.status(),
            None => {
                let mut out = "no session\n".to_string();
                for front in &self.fronts {
                    out.push_str(&format!("front {}\n", front.status()));
                }
                out
            }
        }
    }

    /// Close the session and every front
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.slot.lock().await.session.take();
        if let Some(session) = session {
            session.close();
            session.join().await;
        }
        for front in &self.fronts {
            front.close();
        }
        info!("session manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LoginRequest, SESSION_ID_LEN};

    fn login() -> LoginRequest {
        LoginRequest {
            session_id: [b'x'; SESSION_ID_LEN],
            max_payload: 1024,
            send_delay_ms: 10,
            windows_size: 4096,
            windows_ack: 1024,
            resend_timeout_ms: 5000,
            ack_delay_ms: 300,
            account: "user".into(),
            password: "pass".into(),
            extra_info: serde_json::json!({}),
        }
    }

    #[test]
    fn test_codec_follows_encrypt_setting() {
        let mut config = Config::default();
        let plain = build_codec(&config).unwrap().encode_login(&login()).unwrap();
        assert_eq!(plain[0], crate::protocol::MAGIC);

        config.tunnel.encrypt_data = true;
        config.tunnel.encrypt_password = "secret".into();
        let sealed = build_codec(&config).unwrap().encode_login(&login()).unwrap();
        assert!(sealed.len() > plain.len());

        config.tunnel.encrypt_method = "rot13".into();
        assert!(build_codec(&config).is_err());
    }

    #[tokio::test]
    async fn test_stopped_manager_refuses_streams() {
        let manager = SessionManager::new(
            Vec::new(),
            Arc::new(XTunnelCodec::new()),
            SessionSettings::default(),
        );
        assert!(matches!(
            manager.open_stream("example.com", 80).await,
            Err(TunnelError::NoFront)
        ));
        manager.stop().await;
        manager.stop().await;
        assert!(matches!(
            manager.open_stream("example.com", 80).await,
            Err(TunnelError::SessionClosed(_))
        ));
        assert_eq!(manager.status().await, "no session\n");
    }
}
