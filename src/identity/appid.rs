//! App-ID rotation
//!
//! App-IDs move between four sets: working, out of quota, pending
//! verification and not existing. Quota exhaustion is temporary; once every
//! App-ID has been out of quota for long enough the quota set is released
//! back into rotation.

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Checks whether a suspect App-ID really is gone
#[async_trait]
pub trait AppidVerifier: Send + Sync {
    async fn verify(&self, appid: &str) -> bool;
}

#[derive(Default)]
struct AppidState {
    working: Vec<String>,
    out_of_quota: HashSet<String>,
    pending_verify: HashSet<String>,
    not_exist: HashSet<String>,
    /// When the working set last ran dry
    exhausted_at: Option<Instant>,
}

/// Pool of App-IDs shared by every connection of a front
pub struct AppidManager {
    state: Mutex<AppidState>,
    reset_after: Duration,
    verifier: Mutex<Option<Arc<dyn AppidVerifier>>>,
}

impl AppidManager {
    pub fn new(appids: Vec<String>, reset_after: Duration) -> Self {
        let mut working = Vec::with_capacity(appids.len());
        for id in appids {
            if !id.is_empty() && !working.contains(&id) {
                working.push(id);
            }
        }

        Self {
            state: Mutex::new(AppidState {
                working,
                ..Default::default()
            }),
            reset_after,
            verifier: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AppidState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_verifier(&self, verifier: Arc<dyn AppidVerifier>) {
        *self.verifier.lock().unwrap_or_else(|e| e.into_inner()) = Some(verifier);
    }

    /// Random working App-ID, or `None` when all are spent
    pub fn get_appid(&self) -> Option<String> {
        let mut state = self.lock();

        if state.working.is_empty() {
            let now = Instant::now();
            match state.exhausted_at {
                Some(at) if now.duration_since(at) >= self.reset_after => {
                    Self::release_quota(&mut state);
                }
                Some(_) => {}
                None => state.exhausted_at = Some(now),
            }
        }

        state.working.choose(&mut rand::rng()).cloned()
    }

    fn release_quota(state: &mut AppidState) {
        let released: Vec<String> = state.out_of_quota.drain().collect();
        if !released.is_empty() {
            info!("Returning {} out-of-quota App-IDs to rotation", released.len());
        }
        state.working.extend(released);
        state.exhausted_at = None;
    }

    fn take_working(state: &mut AppidState, appid: &str) -> bool {
        match state.working.iter().position(|a| a == appid) {
            Some(pos) => {
                state.working.swap_remove(pos);
                if state.working.is_empty() {
                    state.exhausted_at = Some(Instant::now());
                }
                true
            }
            None => false,
        }
    }

    pub fn report_out_of_quota(&self, appid: &str) {
        let mut state = self.lock();
        if Self::take_working(&mut state, appid) {
            warn!("App-ID {} out of quota", appid);
            state.out_of_quota.insert(appid.to_string());
        }
    }

    /// The front answered 404 for this App-ID
    ///
    /// With a verifier the App-ID is parked and checked in the background;
    /// it returns to rotation if the check passes. Without one it is dropped
    /// immediately.
    pub fn report_not_exist(self: &Arc<Self>, appid: &str) {
        {
            let mut state = self.lock();
            if !Self::take_working(&mut state, appid) {
                return;
            }
            state.pending_verify.insert(appid.to_string());
        }

        let verifier = self
            .verifier
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let handle = tokio::runtime::Handle::try_current();
        match (verifier, handle) {
            (Some(verifier), Ok(handle)) => {
                let manager = Arc::clone(self);
                let appid = appid.to_string();
                handle.spawn(async move {
                    let exists = verifier.verify(&appid).await;
                    manager.finish_verify(&appid, exists);
                });
            }
            _ => self.finish_verify(appid, false),
        }
    }

    fn finish_verify(&self, appid: &str, exists: bool) {
        let mut state = self.lock();
        if !state.pending_verify.remove(appid) {
            return;
        }
        if exists {
            state.working.push(appid.to_string());
            state.exhausted_at = None;
        } else {
            warn!("App-ID {} does not exist, removing", appid);
            state.not_exist.insert(appid.to_string());
        }
    }

    /// Put every App-ID except the confirmed-missing ones back to work
    pub fn reset_appid(&self) {
        let mut state = self.lock();
        Self::release_quota(&mut state);
    }

    pub fn working_count(&self) -> usize {
        self.lock().working.len()
    }

    pub fn out_of_quota_count(&self) -> usize {
        self.lock().out_of_quota.len()
    }

    pub fn not_exist_count(&self) -> usize {
        self.lock().not_exist.len()
    }

    pub fn is_working(&self, appid: &str) -> bool {
        self.lock().working.iter().any(|a| a == appid)
    }
}
