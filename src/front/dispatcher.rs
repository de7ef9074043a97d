//! Front: a small pool of connections behind one `request()`

use super::{
    ConnectCreator, FrontConnection, FrontError, FrontRequester, HttpRequest, HttpResponse, HttpVersion,
};
use crate::config::FrontConfig;
use crate::ip::IpPool;
use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maintenance sweep period
const MAINTAIN_INTERVAL: Duration = Duration::from_secs(5);

/// Score penalty per in-flight request (ms)
const IN_FLIGHT_PENALTY_MS: u64 = 100;

/// Score assumed before any request completed (ms)
const DEFAULT_RTT_MS: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct FrontSettings {
    pub max_workers: usize,
    pub max_connecting: usize,
    pub request_retry: usize,
    pub idle_timeout: Duration,
    /// How long a request waits for a free connection
    pub get_worker_timeout: Duration,
    /// Consecutive failures after which the front reports no score
    pub max_continue_fail: u32,
    /// How long a failing front stays blocked
    pub block_window: Duration,
    pub user_agent: String,
}

impl FrontSettings {
    pub fn from_front(front: &FrontConfig) -> Self {
        Self {
            max_workers: front.max_workers.max(1),
            max_connecting: front.max_connecting.max(1),
            request_retry: front.request_retry.max(1),
            idle_timeout: front.idle_timeout(),
            get_worker_timeout: front.connect_timeout() * 2,
            max_continue_fail: 10,
            block_window: Duration::from_secs(60),
            user_agent: front.browser_profile().user_agent().to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct FrontStats {
    rtt_ms: Option<f64>,
    continue_fail_num: u32,
    last_fail_at: Option<Instant>,
    success: u64,
    fail: u64,
}

type WorkerList = Arc<Mutex<Vec<Arc<dyn FrontConnection>>>>;

fn lock_workers(workers: &WorkerList) -> MutexGuard<'_, Vec<Arc<dyn FrontConnection>>> {
    workers.lock().unwrap_or_else(|e| e.into_inner())
}

/// One disguise channel
pub struct Front {
    name: String,
    creator: Arc<ConnectCreator>,
    workers: WorkerList,
    connecting: Arc<Semaphore>,
    worker_added: Arc<Notify>,
    stats: Mutex<FrontStats>,
    settings: FrontSettings,
    cancel: CancellationToken,
}

impl Front {
    pub fn new(name: impl Into<String>, creator: ConnectCreator, settings: FrontSettings) -> Self {
        Self {
            name: name.into(),
            creator: Arc::new(creator),
            workers: Arc::new(Mutex::new(Vec::new())),
            connecting: Arc::new(Semaphore::new(settings.max_connecting)),
            worker_added: Arc::new(Notify::new()),
            stats: Mutex::new(FrontStats::default()),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn pool(&self) -> &Arc<IpPool> {
        self.creator.pool()
    }

    pub fn worker_count(&self) -> usize {
        lock_workers(&self.workers).len()
    }

    fn stats(&self) -> MutexGuard<'_, FrontStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Retire expired, idle and broken connections every few seconds
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let workers = Arc::clone(&self.workers);
        let cancel = self.cancel.clone();
        let idle_timeout = self.settings.idle_timeout;
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTAIN_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let retired = Self::sweep(&workers, idle_timeout, Instant::now());
                        if retired > 0 {
                            debug!("Front {} retired {} connections", name, retired);
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }

    fn sweep(workers: &WorkerList, idle_timeout: Duration, now: Instant) -> usize {
        let mut list = lock_workers(workers);
        let before = list.len();
        list.retain(|w| {
            if w.is_closed() {
                return false;
            }
            if w.in_flight() > 0 {
                return true;
            }
            if now >= w.info().life_end || now.duration_since(w.last_active()) >= idle_timeout {
                w.close();
                return false;
            }
            true
        });
        before - list.len()
    }

    /// Create a connection in the background (bounded by `max_connecting`)
    fn spawn_create(&self) {
        let Ok(permit) = Arc::clone(&self.connecting).try_acquire_owned() else {
            return;
        };
        let creator = Arc::clone(&self.creator);
        let workers = Arc::clone(&self.workers);
        let notify = Arc::clone(&self.worker_added);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let result = tokio::select! {
                r = creator.connect() => r,
                _ = cancel.cancelled() => return,
            };
            match result {
                Ok(conn) => {
                    lock_workers(&workers).push(conn);
                    notify.notify_waiters();
                }
                Err(e) => debug!("Background connect failed: {}", e),
            }
        });
    }

    /// Least loaded connection that can take a request
    fn pick_worker(&self) -> (Option<Arc<dyn FrontConnection>>, usize) {
        let mut list = lock_workers(&self.workers);
        list.retain(|w| !w.is_closed());
        let best = list
            .iter()
            .filter(|w| w.accepts_request())
            .min_by_key(|w| (w.in_flight(), w.info().handshake))
            .cloned();
        (best, list.len())
    }

    async fn get_worker(&self) -> Result<Arc<dyn FrontConnection>, FrontError> {
        let deadline = Instant::now() + self.settings.get_worker_timeout;

        loop {
            let notified = self.worker_added.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (best, count) = self.pick_worker();
            let connecting = self.settings.max_connecting - self.connecting.available_permits();
            let room = count + connecting < self.settings.max_workers;

            if let Some(worker) = best {
                // Busy HTTP/2 connection: grow in the background, use it meanwhile.
                if worker.in_flight() > 0 && room {
                    self.spawn_create();
                }
                return Ok(worker);
            }

            if room {
                if let Ok(_permit) = self.connecting.try_acquire() {
                    let conn = self.creator.connect().await?;
                    lock_workers(&self.workers).push(Arc::clone(&conn));
                    self.worker_added.notify_waiters();
                    if conn.accepts_request() {
                        return Ok(conn);
                    }
                    continue;
                }
            }

            if Instant::now() >= deadline {
                return Err(FrontError::Busy);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {}
                _ = self.cancel.cancelled() => return Err(FrontError::Closed),
            }
        }
    }

    fn record_success(&self, rtt: Duration) {
        let mut stats = self.stats();
        let sample = rtt.as_millis() as f64;
        stats.rtt_ms = Some(match stats.rtt_ms {
            Some(prev) => prev * 0.8 + sample * 0.2,
            None => sample,
        });
        stats.continue_fail_num = 0;
        stats.success += 1;
    }

    fn record_failure(&self) {
        let mut stats = self.stats();
        stats.continue_fail_num += 1;
        stats.last_fail_at = Some(Instant::now());
        stats.fail += 1;
    }

    /// Identity-level answer from the front; returns true if the request should be retried
    fn handle_rejection(&self, worker: &Arc<dyn FrontConnection>, status: u16) -> bool {
        let info = worker.info();
        match (status, &info.identity.app_id) {
            (404, Some(appid)) => {
                warn!("Front {}: App-ID {} not found", self.name, appid);
                if let Some(appids) = self.creator.identity().appids() {
                    appids.report_not_exist(appid);
                }
            }
            (503, Some(appid)) => {
                warn!("Front {}: App-ID {} out of quota", self.name, appid);
                if let Some(appids) = self.creator.identity().appids() {
                    appids.report_out_of_quota(appid);
                }
            }
            (404 | 503, None) => {
                warn!("Front {}: {} rejected with {}", self.name, info.ip, status);
                if let Err(e) = self.pool().report_failure(info.ip, true) {
                    debug!("Failure report for {}: {}", info.ip, e);
                }
            }
            _ => return false,
        }
        worker.close();
        true
    }

    /// Send a request, retrying across connections and IPs
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        mut headers: Vec<(String, String)>,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpResponse, FrontError> {
        if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("user-agent")) {
            headers.push(("User-Agent".to_string(), self.settings.user_agent.clone()));
        }
        let req = HttpRequest {
            method,
            path: path.to_string(),
            headers,
            body,
            timeout,
        };

        let attempts = self.settings.request_retry;
        let mut last = String::new();

        for attempt in 1..=attempts {
            if self.cancel.is_cancelled() {
                return Err(FrontError::Closed);
            }

            let worker = match self.get_worker().await {
                Ok(w) => w,
                Err(e @ (FrontError::Identity(_) | FrontError::Closed)) => {
                    self.record_failure();
                    return Err(e);
                }
                Err(e) => {
                    self.record_failure();
                    last = e.to_string();
                    continue;
                }
            };

            let started = Instant::now();
            match worker.request(req.clone()).await {
                Ok(response) => {
                    if self.handle_rejection(&worker, response.status) {
                        self.record_failure();
                        last = format!("status {}", response.status);
                        continue;
                    }
                    let rtt = started.elapsed();
                    let ip = worker.info().ip;
                    let latency = (worker.info().handshake + rtt) / 2;
                    if let Err(e) = self.pool().report_success(ip, latency) {
                        debug!("Success report for {}: {}", ip, e);
                    }
                    self.record_success(rtt);
                    return Ok(response);
                }
                Err(e) => {
                    debug!(
                        "Front {} attempt {}/{} on {} failed: {}",
                        self.name,
                        attempt,
                        attempts,
                        worker.peer_label(),
                        e
                    );
                    // An HTTP/2 worker that is still open only lost this stream.
                    let stream_only = worker.version() == HttpVersion::Http2 && !worker.is_closed();
                    if !stream_only {
                        worker.close();
                        let ip = worker.info().ip;
                        if let Err(report) = self.pool().report_failure(ip, false) {
                            debug!("Failure report for {}: {}", ip, report);
                        }
                    }
                    self.record_failure();
                    last = e.to_string();
                }
            }
        }

        Err(FrontError::RetryExhausted { attempts, last })
    }

    /// Lower is better; `None` while blocked
    pub fn score(&self) -> Option<u64> {
        let (rtt, blocked) = {
            let stats = self.stats();
            let blocked = stats.continue_fail_num > self.settings.max_continue_fail
                && stats
                    .last_fail_at
                    .is_some_and(|at| at.elapsed() < self.settings.block_window);
            (stats.rtt_ms.unwrap_or(DEFAULT_RTT_MS), blocked)
        };
        if blocked {
            return None;
        }

        let in_flight: usize = lock_workers(&self.workers).iter().map(|w| w.in_flight()).sum();
        Some(rtt as u64 + in_flight as u64 * IN_FLIGHT_PENALTY_MS)
    }

    pub fn status(&self) -> String {
        let stats = self.stats();
        let workers = lock_workers(&self.workers);
        let mut out = format!(
            "front {}: workers {}, ok {}, fail {}, continue_fail {}, rtt {:.0}ms\n",
            self.name,
            workers.len(),
            stats.success,
            stats.fail,
            stats.continue_fail_num,
            stats.rtt_ms.unwrap_or(0.0)
        );
        for w in workers.iter() {
            out.push_str(&format!(
                "  {} in_flight={} processed={}\n",
                w.peer_label(),
                w.in_flight(),
                w.processed()
            ));
        }
        out.push_str("  ");
        out.push_str(&self.pool().status());
        out
    }

    /// Close every connection and stop background tasks
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let workers: Vec<_> = lock_workers(&self.workers).drain(..).collect();
        for w in &workers {
            w.close();
        }
        info!("Front {} closed ({} connections)", self.name, workers.len());
    }
}

#[async_trait]
impl FrontRequester for Front {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self) -> Option<u64> {
        Front::score(self)
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        headers: Vec<(String, String)>,
        body: Bytes,
        timeout: Duration,
    ) -> Result<HttpResponse, FrontError> {
        Front::request(self, method, path, headers, body, timeout).await
    }

    fn status(&self) -> String {
        Front::status(self)
    }

    fn close(&self) {
        Front::close(self)
    }
}
