//! Tunnel session
//!
//! One login, then `concurent_thread_num` workers each loop: plan a
//! roundtrip under the session lock, run it against the best front outside
//! the lock, fold the response back in. A timer task drives the resend
//! sweep and the silence check.
//!
//! ```text
//! StreamHandle::write ─> Multiplexer ─> Segmenter ─> SendWindow ─┐
//!                                                                ├─ worker ─> FrontRequester
//! StreamHandle::read  <─ Multiplexer <─ records <─ RecvBuffer  <─┘
//! ```

use super::{
    Frame, FrameOutcome, Multiplexer, RecvBuffer, Segmenter, SendWindow, StreamEvent, TunnelError,
    COMMAND_HEADER_SIZE, FRAME_HEADER_SIZE,
};
use crate::config::{SessionConfig, TunnelConfig};
use crate::front::FrontRequester;
use crate::protocol::{
    BlockCodec, LoginRequest, RoundtripData, RoundtripRequest, RoundtripResponse,
    ServerErrorCode, HTTP_SERVER_DOWN, SESSION_ID_LEN,
};
use bytes::{Bytes, BytesMut};
use http::Method;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

const DATA_PATH: &str = "/data";

/// Roundtrips slower than this are counted as slow
const SLOW_ROUNDTRIP: Duration = Duration::from_secs(8);

const MAX_SELECTIVE_ACKS: usize = 4096;

const TARGET_STEP_UP: usize = 10;
const TARGET_STEP_DOWN: usize = 5;
/// Responses with at most this many data bytes lower the target
const SMALL_RESPONSE: usize = 200;

const LOGIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on an idle worker's sleep
const IDLE_WAIT: Duration = Duration::from_secs(5);

/// Session tuning, resolved from the config sections
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Routed to the tunnel server through the front as `X-Host`
    pub server_host: Option<String>,
    pub account: String,
    pub password: String,
    pub max_payload: usize,
    pub concurent_thread_num: usize,
    pub min_on_road: usize,
    /// Session send window (bytes)
    pub window_size: usize,
    /// Out-of-order bytes the receiver holds before refusing blocks
    pub recv_buffer_limit: usize,
    pub windows_size: u32,
    pub windows_ack: u32,
    pub send_delay: Duration,
    pub resend_timeout: Duration,
    pub ack_delay: Duration,
    pub max_retry: u32,
    pub roundtrip_timeout: Duration,
    pub network_timeout: Duration,
    pub server_time_max_deviation: Duration,
    pub server_download_timeout_retry: Duration,
    pub login_timeout: Duration,
    pub max_silence: Duration,
    pub first_sequence: u64,
}

impl SessionSettings {
    pub fn from_config(session: &SessionConfig, tunnel: &TunnelConfig) -> Self {
        Self {
            server_host: Some(session.server_host.clone()).filter(|h| !h.is_empty()),
            account: session.login_account.clone(),
            password: session.login_password.clone(),
            max_payload: tunnel.max_payload.max(1),
            concurent_thread_num: tunnel.concurent_thread_num.max(1),
            min_on_road: tunnel.min_on_road,
            window_size: tunnel.window_size(),
            recv_buffer_limit: tunnel.window_size(),
            windows_size: tunnel.windows_size,
            windows_ack: tunnel.windows_ack,
            send_delay: tunnel.send_delay(),
            resend_timeout: tunnel.resend_timeout(),
            ack_delay: tunnel.ack_delay(),
            max_retry: tunnel.max_retry.max(1),
            roundtrip_timeout: tunnel.roundtrip_timeout(),
            network_timeout: tunnel.network_timeout(),
            server_time_max_deviation: tunnel.server_time_max_deviation(),
            server_download_timeout_retry: tunnel.server_download_timeout_retry(),
            login_timeout: session.login_timeout(),
            max_silence: session.max_silence(),
            first_sequence: 1,
        }
    }

    /// Largest data command that still fits one block
    fn max_chunk(&self) -> usize {
        self.max_payload
            .saturating_sub(FRAME_HEADER_SIZE + COMMAND_HEADER_SIZE)
            .max(1)
    }

    fn headers(&self) -> Vec<(String, String)> {
        match &self.server_host {
            Some(host) => vec![("X-Host".to_string(), host.clone())],
            None => Vec::new(),
        }
    }

    fn target_cap(&self) -> usize {
        self.concurent_thread_num
            .saturating_sub(self.min_on_road)
            .max(self.min_on_road)
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default(), &TunnelConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    LoginPending,
    Established,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Init => "init",
            SessionState::LoginPending => "login-pending",
            SessionState::Established => "established",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Traffic counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub upload_bytes: u64,
    pub download_bytes: u64,
    pub roundtrips: u64,
    pub failures: u64,
    pub resends: u64,
    pub slow_roundtrips: u64,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A planned roundtrip
struct Plan {
    request: RoundtripRequest,
    sequences: Vec<u64>,
    carries_ack: bool,
    timeout: Duration,
}

enum Planned {
    Send(Plan),
    /// Nothing to do; look again at this instant or when notified
    Wait(Option<Instant>),
}

enum Exchange {
    Done(RoundtripData, Duration),
    Retry(String),
    Fatal(TunnelError),
}

/// State behind the session lock
struct Core {
    segmenter: Segmenter,
    window: SendWindow,
    recv: RecvBuffer,
    /// In-order bytes not yet parsed into records
    inbound: BytesMut,
    mux: Multiplexer,
    transfer_no: u32,
    on_road: usize,
    target_on_roads: usize,
    /// Data arrived that we have not acked yet
    ack_pending_since: Option<Instant>,
    last_success: Instant,
    /// Server clock minus ours (seconds)
    server_time_offset: f64,
    /// Best roundtrip seen when the offset was taken (seconds)
    server_time_deviation: f64,
    stats: TunnelStats,
    close_reason: Option<String>,
}

impl Core {
    fn new(s: &SessionSettings) -> Self {
        Self {
            segmenter: Segmenter::new(s.max_payload),
            window: SendWindow::with_start(s.first_sequence, s.window_size),
            recv: RecvBuffer::with_start(s.first_sequence, s.recv_buffer_limit),
            inbound: BytesMut::new(),
            mux: Multiplexer::new_client(s.windows_size, s.windows_ack),
            transfer_no: 0,
            on_road: 0,
            target_on_roads: 0,
            ack_pending_since: None,
            last_success: Instant::now(),
            server_time_offset: 0.0,
            server_time_deviation: f64::INFINITY,
            stats: TunnelStats::default(),
            close_reason: None,
        }
    }

    fn clock_trusted(&self, s: &SessionSettings) -> bool {
        self.server_time_deviation <= s.server_time_max_deviation.as_secs_f64()
    }

    /// Encode queued stream commands into the segmenter
    fn queue_frames(&mut self) -> bool {
        let frames = self.mux.take_send_queue();
        let queued = !frames.is_empty();
        for frame in frames {
            match frame.encode() {
                Ok(buf) => self.segmenter.push(buf.freeze()),
                Err(e) => warn!(stream_id = frame.stream_id, error = %e, "dropping stream command"),
            }
        }
        queued
    }

    fn raise_target(&mut self, s: &SessionSettings) {
        self.target_on_roads =
            (self.target_on_roads.max(s.min_on_road) + TARGET_STEP_UP).min(s.target_cap());
    }

    fn adjust_target(&mut self, s: &SessionSettings, data_len: usize) {
        if self.mux.stream_count() == 0 {
            self.target_on_roads = 0;
        } else if data_len >= s.max_payload {
            self.target_on_roads = (self.target_on_roads + TARGET_STEP_UP).min(s.target_cap());
        } else if data_len <= SMALL_RESPONSE {
            self.target_on_roads = self
                .target_on_roads
                .saturating_sub(TARGET_STEP_DOWN)
                .max(s.min_on_road);
        }
    }

    /// Move ready segments into the window
    fn fill_window(&mut self, s: &SessionSettings, now: Instant) {
        while self.segmenter.ready(now, s.send_delay) {
            let upper = s.max_payload.min(self.segmenter.queued());
            if !self.window.has_room(upper) {
                break;
            }
            let Some(payload) = self.segmenter.next_payload() else {
                break;
            };
            if let Err(e) = self.window.push(payload) {
                warn!(error = %e, "block did not fit the send window");
                break;
            }
        }
    }

    fn plan(&mut self, s: &SessionSettings, session_id: [u8; SESSION_ID_LEN], now: Instant) -> Planned {
        self.fill_window(s, now);

        let trusted = self.clock_trusted(s);
        let blocks = self.window.take_due(s.max_payload, now);
        let download_timeouts = if trusted {
            self.recv
                .download_timeout_list(now, s.server_download_timeout_retry)
        } else {
            Vec::new()
        };
        let forced = !blocks.is_empty()
            || !download_timeouts.is_empty()
            || self.on_road < self.target_on_roads;
        let ack_due_at = self.ack_pending_since.map(|t| t + s.ack_delay);
        let ack_due = ack_due_at.is_some_and(|at| now >= at);

        if !forced && !ack_due {
            let segment_due = if self.window.has_room(s.max_payload.min(self.segmenter.queued())) {
                self.segmenter.due_at(s.send_delay)
            } else {
                None
            };
            let wake = [ack_due_at, segment_due].into_iter().flatten().min();
            return Planned::Wait(wake);
        }

        let idle = s
            .concurent_thread_num
            .saturating_sub(self.on_road + 1);
        let long_poll = blocks.is_empty()
            && self.segmenter.queued() < s.max_payload
            && idle >= s.min_on_road
            && trusted;
        let server_timeout = if long_poll { s.roundtrip_timeout } else { Duration::ZERO };

        self.transfer_no = self.transfer_no.wrapping_add(1);
        self.on_road += 1;
        self.ack_pending_since = None;

        let data_len: usize = blocks.iter().map(|b| b.len()).sum();
        self.stats.upload_bytes += data_len as u64;
        let sequences = blocks.iter().map(|b| b.sequence).collect();

        Planned::Send(Plan {
            request: RoundtripRequest {
                session_id,
                transfer_no: self.transfer_no,
                server_timeout: server_timeout.as_secs().min(u8::MAX as u64) as u8,
                blocks,
                ack: Some(self.recv.ack_info(MAX_SELECTIVE_ACKS)),
                download_timeouts,
            },
            sequences,
            carries_ack: true,
            timeout: server_timeout + s.network_timeout,
        })
    }

    fn on_response(
        &mut self,
        s: &SessionSettings,
        data: RoundtripData,
        rtt: Duration,
        now: Instant,
    ) -> Result<FrameOutcome, TunnelError> {
        self.on_road = self.on_road.saturating_sub(1);
        self.stats.roundtrips += 1;
        if rtt > SLOW_ROUNDTRIP {
            self.stats.slow_roundtrips += 1;
        }

        let rtt_secs = rtt.as_secs_f64();
        if rtt_secs < self.server_time_deviation {
            self.server_time_offset = data.server_time - now_epoch();
            self.server_time_deviation = rtt_secs;
        }

        if let Some(ack) = &data.ack {
            self.window.apply(ack)?;
        }

        let mut data_len = 0;
        let got_blocks = !data.blocks.is_empty();
        for block in data.blocks {
            data_len += block.len();
            match self.recv.put(block.sequence, block.payload) {
                Ok(_) => {}
                Err(TunnelError::RecvOverflow) => {
                    debug!(sequence = block.sequence, "receive buffer full, block dropped");
                }
                Err(e) => return Err(e),
            }
        }
        if got_blocks && self.ack_pending_since.is_none() {
            self.ack_pending_since = Some(now);
        }
        self.stats.download_bytes += data_len as u64;

        for payload in self.recv.pop_ready() {
            self.inbound.extend_from_slice(&payload);
        }
        let mut outcome = FrameOutcome::default();
        while let Some(frame) = Frame::decode(&mut self.inbound)? {
            let o = self.mux.handle_frame(frame);
            outcome.window_opened |= o.window_opened;
            outcome.stream_removed |= o.stream_removed;
        }

        if self.clock_trusted(s) {
            let server_now = now_epoch() + self.server_time_offset;
            let retry = s.server_download_timeout_retry.as_secs_f64();
            for (sequence, sent_at) in &data.unacked_sent {
                if !self.recv.is_received(*sequence) && server_now - sent_at > retry {
                    self.recv.mark_download_timeout(*sequence);
                }
            }
        }

        self.adjust_target(s, data_len);
        self.last_success = now;
        Ok(outcome)
    }

    fn on_failure(&mut self, plan: &Plan, now: Instant) {
        self.on_road = self.on_road.saturating_sub(1);
        self.stats.failures += 1;
        let marked = self.window.mark_failed(&plan.sequences);
        self.stats.resends += marked as u64;
        if plan.carries_ack && self.ack_pending_since.is_none() {
            self.ack_pending_since = Some(now);
        }
    }
}

struct Shared {
    core: Mutex<Core>,
    settings: SessionSettings,
    session_id: [u8; SESSION_ID_LEN],
    fronts: Vec<Arc<dyn FrontRequester>>,
    codec: Arc<dyn BlockCodec>,
    /// Wakes roundtrip workers
    work: Notify,
    /// Wakes writers blocked on a stream window
    writable: Notify,
    state_tx: watch::Sender<SessionState>,
    cancel: CancellationToken,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn id_str(&self) -> &str {
        std::str::from_utf8(&self.session_id).unwrap_or("?")
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn closed_error(&self) -> TunnelError {
        let reason = self
            .core()
            .close_reason
            .clone()
            .unwrap_or_else(|| self.state().to_string());
        TunnelError::SessionClosed(reason)
    }

    fn ensure_established(&self, core: &Core) -> Result<(), TunnelError> {
        let state = self.state();
        if state == SessionState::Established {
            return Ok(());
        }
        Err(TunnelError::SessionClosed(
            core.close_reason.clone().unwrap_or_else(|| state.to_string()),
        ))
    }

    /// Front with the best score; the first one when all are blocked
    fn pick_front(&self) -> Option<Arc<dyn FrontRequester>> {
        self.fronts
            .iter()
            .filter_map(|f| f.score().map(|score| (score, f)))
            .min_by_key(|(score, _)| *score)
            .map(|(_, f)| f.clone())
            .or_else(|| self.fronts.first().cloned())
    }

    async fn login_once(&self, body: Bytes, timeout: Duration) -> Result<(), TunnelError> {
        let front = self.pick_front().ok_or(TunnelError::NoFront)?;
        let resp = front
            .request(Method::POST, DATA_PATH, self.settings.headers(), body, timeout)
            .await?;
        if resp.status == HTTP_SERVER_DOWN {
            return Err(TunnelError::ServerDown);
        }
        if resp.status != 200 {
            return Err(TunnelError::BadStatus(resp.status));
        }

        let login = self.codec.decode_login_response(&resp.body)?;
        if !login.is_success() {
            return Err(TunnelError::LoginFailed(login.message));
        }
        info!(session = self.id_str(), front = front.name(), message = %login.message, "login ok");
        Ok(())
    }

    async fn exchange(&self, plan: &Plan) -> Exchange {
        let body = match self.codec.encode_roundtrip(&plan.request) {
            Ok(body) => body,
            Err(e) => return Exchange::Fatal(e.into()),
        };
        let Some(front) = self.pick_front() else {
            return Exchange::Fatal(TunnelError::NoFront);
        };

        let path = format!("{}?tid={}", DATA_PATH, plan.request.transfer_no);
        let start = Instant::now();
        let result = tokio::time::timeout(
            plan.timeout,
            front.request(Method::POST, &path, self.settings.headers(), body, plan.timeout),
        )
        .await;

        let resp = match result {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => return Exchange::Retry(format!("{}: {}", front.name(), e)),
            Err(_) => return Exchange::Retry(format!("{}: timeout", front.name())),
        };
        if resp.status == HTTP_SERVER_DOWN {
            return Exchange::Fatal(TunnelError::ServerDown);
        }
        if resp.status != 200 {
            return Exchange::Retry(format!("{}: status {}", front.name(), resp.status));
        }

        match self.codec.decode_roundtrip(&resp.body) {
            Ok(RoundtripResponse::Data(data)) => Exchange::Done(data, start.elapsed()),
            Ok(RoundtripResponse::Error { code, message }) => match code {
                ServerErrorCode::NoQuota => Exchange::Fatal(TunnelError::NoQuota),
                ServerErrorCode::SessionNotExist => Exchange::Fatal(TunnelError::SessionNotExist),
                ServerErrorCode::Unpack | ServerErrorCode::Other(_) => {
                    Exchange::Retry(format!("server error {:?}: {}", code, message))
                }
            },
            Err(e) if e.is_transient() => Exchange::Retry(e.to_string()),
            Err(e) => Exchange::Fatal(e.into()),
        }
    }

    fn finish(&self, plan: Plan, exchange: Exchange) -> Result<(), TunnelError> {
        let now = Instant::now();
        let transfer_no = plan.request.transfer_no;
        let mut wake_writers = false;
        {
            let mut core = self.core();
            match exchange {
                Exchange::Done(data, rtt) => {
                    let (blocks_in, pool) = (data.blocks.len(), data.server_send_pool_size);
                    let outcome = core.on_response(&self.settings, data, rtt, now)?;
                    wake_writers = outcome.window_opened || outcome.stream_removed;
                    if rtt > SLOW_ROUNDTRIP {
                        warn!(transfer_no, rtt_ms = rtt.as_millis() as u64, "slow roundtrip");
                    }
                    trace!(
                        transfer_no,
                        blocks_out = plan.sequences.len(),
                        blocks_in,
                        server_pool = pool,
                        rtt_ms = rtt.as_millis() as u64,
                        on_road = core.on_road,
                        target = core.target_on_roads,
                        "roundtrip"
                    );
                }
                Exchange::Retry(reason) => {
                    debug!(transfer_no, blocks = plan.sequences.len(), reason = %reason, "roundtrip failed");
                    core.on_failure(&plan, now);
                }
                Exchange::Fatal(e) => return Err(e),
            }
            if let Some(seq) = core.window.exhausted(self.settings.max_retry) {
                return Err(TunnelError::RetryExhausted(seq));
            }
        }

        if wake_writers {
            self.writable.notify_waiters();
        }
        self.work.notify_waiters();
        Ok(())
    }

    /// Timer pass; returns true when blocks became due
    fn sweep(&self, now: Instant) -> Result<bool, TunnelError> {
        let mut core = self.core();
        let marked = core.window.sweep(now, self.settings.resend_timeout);
        if marked > 0 {
            core.stats.resends += marked as u64;
            debug!(marked, base = core.window.base(), "resend sweep");
        }
        if let Some(seq) = core.window.exhausted(self.settings.max_retry) {
            return Err(TunnelError::RetryExhausted(seq));
        }
        if now.duration_since(core.last_success) >= self.settings.max_silence {
            return Err(TunnelError::Silence(self.settings.max_silence));
        }
        Ok(marked > 0)
    }

    fn fail(&self, error: TunnelError) {
        if self.state() == SessionState::Established {
            error!(session = self.id_str(), error = %error, "session failed");
        }
        self.shutdown(&error.to_string(), true);
    }

    /// Move to Closing then Closed; false if already on the way
    fn shutdown(&self, reason: &str, failed: bool) -> bool {
        let first = self.state_tx.send_if_modified(|state| {
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });
        if !first {
            return false;
        }

        self.cancel.cancel();
        {
            let mut core = self.core();
            core.close_reason = Some(reason.to_string());
            if failed {
                core.mux.fail_all(reason);
            } else {
                core.mux.close_all(reason);
            }
            core.segmenter.clear();
        }
        self.writable.notify_waiters();
        self.work.notify_waiters();
        self.state_tx.send_replace(SessionState::Closed);
        info!(session = self.id_str(), reason, "session closed");
        true
    }
}

async fn roundtrip_worker(shared: Arc<Shared>, worker: usize) {
    trace!(worker, "roundtrip worker started");
    loop {
        let notified = shared.work.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.cancel.is_cancelled() {
            break;
        }
        let planned = shared
            .core()
            .plan(&shared.settings, shared.session_id, Instant::now());

        let plan = match planned {
            Planned::Send(plan) => plan,
            Planned::Wait(wake) => {
                let deadline = wake.unwrap_or_else(|| Instant::now() + IDLE_WAIT);
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = &mut notified => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                continue;
            }
        };

        let exchange = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            exchange = shared.exchange(&plan) => exchange,
        };
        if let Err(e) = shared.finish(plan, exchange) {
            shared.fail(e);
            break;
        }
    }
    trace!(worker, "roundtrip worker stopped");
}

async fn timer_task(shared: Arc<Shared>) {
    let s = &shared.settings;
    let tick = (s.ack_delay.min(s.resend_timeout) / 2)
        .clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match shared.sweep(Instant::now()) {
            Ok(true) => shared.work.notify_waiters(),
            Ok(false) => {}
            Err(e) => {
                shared.fail(e);
                break;
            }
        }
    }
}

/// Reliable session over a set of fronts
pub struct TunnelSession {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelSession {
    pub fn new(
        fronts: Vec<Arc<dyn FrontRequester>>,
        codec: Arc<dyn BlockCodec>,
        settings: SessionSettings,
    ) -> Result<Self, TunnelError> {
        if fronts.is_empty() {
            return Err(TunnelError::NoFront);
        }

        let mut session_id = [0u8; SESSION_ID_LEN];
        let random = crate::crypto::random_lowercase(SESSION_ID_LEN);
        session_id.copy_from_slice(&random.as_bytes()[..SESSION_ID_LEN]);

        let (state_tx, _) = watch::channel(SessionState::Init);
        let shared = Arc::new(Shared {
            core: Mutex::new(Core::new(&settings)),
            settings,
            session_id,
            fronts,
            codec,
            work: Notify::new(),
            writable: Notify::new(),
            state_tx,
            cancel: CancellationToken::new(),
        });
        Ok(Self {
            shared,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn session_id(&self) -> &str {
        self.shared.id_str()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_established(&self) -> bool {
        self.state() == SessionState::Established
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Why the session closed, once it has
    pub fn close_reason(&self) -> Option<String> {
        self.shared.core().close_reason.clone()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    /// Log in and start the workers
    ///
    /// Retried until `login_timeout`; server-down, bad credentials and
    /// `close()` abort at once.
    pub async fn login(&self) -> Result<(), TunnelError> {
        let started = self.shared.state_tx.send_if_modified(|state| {
            if *state == SessionState::Init {
                *state = SessionState::LoginPending;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(TunnelError::SessionClosed(format!(
                "login in state {}",
                self.state()
            )));
        }

        match self.login_loop().await {
            Ok(()) => {
                let established = self.shared.state_tx.send_if_modified(|state| {
                    if *state == SessionState::LoginPending {
                        *state = SessionState::Established;
                        true
                    } else {
                        false
                    }
                });
                if !established {
                    return Err(self.shared.closed_error());
                }
                self.shared.core().last_success = Instant::now();
                self.spawn_tasks();
                Ok(())
            }
            Err(e) => {
                warn!(session = self.session_id(), error = %e, "login failed");
                self.shared.shutdown(&e.to_string(), true);
                Err(e)
            }
        }
    }

    async fn login_loop(&self) -> Result<(), TunnelError> {
        let s = &self.shared.settings;
        let request = LoginRequest {
            session_id: self.shared.session_id,
            max_payload: s.max_payload.min(u32::MAX as usize) as u32,
            send_delay_ms: s.send_delay.as_millis().min(u16::MAX as u128) as u16,
            windows_size: s.windows_size,
            windows_ack: s.windows_ack,
            resend_timeout_ms: s.resend_timeout.as_millis().min(u16::MAX as u128) as u16,
            ack_delay_ms: s.ack_delay.as_millis().min(u16::MAX as u128) as u16,
            account: s.account.clone(),
            password: s.password.clone(),
            extra_info: serde_json::json!({
                "version": crate::VERSION,
                "system": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
            }),
        };
        let body = self.shared.codec.encode_login(&request)?;
        let deadline = Instant::now() + s.login_timeout;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let timeout = remaining.min(s.network_timeout).max(Duration::from_millis(1));
            let result = tokio::select! {
                _ = self.shared.cancel.cancelled() => {
                    return Err(TunnelError::SessionClosed("closed during login".into()));
                }
                r = self.shared.login_once(body.clone(), timeout) => r,
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    if Instant::now() + LOGIN_RETRY_DELAY >= deadline {
                        return Err(e);
                    }
                    debug!(attempt, error = %e, "login attempt failed");
                    tokio::select! {
                        _ = self.shared.cancel.cancelled() => {
                            return Err(TunnelError::SessionClosed("closed during login".into()));
                        }
                        _ = tokio::time::sleep(LOGIN_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }

    fn spawn_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for worker in 0..self.shared.settings.concurent_thread_num {
            tasks.push(tokio::spawn(roundtrip_worker(self.shared.clone(), worker)));
        }
        tasks.push(tokio::spawn(timer_task(self.shared.clone())));
        info!(
            session = self.session_id(),
            workers = self.shared.settings.concurent_thread_num,
            "session established"
        );
    }

    /// Open a stream to `host:port`
    pub fn open_stream(&self, host: &str, port: u16) -> Result<StreamHandle, TunnelError> {
        if host.is_empty() || host.len() > u16::MAX as usize {
            return Err(TunnelError::InvalidFrame(format!("bad host {:?}", host)));
        }
        let (stream_id, events) = {
            let mut core = self.shared.core();
            self.shared.ensure_established(&core)?;
            let opened = core.mux.open_stream(host, port)?;
            core.queue_frames();
            core.raise_target(&self.shared.settings);
            opened
        };
        self.shared.work.notify_waiters();

        Ok(StreamHandle {
            stream_id,
            destination: format!("{}:{}", host, port),
            shared: self.shared.clone(),
            events,
            closed: AtomicBool::new(false),
            finished: false,
        })
    }

    /// Close the session; true on the first call only
    ///
    /// In-flight roundtrips are cancelled and every stream sees EOF.
    pub fn close(&self) -> bool {
        self.shared.shutdown("closed by client", false)
    }

    /// Wait until every session task has exited
    pub async fn join(&self) {
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        futures::future::join_all(tasks).await;
    }

    pub fn stream_count(&self) -> usize {
        self.shared.core().mux.stream_count()
    }

    pub fn stats(&self) -> TunnelStats {
        self.shared.core().stats.clone()
    }

    pub fn status(&self) -> String {
        let s = &self.shared.settings;
        let core = self.shared.core();
        let mut out = format!(
            "session {} {}\n\
             streams: {}\n\
             send window: {}/{} bytes, {} unacked, base {} next {}, queued {}\n\
             recv: next {} held {} ({} bytes)\n\
             on road: {} target {} of {}\n\
             clock: offset {:.3}s deviation {:.3}s\n\
             traffic: up {} down {} roundtrips {} failures {} resends {} slow {}\n",
            self.session_id(),
            self.state(),
            core.mux.stream_count(),
            core.window.bytes(),
            core.window.window_size(),
            core.window.unacked_count(),
            core.window.base(),
            core.window.next_sequence(),
            core.segmenter.queued(),
            core.recv.next_expected(),
            core.recv.pending_count(),
            core.recv.buffered(),
            core.on_road,
            core.target_on_roads,
            s.concurent_thread_num,
            core.server_time_offset,
            core.server_time_deviation,
            core.stats.upload_bytes,
            core.stats.download_bytes,
            core.stats.roundtrips,
            core.stats.failures,
            core.stats.resends,
            core.stats.slow_roundtrips,
        );
        for stream in core.mux.streams() {
            out.push_str(&format!(
                "  stream {} {} {:?} sent {} acked {}\n",
                stream.id(),
                stream.destination(),
                stream.state(),
                stream.sent_position(),
                stream.remote_acked()
            ));
        }
        drop(core);
        for front in &self.shared.fronts {
            out.push_str(&format!("front {}\n", front.status()));
        }
        out
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.shared.shutdown("session dropped", false);
    }
}

/// Application side of one tunnel stream
pub struct StreamHandle {
    stream_id: u32,
    destination: String,
    shared: Arc<Shared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    closed: AtomicBool,
    /// EOF or error already returned
    finished: bool,
}

impl StreamHandle {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue `data` for the remote; waits while the stream window is full
    pub async fn write(&self, data: Bytes) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::StreamClosed);
        }
        if data.is_empty() {
            return Ok(());
        }

        loop {
            let writable = self.shared.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let mut core = self.shared.core();
                self.shared.ensure_established(&core)?;
                let can_send = match core.mux.can_send(self.stream_id) {
                    Ok(can_send) => can_send,
                    Err(TunnelError::StreamNotFound(_)) => return Err(TunnelError::StreamClosed),
                    Err(e) => return Err(e),
                };
                if can_send {
                    core.mux
                        .send_data(self.stream_id, data, self.shared.settings.max_chunk())?;
                    core.queue_frames();
                    break;
                }
            }

            trace!(stream_id = self.stream_id, "stream window full");
            tokio::select! {
                _ = &mut writable => {}
                _ = self.shared.cancel.cancelled() => {}
            }
            if self.is_closed() {
                return Err(TunnelError::StreamClosed);
            }
        }

        self.shared.work.notify_waiters();
        Ok(())
    }

    /// Next in-order chunk; `None` at EOF
    pub async fn read(&mut self) -> Result<Option<Bytes>, TunnelError> {
        if self.finished {
            return Ok(None);
        }
        match self.events.recv().await {
            Some(StreamEvent::Data(data)) => {
                let queued = {
                    let mut core = self.shared.core();
                    core.mux.consume(self.stream_id, data.len());
                    core.queue_frames()
                };
                if queued {
                    self.shared.work.notify_waiters();
                }
                Ok(Some(data))
            }
            Some(StreamEvent::Close(reason)) => {
                debug!(stream_id = self.stream_id, reason = %reason, "stream eof");
                self.finished = true;
                Ok(None)
            }
            Some(StreamEvent::Error(error)) => {
                self.finished = true;
                Err(TunnelError::SessionClosed(error))
            }
            None => {
                self.finished = true;
                Ok(None)
            }
        }
    }

    /// Close the local side; true on the first call only
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let queued = {
            let mut core = self.shared.core();
            core.mux.close_stream_local(self.stream_id, "closed by client") && core.queue_frames()
        };
        if queued {
            self.shared.work.notify_waiters();
        }
        self.shared.writable.notify_waiters();
        true
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("stream_id", &self.stream_id)
            .field("destination", &self.destination)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::{FrontError, HttpResponse};
    use crate::protocol::{LoginResponse, XTunnelCodec};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Answers login, then empty roundtrips
    struct QuietServer {
        codec: XTunnelCodec,
        login_status: u16,
        /// Never answer roundtrips
        stall: bool,
        requests: AtomicUsize,
    }

    impl QuietServer {
        fn new(login_status: u16) -> Arc<Self> {
            Arc::new(Self {
                codec: XTunnelCodec::new(),
                login_status,
                stall: false,
                requests: AtomicUsize::new(0),
            })
        }

        fn stalling() -> Arc<Self> {
            Arc::new(Self {
                codec: XTunnelCodec::new(),
                login_status: 200,
                stall: true,
                requests: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl FrontRequester for QuietServer {
        fn name(&self) -> &str {
            "quiet"
        }

        fn score(&self) -> Option<u64> {
            Some(1)
        }

        async fn request(
            &self,
            _method: Method,
            path: &str,
            _headers: Vec<(String, String)>,
            body: Bytes,
            _timeout: Duration,
        ) -> Result<HttpResponse, FrontError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.stall && path != DATA_PATH {
                return futures::future::pending().await;
            }
            let body = if path == DATA_PATH {
                if self.login_status != 200 {
                    return Ok(HttpResponse {
                        status: self.login_status,
                        headers: Vec::new(),
                        body: Bytes::new(),
                    });
                }
                self.codec.decode_login_request(&body).map_err(|e| FrontError::Malformed(e.to_string()))?;
                self.codec
                    .encode_login_response(&LoginResponse {
                        res: 0,
                        message: "{}".into(),
                    })
                    .map_err(|e| FrontError::Malformed(e.to_string()))?
            } else {
                let req = self
                    .codec
                    .decode_roundtrip_request(&body)
                    .map_err(|e| FrontError::Malformed(e.to_string()))?;
                let ack = crate::protocol::AckInfo {
                    next_expected: req.blocks.iter().map(|b| b.sequence + 1).max().unwrap_or(1),
                    selective: Vec::new(),
                };
                self.codec
                    .encode_roundtrip_response(&RoundtripResponse::Data(RoundtripData {
                        server_time: now_epoch(),
                        ack: Some(ack),
                        ..Default::default()
                    }))
                    .map_err(|e| FrontError::Malformed(e.to_string()))?
            };
            Ok(HttpResponse {
                status: 200,
                headers: Vec::new(),
                body,
            })
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings {
            concurent_thread_num: 2,
            login_timeout: Duration::from_secs(3),
            ..Default::default()
        }
    }

    fn session(server: Arc<QuietServer>) -> TunnelSession {
        TunnelSession::new(vec![server], Arc::new(XTunnelCodec::new()), settings()).unwrap()
    }

    #[tokio::test]
    async fn test_login_and_idempotent_close() {
        let server = QuietServer::new(200);
        let session = session(server.clone());
        assert_eq!(session.state(), SessionState::Init);
        assert_eq!(session.session_id().len(), SESSION_ID_LEN);

        session.login().await.unwrap();
        assert!(session.is_established());

        let mut stream = session.open_stream("example.com", 443).unwrap();
        assert_eq!(stream.id(), 1);

        assert!(session.close());
        assert!(!session.close());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason().as_deref(), Some("closed by client"));

        // the stream sees EOF, not an error
        assert_eq!(stream.read().await.unwrap(), None);
        assert!(matches!(
            stream.write(Bytes::from_static(b"x")).await,
            Err(TunnelError::SessionClosed(_))
        ));
        assert!(matches!(
            session.open_stream("example.com", 443),
            Err(TunnelError::SessionClosed(_))
        ));
        session.join().await;
    }

    #[tokio::test]
    async fn test_server_down_aborts_login() {
        let server = QuietServer::new(HTTP_SERVER_DOWN);
        let session = session(server.clone());

        assert!(matches!(session.login().await, Err(TunnelError::ServerDown)));
        assert_eq!(server.requests.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_idle_session_stays_quiet() {
        let server = QuietServer::new(200);
        let session = session(server.clone());
        session.login().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        // only the login went out
        assert_eq!(server.requests.load(Ordering::SeqCst), 1);
        session.close();
    }

    #[tokio::test]
    async fn test_stream_close_is_idempotent() {
        let server = QuietServer::new(200);
        let session = session(server);
        session.login().await.unwrap();

        let stream = session.open_stream("example.com", 80).unwrap();
        assert!(stream.close());
        assert!(!stream.close());
        assert!(matches!(
            stream.write(Bytes::from_static(b"late")).await,
            Err(TunnelError::StreamClosed)
        ));
        session.close();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_closes_session() {
        let server = QuietServer::stalling();
        let settings = SessionSettings {
            max_silence: Duration::from_secs(3),
            max_retry: 100,
            ..settings()
        };
        let session =
            TunnelSession::new(vec![server.clone()], Arc::new(XTunnelCodec::new()), settings).unwrap();
        session.login().await.unwrap();

        let mut stream = session.open_stream("example.com", 80).unwrap();
        let mut state = session.subscribe();
        let started = Instant::now();
        state.wait_for(|s| *s == SessionState::Closed).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(server.requests.load(Ordering::SeqCst) >= 2);
        assert_eq!(
            session.close_reason(),
            Some(TunnelError::Silence(Duration::from_secs(3)).to_string())
        );
        assert!(matches!(stream.read().await, Err(TunnelError::SessionClosed(_))));
        session.join().await;
    }

    #[test]
    fn test_untrusted_clock_is_conservative() {
        let s = SessionSettings {
            concurent_thread_num: 4,
            min_on_road: 1,
            ..Default::default()
        };
        let mut core = Core::new(&s);
        let id = [b'c'; SESSION_ID_LEN];
        let _opened = core.mux.open_stream("h", 1).unwrap();
        core.raise_target(&s);

        let response = || RoundtripData {
            server_time: now_epoch(),
            unacked_sent: vec![(5, now_epoch() - 60.0)],
            ..Default::default()
        };

        // A slow roundtrip leaves the clock untrusted.
        core.on_response(&s, response(), Duration::from_secs(3), Instant::now())
            .unwrap();
        assert!(!core.clock_trusted(&s));
        assert!(!core.recv.has_download_timeouts());
        let Planned::Send(plan) = core.plan(&s, id, Instant::now()) else {
            panic!("below target, a roundtrip is due");
        };
        assert_eq!(plan.request.server_timeout, 0);
        assert!(plan.request.download_timeouts.is_empty());

        // A fast one makes it trusted: long polls and re-requests resume.
        core.on_response(&s, response(), Duration::from_millis(50), Instant::now())
            .unwrap();
        assert!(core.clock_trusted(&s));
        let Planned::Send(plan) = core.plan(&s, id, Instant::now()) else {
            panic!("download timeout is due");
        };
        assert_eq!(plan.request.server_timeout as u64, s.roundtrip_timeout.as_secs());
        assert_eq!(plan.request.download_timeouts, vec![5]);
    }

    #[test]
    fn test_target_rules() {
        let s = SessionSettings {
            concurent_thread_num: 20,
            min_on_road: 1,
            max_payload: 1000,
            ..Default::default()
        };
        let mut core = Core::new(&s);

        core.adjust_target(&s, 5000);
        assert_eq!(core.target_on_roads, 0, "no streams, no long polls");

        let _opened = core.mux.open_stream("h", 1).unwrap();
        core.raise_target(&s);
        assert_eq!(core.target_on_roads, 11);
        core.adjust_target(&s, 1000);
        assert_eq!(core.target_on_roads, 19);
        core.adjust_target(&s, 1000);
        assert_eq!(core.target_on_roads, 19);
        core.adjust_target(&s, 10);
        assert_eq!(core.target_on_roads, 14);
        for _ in 0..5 {
            core.adjust_target(&s, 0);
        }
        assert_eq!(core.target_on_roads, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_respects_send_delay_and_ack_delay() {
        let s = SessionSettings {
            send_delay: Duration::from_millis(10),
            ack_delay: Duration::from_millis(300),
            ..Default::default()
        };
        let mut core = Core::new(&s);
        let id = [b'a'; SESSION_ID_LEN];

        assert!(matches!(core.plan(&s, id, Instant::now()), Planned::Wait(None)));

        core.segmenter.push(Bytes::from_static(b"record"));
        match core.plan(&s, id, Instant::now()) {
            Planned::Wait(Some(at)) => assert!(at > Instant::now()),
            _ => panic!("partial block should wait for send_delay"),
        }

        tokio::time::advance(Duration::from_millis(11)).await;
        let Planned::Send(plan) = core.plan(&s, id, Instant::now()) else {
            panic!("block is due");
        };
        assert_eq!(plan.sequences, vec![1]);
        assert_eq!(plan.request.server_timeout, 0);
        assert_eq!(core.on_road, 1);

        core.on_failure(&plan, Instant::now());
        assert_eq!(core.window.retry_count(1), Some(1));
        let Planned::Send(resend) = core.plan(&s, id, Instant::now()) else {
            panic!("failed block is resent at once");
        };
        assert_eq!(resend.request.blocks, plan.request.blocks);
    }
}
