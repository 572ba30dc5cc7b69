//! Client reconnection and session persistence.
//!
//! Each client owns at most one controller, and each controller at most one
//! active reconnection cycle. Two worker threads do the long-running work:
//! *monitoring* pings the transport and folds the results into rolling
//! network metrics, *reconnecting* drives the Waiting → Attempting state
//! machine with exponential backoff until the transport succeeds, the
//! attempt budget runs out, or the cycle is canceled.
//!
//! The connect operation itself is supplied by the embedding through
//! [`ReconnectTransport`]; this module only schedules it.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Context as AnyhowContext;
use bincode::{Decode, Encode};
use rand::Rng;

use crate::config::ReconnectionConfig;
use wyd_core::rolling_window::RollingWindow;

/// Quality above this, held for [`STABLE_DEBOUNCE_MS`], counts as stable.
pub const STABLE_QUALITY_THRESHOLD: f32 = 0.7;
pub const STABLE_DEBOUNCE_MS: u64 = 2000;

/// Consecutive failures before intelligent reconnect kicks in.
const AUTO_RECONNECT_FAILURES: u32 = 3;

const LATENCY_WINDOW: usize = 32;

/// The session material persisted on behalf of the client. The two blobs
/// are opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PersistentSession {
    pub session_id: String,
    pub auth_token: String,
    pub server_address: String,
    pub server_port: u16,
    pub session_data: Vec<u8>,
    pub client_state: Vec<u8>,
    pub creation_time: i64,
    pub last_update_time: i64,
    pub is_valid: bool,
}

impl Default for PersistentSession {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            auth_token: String::new(),
            server_address: String::new(),
            server_port: 0,
            session_data: Vec::new(),
            client_state: Vec::new(),
            creation_time: 0,
            last_update_time: 0,
            is_valid: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectionState {
    Inactive,
    Waiting,
    Attempting,
    Succeeded,
    Failed,
}

/// Progress of the current cycle, readable at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptInfo {
    pub attempt: u32,
    pub max_attempts: u32,
    pub time_until_next_ms: u64,
}

/// The connect operation, supplied by the embedding. `attempt` restores a
/// lost connection from the persisted session; `ping` measures round-trip
/// latency for the monitoring loop.
pub trait ReconnectTransport: Send {
    fn attempt(&mut self, session: &PersistentSession, attempt: u32) -> Result<(), (i32, String)>;
    fn ping(&mut self) -> Result<u64, (i32, String)>;
}

pub type AttemptCallback = Box<dyn Fn(u32, u32, u64) + Send + Sync>;
pub type ResultCallback = Box<dyn Fn(bool, u32, &str) + Send + Sync>;
pub type QualityCallback = Box<dyn Fn(f32, bool) + Send + Sync>;

struct NetworkMetrics {
    latency_history: RollingWindow<f64>,
    failure_count: u32,
    success_count: u32,
    consecutive_failures: u32,
    stable_since: Option<Instant>,
}

impl NetworkMetrics {
    fn new() -> Self {
        Self {
            latency_history: RollingWindow::with_capacity(LATENCY_WINDOW),
            failure_count: 0,
            success_count: 0,
            consecutive_failures: 0,
            stable_since: None,
        }
    }

    fn avg_latency(&self) -> f64 {
        self.latency_history.mean()
    }

    fn jitter(&self) -> f64 {
        self.latency_history.mean_delta()
    }

    fn packet_loss(&self) -> f64 {
        let total = self.failure_count + self.success_count;
        if total == 0 {
            return 0.0;
        }
        self.failure_count as f64 / total as f64
    }

    /// Reduce the rolling windows to a scalar in [0, 1].
    fn quality(&self) -> f32 {
        let latency_score = (1.0 - self.avg_latency() / 500.0).clamp(0.0, 1.0);
        let jitter_score = (1.0 - self.jitter() / 200.0).clamp(0.0, 1.0);
        let loss_score = (1.0 - self.packet_loss()).clamp(0.0, 1.0);
        let failure_score = 0.8f64.powi(self.consecutive_failures as i32);
        let quality =
            0.35 * latency_score + 0.15 * jitter_score + 0.3 * loss_score + 0.2 * failure_score;
        quality.clamp(0.0, 1.0) as f32
    }

    fn record_success(&mut self, latency_ms: f64) {
        self.latency_history.record(latency_ms);
        self.success_count += 1;
        self.consecutive_failures = 0;
        if self.quality() >= STABLE_QUALITY_THRESHOLD {
            self.stable_since.get_or_insert_with(Instant::now);
        } else {
            self.stable_since = None;
        }
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.consecutive_failures += 1;
        self.stable_since = None;
    }
}

struct ReconnectionContext {
    attempt: u32,
    max_attempts: u32,
    next_delay_ms: u64,
    next_attempt_at: Option<Instant>,
    state: ReconnectionState,
}

struct CallbackTable {
    attempt: Vec<(u32, AttemptCallback)>,
    result: Vec<(u32, ResultCallback)>,
    quality: Vec<(u32, QualityCallback)>,
}

struct ReconnInner {
    config: ReconnectionConfig,
    enabled: AtomicBool,
    session: Mutex<PersistentSession>,
    metrics: Mutex<NetworkMetrics>,
    context: Mutex<ReconnectionContext>,
    context_cv: Condvar,
    callbacks: Mutex<CallbackTable>,
    next_callback_id: AtomicU32,
    transport: Mutex<Box<dyn ReconnectTransport>>,
    monitoring: AtomicBool,
    reconnecting: AtomicBool,
    monitor_should_run: AtomicBool,
    reconnect_should_run: AtomicBool,
    monitor_gate: Mutex<()>,
    monitor_cv: Condvar,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
    reconnect_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Per-client reconnection controller.
pub struct ReconnectionController {
    inner: Arc<ReconnInner>,
}

impl ReconnectionController {
    pub fn new(config: ReconnectionConfig, transport: Box<dyn ReconnectTransport>) -> Self {
        let enabled = config.enabled;
        let max_attempts = config.max_attempts;
        let initial_delay = config.initial_delay_ms;
        Self {
            inner: Arc::new(ReconnInner {
                config,
                enabled: AtomicBool::new(enabled),
                session: Mutex::new(PersistentSession::default()),
                metrics: Mutex::new(NetworkMetrics::new()),
                context: Mutex::new(ReconnectionContext {
                    attempt: 0,
                    max_attempts,
                    next_delay_ms: initial_delay,
                    next_attempt_at: None,
                    state: ReconnectionState::Inactive,
                }),
                context_cv: Condvar::new(),
                callbacks: Mutex::new(CallbackTable {
                    attempt: Vec::new(),
                    result: Vec::new(),
                    quality: Vec::new(),
                }),
                next_callback_id: AtomicU32::new(1),
                transport: Mutex::new(transport),
                monitoring: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                monitor_should_run: AtomicBool::new(false),
                reconnect_should_run: AtomicBool::new(false),
                monitor_gate: Mutex::new(()),
                monitor_cv: Condvar::new(),
                monitor_thread: Mutex::new(None),
                reconnect_thread: Mutex::new(None),
            }),
        }
    }

    // ------------------------------------------------------------------
    //  Session lifecycle
    // ------------------------------------------------------------------

    pub fn setup_session(
        &self,
        session_id: &str,
        auth_token: &str,
        server_address: &str,
        server_port: u16,
    ) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        let mut session = self.inner.session.lock().unwrap();
        session.session_id = session_id.to_string();
        session.auth_token = auth_token.to_string();
        session.server_address = server_address.to_string();
        session.server_port = server_port;
        session.creation_time = now;
        session.last_update_time = now;
        session.is_valid = true;
        true
    }

    /// Replace the opaque blobs and bump the update timestamp. Fails when
    /// no valid session exists.
    pub fn update_session_state(&self, session_data: Vec<u8>, client_state: Vec<u8>) -> bool {
        let mut session = self.inner.session.lock().unwrap();
        if !session.is_valid {
            log::warn!("update_session_state called without a valid session");
            return false;
        }
        session.session_data = session_data;
        session.client_state = client_state;
        session.last_update_time = chrono::Utc::now().timestamp_millis();
        true
    }

    /// Invalidate the session and zero its sensitive bytes before
    /// releasing them.
    pub fn clear_session(&self) {
        let mut session = self.inner.session.lock().unwrap();
        for byte in session.session_data.iter_mut() {
            *byte = 0;
        }
        for byte in session.client_state.iter_mut() {
            *byte = 0;
        }
        session.session_data.clear();
        session.client_state.clear();
        session.auth_token.clear();
        session.session_id.clear();
        session.is_valid = false;
    }

    pub fn session(&self) -> PersistentSession {
        self.inner.session.lock().unwrap().clone()
    }

    pub fn has_valid_session(&self) -> bool {
        self.inner.session.lock().unwrap().is_valid
    }

    /// Persist the session to a byte sink. The saved form is opaque.
    pub fn save_session(&self, sink: &mut impl Write) -> anyhow::Result<()> {
        let session = self.inner.session.lock().unwrap().clone();
        let bytes = bincode::encode_to_vec(&session, bincode::config::standard())
            .context("encoding session")?;
        sink.write_all(&bytes).context("writing session")?;
        Ok(())
    }

    /// Restore a session previously written by [`save_session`].
    pub fn load_session(&self, source: &mut impl Read) -> anyhow::Result<()> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).context("reading session")?;
        let (session, _): (PersistentSession, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard())
                .context("decoding session")?;
        *self.inner.session.lock().unwrap() = session;
        Ok(())
    }

    pub fn save_session_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let mut file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        self.save_session(&mut file)
    }

    pub fn load_session_from_file(&self, path: &Path) -> anyhow::Result<()> {
        let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        self.load_session(&mut file)
    }

    // ------------------------------------------------------------------
    //  Monitoring
    // ------------------------------------------------------------------

    pub fn start_monitoring(&self) -> bool {
        if self.inner.monitoring.swap(true, Ordering::SeqCst) {
            return true; // already monitoring
        }
        self.inner.monitor_should_run.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("reconn-monitor".into())
            .spawn(move || monitoring_loop(&inner))
            .expect("Failed to spawn monitoring thread");
        *self.inner.monitor_thread.lock().unwrap() = Some(handle);
        true
    }

    pub fn stop_monitoring(&self) {
        if !self.inner.monitoring.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.monitor_should_run.store(false, Ordering::SeqCst);
        self.inner.monitor_cv.notify_all();
        if let Some(handle) = self.inner.monitor_thread.lock().unwrap().take() {
            if let Err(e) = handle.join() {
                log::error!("Monitoring thread panicked: {e:?}");
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.monitoring.load(Ordering::SeqCst)
    }

    /// Fold an externally observed failure into the metrics. May start a
    /// reconnection cycle when intelligent reconnect is on.
    pub fn report_connection_failure(&self, error_code: i32, message: &str) -> bool {
        log::warn!("Connection failure {error_code}: {message}");
        let consecutive = {
            let mut metrics = self.inner.metrics.lock().unwrap();
            metrics.record_failure();
            metrics.consecutive_failures
        };
        self.notify_quality();
        if self.inner.config.intelligent_reconnect
            && consecutive >= AUTO_RECONNECT_FAILURES
            && self.inner.enabled.load(Ordering::SeqCst)
        {
            start_reconnection(&self.inner);
        }
        true
    }

    /// Reset the consecutive-failure window after a confirmed reconnect.
    pub fn report_reconnect_success(&self) -> bool {
        let mut metrics = self.inner.metrics.lock().unwrap();
        metrics.record_success(0.0);
        true
    }

    pub fn estimate_connection_quality(&self) -> f32 {
        self.inner.metrics.lock().unwrap().quality()
    }

    /// True when quality has stayed above the threshold for the debounce
    /// window.
    pub fn is_connection_stable(&self) -> bool {
        let metrics = self.inner.metrics.lock().unwrap();
        match metrics.stable_since {
            Some(since) => since.elapsed().as_millis() as u64 >= STABLE_DEBOUNCE_MS,
            None => false,
        }
    }

    // ------------------------------------------------------------------
    //  Reconnection cycle
    // ------------------------------------------------------------------

    pub fn start_reconnection(&self) -> bool {
        start_reconnection(&self.inner)
    }

    /// Abort the current cycle; the state machine returns to Inactive.
    pub fn cancel_reconnection(&self) {
        self.inner.reconnect_should_run.store(false, Ordering::SeqCst);
        self.inner.context_cv.notify_all();
        if let Some(handle) = self.inner.reconnect_thread.lock().unwrap().take() {
            if let Err(e) = handle.join() {
                log::error!("Reconnection thread panicked: {e:?}");
            }
        }
        let mut context = self.inner.context.lock().unwrap();
        context.state = ReconnectionState::Inactive;
        context.next_attempt_at = None;
        self.inner.reconnecting.store(false, Ordering::SeqCst);
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ReconnectionState {
        self.inner.context.lock().unwrap().state
    }

    pub fn current_attempt_info(&self) -> Option<AttemptInfo> {
        let context = self.inner.context.lock().unwrap();
        if context.state == ReconnectionState::Inactive {
            return None;
        }
        let time_until_next_ms = context
            .next_attempt_at
            .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or(0);
        Some(AttemptInfo {
            attempt: context.attempt,
            max_attempts: context.max_attempts,
            time_until_next_ms,
        })
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    //  Callbacks
    // ------------------------------------------------------------------

    pub fn register_attempt_callback(
        &self,
        callback: impl Fn(u32, u32, u64) + Send + Sync + 'static,
    ) -> u32 {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .attempt
            .push((id, Box::new(callback)));
        id
    }

    pub fn unregister_attempt_callback(&self, id: u32) -> bool {
        let mut table = self.inner.callbacks.lock().unwrap();
        let before = table.attempt.len();
        table.attempt.retain(|(cb_id, _)| *cb_id != id);
        table.attempt.len() != before
    }

    pub fn register_result_callback(
        &self,
        callback: impl Fn(bool, u32, &str) + Send + Sync + 'static,
    ) -> u32 {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .result
            .push((id, Box::new(callback)));
        id
    }

    pub fn unregister_result_callback(&self, id: u32) -> bool {
        let mut table = self.inner.callbacks.lock().unwrap();
        let before = table.result.len();
        table.result.retain(|(cb_id, _)| *cb_id != id);
        table.result.len() != before
    }

    pub fn register_quality_callback(
        &self,
        callback: impl Fn(f32, bool) + Send + Sync + 'static,
    ) -> u32 {
        let id = self.inner.next_callback_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .callbacks
            .lock()
            .unwrap()
            .quality
            .push((id, Box::new(callback)));
        id
    }

    pub fn unregister_quality_callback(&self, id: u32) -> bool {
        let mut table = self.inner.callbacks.lock().unwrap();
        let before = table.quality.len();
        table.quality.retain(|(cb_id, _)| *cb_id != id);
        table.quality.len() != before
    }

    fn notify_quality(&self) {
        notify_quality(&self.inner);
    }

    /// Stop both worker threads and invalidate the session.
    pub fn shutdown(&self) {
        self.stop_monitoring();
        self.cancel_reconnection();
        self.clear_session();
    }
}

impl Drop for ReconnectionController {
    fn drop(&mut self) {
        self.stop_monitoring();
        self.cancel_reconnection();
    }
}

/// Backoff schedule: `min(initial * multiplier^attempt, max)`, optionally
/// jittered by a factor drawn from `[1 - f, 1 + f]`.
pub fn calculate_backoff_delay(config: &ReconnectionConfig, attempt: u32) -> u64 {
    let mut delay = config.initial_delay_ms as f64;
    for _ in 0..attempt {
        delay *= config.backoff_multiplier;
    }
    delay = delay.min(config.max_delay_ms as f64);
    if config.use_randomization {
        let f = config.randomization_factor;
        let factor = rand::thread_rng().gen_range(1.0 - f..=1.0 + f);
        delay *= factor;
    }
    delay as u64
}

fn start_reconnection(inner: &Arc<ReconnInner>) -> bool {
    if !inner.enabled.load(Ordering::SeqCst) {
        log::warn!("Reconnection requested while disabled");
        return false;
    }
    if !inner.session.lock().unwrap().is_valid {
        log::warn!("Reconnection requested without a valid session");
        return false;
    }
    if inner.reconnecting.swap(true, Ordering::SeqCst) {
        return true; // a cycle is already running
    }

    {
        let mut context = inner.context.lock().unwrap();
        context.attempt = 0;
        context.max_attempts = inner.config.max_attempts;
        context.next_delay_ms = inner.config.initial_delay_ms;
        // First attempt fires immediately; the configured initial delay is
        // what the attempt callback reports and what a failure waits.
        context.next_attempt_at = Some(Instant::now());
        context.state = ReconnectionState::Waiting;
    }

    inner.reconnect_should_run.store(true, Ordering::SeqCst);
    let inner_clone = inner.clone();
    let handle = std::thread::Builder::new()
        .name("reconn-cycle".into())
        .spawn(move || reconnection_loop(&inner_clone))
        .expect("Failed to spawn reconnection thread");
    *inner.reconnect_thread.lock().unwrap() = Some(handle);
    true
}

fn reconnection_loop(inner: &Arc<ReconnInner>) {
    loop {
        if !inner.reconnect_should_run.load(Ordering::SeqCst) {
            break;
        }

        // Wait out the backoff, waking early on cancel.
        let (attempt, max_attempts, reported_delay) = {
            let mut context = inner.context.lock().unwrap();
            loop {
                if !inner.reconnect_should_run.load(Ordering::SeqCst) {
                    return;
                }
                let due = match context.next_attempt_at {
                    Some(at) => at,
                    None => return,
                };
                let now = Instant::now();
                if due <= now {
                    context.attempt += 1;
                    context.state = ReconnectionState::Attempting;
                    break (context.attempt, context.max_attempts, context.next_delay_ms);
                }
                let (c, _) = inner
                    .context_cv
                    .wait_timeout(context, due.saturating_duration_since(now))
                    .unwrap();
                context = c;
            }
        };

        notify_attempt(inner, attempt, max_attempts, reported_delay);

        let session = inner.session.lock().unwrap().clone();
        let outcome = {
            let mut transport = inner.transport.lock().unwrap();
            transport.attempt(&session, attempt)
        };

        match outcome {
            Ok(()) => {
                {
                    let mut context = inner.context.lock().unwrap();
                    context.state = ReconnectionState::Succeeded;
                    context.next_attempt_at = None;
                }
                inner.metrics.lock().unwrap().record_success(0.0);
                notify_result(
                    inner,
                    true,
                    attempt,
                    &format!("reconnected after {attempt} attempt(s)"),
                );
                break;
            }
            Err((code, message)) => {
                log::debug!("Reconnect attempt {attempt} failed ({code}): {message}");
                inner.metrics.lock().unwrap().record_failure();
                if attempt >= max_attempts {
                    {
                        let mut context = inner.context.lock().unwrap();
                        context.state = ReconnectionState::Failed;
                        context.next_attempt_at = None;
                    }
                    notify_result(inner, false, attempt, "reconnect attempt limit reached");
                    break;
                }
                let delay = calculate_backoff_delay(&inner.config, attempt);
                let mut context = inner.context.lock().unwrap();
                context.next_delay_ms = delay;
                context.next_attempt_at = Some(Instant::now() + Duration::from_millis(delay));
                context.state = ReconnectionState::Waiting;
            }
        }
    }
    inner.reconnecting.store(false, Ordering::SeqCst);
}

fn monitoring_loop(inner: &Arc<ReconnInner>) {
    while inner.monitor_should_run.load(Ordering::SeqCst) {
        if inner.config.keep_alive {
            let ping = {
                let mut transport = inner.transport.lock().unwrap();
                transport.ping()
            };
            let consecutive = {
                let mut metrics = inner.metrics.lock().unwrap();
                match ping {
                    Ok(latency_ms) if latency_ms <= inner.config.ping_timeout_ms => {
                        metrics.record_success(latency_ms as f64);
                    }
                    Ok(latency_ms) => {
                        log::warn!("Keep-alive ping exceeded timeout: {latency_ms} ms");
                        metrics.record_failure();
                    }
                    Err((code, message)) => {
                        log::warn!("Keep-alive ping failed ({code}): {message}");
                        metrics.record_failure();
                    }
                }
                metrics.consecutive_failures
            };
            notify_quality(inner);

            if inner.config.intelligent_reconnect
                && consecutive >= AUTO_RECONNECT_FAILURES
                && inner.enabled.load(Ordering::SeqCst)
                && !inner.reconnecting.load(Ordering::SeqCst)
                && inner.session.lock().unwrap().is_valid
            {
                start_reconnection(inner);
            }
        }

        // Sleep one keep-alive interval, waking early on stop.
        let gate = inner.monitor_gate.lock().unwrap();
        let _ = inner
            .monitor_cv
            .wait_timeout(
                gate,
                Duration::from_millis(inner.config.keep_alive_interval_ms.max(10)),
            )
            .unwrap();
    }
}

fn notify_attempt(inner: &Arc<ReconnInner>, attempt: u32, max_attempts: u32, delay_ms: u64) {
    let table = inner.callbacks.lock().unwrap();
    for (_, callback) in &table.attempt {
        callback(attempt, max_attempts, delay_ms);
    }
}

fn notify_result(inner: &Arc<ReconnInner>, success: bool, attempts: u32, message: &str) {
    let table = inner.callbacks.lock().unwrap();
    for (_, callback) in &table.result {
        callback(success, attempts, message);
    }
}

fn notify_quality(inner: &Arc<ReconnInner>) {
    let (quality, stable) = {
        let metrics = inner.metrics.lock().unwrap();
        let quality = metrics.quality();
        let stable = metrics
            .stable_since
            .map(|since| since.elapsed().as_millis() as u64 >= STABLE_DEBOUNCE_MS)
            .unwrap_or(false);
        (quality, stable)
    };
    let table = inner.callbacks.lock().unwrap();
    for (_, callback) in &table.quality {
        callback(quality, !stable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Mutex as StdMutex;

    /// Transport scripted to fail until (and including) a chosen attempt.
    struct ScriptedTransport {
        succeed_on: Option<u32>,
        ping_latency_ms: u64,
    }

    impl ReconnectTransport for ScriptedTransport {
        fn attempt(
            &mut self,
            _session: &PersistentSession,
            attempt: u32,
        ) -> Result<(), (i32, String)> {
            match self.succeed_on {
                Some(n) if attempt >= n => Ok(()),
                _ => Err((110, "connection timed out".to_string())),
            }
        }

        fn ping(&mut self) -> Result<u64, (i32, String)> {
            Ok(self.ping_latency_ms)
        }
    }

    fn fast_config(max_attempts: u32) -> ReconnectionConfig {
        ReconnectionConfig {
            max_attempts,
            initial_delay_ms: 5,
            backoff_multiplier: 1.0,
            max_delay_ms: 20,
            use_randomization: false,
            keep_alive_interval_ms: 20,
            ..ReconnectionConfig::default()
        }
    }

    fn controller(
        config: ReconnectionConfig,
        succeed_on: Option<u32>,
    ) -> ReconnectionController {
        ReconnectionController::new(
            config,
            Box::new(ScriptedTransport {
                succeed_on,
                ping_latency_ms: 10,
            }),
        )
    }

    fn wait_until(deadline_ms: u64, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    /// Backoff trajectory with `initial=100, multiplier=2, max=1000`: the
    /// delays reported for six attempts are 100, 200, 400, 800, 1000, 1000.
    #[test]
    fn backoff_trajectory_doubles_until_the_cap() {
        let config = ReconnectionConfig {
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1000,
            use_randomization: false,
            max_attempts: 6,
            ..ReconnectionConfig::default()
        };
        // The first attempt reports the initial delay; each failure of
        // attempt n schedules calculate_backoff_delay(n).
        let mut observed = vec![config.initial_delay_ms];
        for attempt in 1..6 {
            observed.push(calculate_backoff_delay(&config, attempt));
        }
        assert_eq!(observed, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn default_backoff_uses_one_point_five_multiplier() {
        let config = ReconnectionConfig {
            use_randomization: false,
            ..ReconnectionConfig::default()
        };
        assert_eq!(calculate_backoff_delay(&config, 1), 750);
        assert_eq!(calculate_backoff_delay(&config, 2), 1125);
        // Deep attempts clamp to the 30s ceiling.
        assert_eq!(calculate_backoff_delay(&config, 30), 30000);
    }

    #[test]
    fn randomized_backoff_stays_inside_the_jitter_band() {
        let config = ReconnectionConfig {
            initial_delay_ms: 1000,
            backoff_multiplier: 1.0,
            max_delay_ms: 10_000,
            use_randomization: true,
            randomization_factor: 0.2,
            ..ReconnectionConfig::default()
        };
        for _ in 0..100 {
            let delay = calculate_backoff_delay(&config, 1);
            assert!((800..=1200).contains(&delay), "delay {delay} out of band");
        }
    }

    /// maxAttempts=3 against a transport that always fails: exactly three
    /// Attempting transitions, then the Failed terminal state; the result
    /// callback fires once with success=false, attempts=3.
    #[test]
    fn exhausting_attempts_ends_in_failed() {
        let ctrl = controller(fast_config(3), None);
        ctrl.setup_session("s1", "token", "127.0.0.1", 8281);

        let attempts = Arc::new(StdMutex::new(Vec::new()));
        let results = Arc::new(StdMutex::new(Vec::new()));
        let a = attempts.clone();
        ctrl.register_attempt_callback(move |attempt, max, _delay| {
            a.lock().unwrap().push((attempt, max));
        });
        let r = results.clone();
        ctrl.register_result_callback(move |success, attempts, _msg| {
            r.lock().unwrap().push((success, attempts));
        });

        assert!(ctrl.start_reconnection());
        assert!(wait_until(5000, || ctrl.state() == ReconnectionState::Failed));
        assert!(wait_until(1000, || !ctrl.is_reconnecting()));

        assert_eq!(
            *attempts.lock().unwrap(),
            vec![(1, 3), (2, 3), (3, 3)]
        );
        assert_eq!(*results.lock().unwrap(), vec![(false, 3)]);
    }

    #[test]
    fn transport_success_ends_in_succeeded() {
        let ctrl = controller(fast_config(10), Some(3));
        ctrl.setup_session("s1", "token", "127.0.0.1", 8281);

        let results = Arc::new(StdMutex::new(Vec::new()));
        let r = results.clone();
        ctrl.register_result_callback(move |success, attempts, _msg| {
            r.lock().unwrap().push((success, attempts));
        });

        assert!(ctrl.start_reconnection());
        assert!(wait_until(5000, || {
            ctrl.state() == ReconnectionState::Succeeded
        }));
        assert_eq!(*results.lock().unwrap(), vec![(true, 3)]);
    }

    #[test]
    fn reconnection_without_session_is_rejected() {
        let ctrl = controller(fast_config(3), Some(1));
        assert!(!ctrl.start_reconnection());
        assert_eq!(ctrl.state(), ReconnectionState::Inactive);
    }

    #[test]
    fn cancel_returns_to_inactive() {
        let config = ReconnectionConfig {
            initial_delay_ms: 60_000, // park the cycle in Waiting
            max_delay_ms: 120_000,
            ..fast_config(5)
        };
        let ctrl = controller(config, None);
        ctrl.setup_session("s1", "token", "127.0.0.1", 8281);
        assert!(ctrl.start_reconnection());
        // First attempt fires immediately, then the cycle waits a minute.
        assert!(wait_until(2000, || {
            ctrl.state() == ReconnectionState::Waiting
        }));
        ctrl.cancel_reconnection();
        assert_eq!(ctrl.state(), ReconnectionState::Inactive);
        assert!(!ctrl.is_reconnecting());
    }

    #[test]
    fn attempt_info_reports_progress() {
        let config = ReconnectionConfig {
            initial_delay_ms: 60_000,
            max_delay_ms: 120_000,
            ..fast_config(7)
        };
        let ctrl = controller(config, None);
        ctrl.setup_session("s1", "token", "127.0.0.1", 8281);
        assert_eq!(ctrl.current_attempt_info(), None);
        ctrl.start_reconnection();
        assert!(wait_until(2000, || {
            ctrl.state() == ReconnectionState::Waiting
        }));
        let info = ctrl.current_attempt_info().unwrap();
        assert_eq!(info.attempt, 1);
        assert_eq!(info.max_attempts, 7);
        assert!(info.time_until_next_ms > 50_000);
        ctrl.cancel_reconnection();
    }

    /// Session persistence: saving to a byte sink and loading it back
    /// reproduces every field exactly.
    #[test]
    fn session_round_trips_through_a_byte_sink() {
        let ctrl = controller(fast_config(3), Some(1));
        ctrl.setup_session("session-9", "secret-token", "game.example.net", 8281);
        ctrl.update_session_state(vec![1, 2, 3, 4], vec![9, 8, 7]);
        let original = ctrl.session();

        let mut sink = Vec::new();
        ctrl.save_session(&mut sink).unwrap();

        let restored_ctrl = controller(fast_config(3), Some(1));
        restored_ctrl
            .load_session(&mut Cursor::new(sink))
            .unwrap();
        let restored = restored_ctrl.session();

        assert_eq!(restored.session_id, original.session_id);
        assert_eq!(restored.auth_token, original.auth_token);
        assert_eq!(restored.server_address, original.server_address);
        assert_eq!(restored.server_port, original.server_port);
        assert_eq!(restored.session_data, original.session_data);
        assert_eq!(restored.client_state, original.client_state);
        assert_eq!(restored, original);
    }

    #[test]
    fn clear_session_invalidates_and_drops_blobs() {
        let ctrl = controller(fast_config(3), Some(1));
        ctrl.setup_session("s", "t", "h", 1);
        ctrl.update_session_state(vec![1, 2, 3], vec![4, 5]);
        ctrl.clear_session();
        let session = ctrl.session();
        assert!(!session.is_valid);
        assert!(session.session_data.is_empty());
        assert!(session.client_state.is_empty());
        assert!(session.auth_token.is_empty());
        assert!(!ctrl.update_session_state(vec![1], vec![2]));
    }

    #[test]
    fn failures_degrade_quality_and_success_restores_it() {
        let ctrl = controller(fast_config(3), Some(1));
        let initial = ctrl.estimate_connection_quality();
        for _ in 0..5 {
            // Intelligent reconnect stays off the failure path here because
            // no session exists.
            ctrl.report_connection_failure(104, "connection reset");
        }
        let degraded = ctrl.estimate_connection_quality();
        assert!(degraded < initial);
        ctrl.report_reconnect_success();
        assert!(ctrl.estimate_connection_quality() > degraded);
    }

    #[test]
    fn monitoring_invokes_quality_callbacks() {
        let ctrl = controller(fast_config(3), Some(1));
        let samples = Arc::new(StdMutex::new(Vec::new()));
        let s = samples.clone();
        let id = ctrl.register_quality_callback(move |quality, unstable| {
            s.lock().unwrap().push((quality, unstable));
        });

        assert!(ctrl.start_monitoring());
        assert!(ctrl.is_monitoring());
        assert!(wait_until(3000, || !samples.lock().unwrap().is_empty()));
        ctrl.stop_monitoring();
        assert!(!ctrl.is_monitoring());

        let observed = samples.lock().unwrap().clone();
        assert!(observed.iter().all(|(q, _)| (0.0..=1.0).contains(q)));
        assert!(ctrl.unregister_quality_callback(id));
        assert!(!ctrl.unregister_quality_callback(id));
    }

    #[test]
    fn callback_unregistration_by_id() {
        let ctrl = controller(fast_config(3), Some(1));
        let id_a = ctrl.register_attempt_callback(|_, _, _| {});
        let id_r = ctrl.register_result_callback(|_, _, _| {});
        assert!(ctrl.unregister_attempt_callback(id_a));
        assert!(!ctrl.unregister_attempt_callback(id_a));
        assert!(ctrl.unregister_result_callback(id_r));
    }
}
