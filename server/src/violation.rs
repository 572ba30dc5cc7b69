//! Violation sink: receives structured cheat reports and routes the
//! configured response actions.
//!
//! Reports arrive from the skill engine's attestation checks (and from any
//! other detector wired to the sink). Identical reports inside a cooldown
//! window are deduplicated so one misbehaving client cannot flood the log,
//! and the event log itself is bounded.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use wyd_core::rolling_window::RollingWindow;

/// What the detector believes happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    TimingAnomaly,
    TokenMismatch,
    StateManipulation,
    CooldownManipulation,
    ChargeManipulation,
    RapidExecution,
    ComboExploitation,
    ParameterTampering,
    PermissionBypass,
    PacketReplay,
}

/// How bad it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
    Fatal,
}

/// How the report was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionMethod {
    TimingAnalysis,
    PatternMatching,
    PacketValidation,
    BehaviorAnalysis,
    IntegrityCheck,
}

/// What the sink does about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    Log,
    Warn,
    Throttle,
    Disconnect,
    BanTemporary,
    BanPermanent,
    SilentFail,
    ResetState,
    Challenge,
    Isolate,
    Custom,
}

/// One structured report.
#[derive(Debug, Clone, PartialEq)]
pub struct ViolationReport {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub method: DetectionMethod,
    pub client_id: u32,
    pub context: String,
}

impl fmt::Display for ViolationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} from client {} via {:?}: {}",
            self.kind, self.severity, self.client_id, self.method, self.context
        )
    }
}

/// Counters exposed to monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub reports_received: u64,
    pub reports_deduplicated: u64,
    pub actions_dispatched: u64,
}

type CustomAction = Box<dyn Fn(&ViolationReport) + Send + Sync>;

struct SinkState {
    policies: HashMap<ViolationKind, Vec<ResponseAction>>,
    recent: HashMap<(ViolationKind, u32, DetectionMethod), Instant>,
    log: RollingWindow<ViolationReport>,
    custom_action: Option<CustomAction>,
    stats: SinkStats,
}

/// The process-wide violation sink. Leaf component: it takes no other
/// component's lock, so any subsystem may report into it.
pub struct ViolationSink {
    state: Mutex<SinkState>,
    dedup_window_ms: u64,
    epoch: Instant,
}

impl ViolationSink {
    pub fn new(log_capacity: usize, dedup_window_ms: u64) -> Self {
        Self {
            state: Mutex::new(SinkState {
                policies: default_policies(),
                recent: HashMap::new(),
                log: RollingWindow::with_capacity(log_capacity.max(1)),
                custom_action: None,
                stats: SinkStats::default(),
            }),
            dedup_window_ms,
            epoch: Instant::now(),
        }
    }

    /// Replace the response actions for one violation kind.
    pub fn set_policy(&self, kind: ViolationKind, actions: Vec<ResponseAction>) {
        self.state.lock().unwrap().policies.insert(kind, actions);
    }

    /// Install the handler behind `ResponseAction::Custom`.
    pub fn set_custom_action(&self, action: impl Fn(&ViolationReport) + Send + Sync + 'static) {
        self.state.lock().unwrap().custom_action = Some(Box::new(action));
    }

    /// Ingest a report. Returns the actions dispatched, or an empty list
    /// when the report was deduplicated.
    pub fn report(&self, report: ViolationReport) -> Vec<ResponseAction> {
        let mut state = self.state.lock().unwrap();
        state.stats.reports_received += 1;

        let key = (report.kind, report.client_id, report.method);
        let now = Instant::now();
        if let Some(last) = state.recent.get(&key) {
            if (now.duration_since(*last).as_millis() as u64) < self.dedup_window_ms {
                state.stats.reports_deduplicated += 1;
                return Vec::new();
            }
        }
        state.recent.insert(key, now);

        let actions = state
            .policies
            .get(&report.kind)
            .cloned()
            .unwrap_or_else(|| vec![ResponseAction::Log]);
        state.stats.actions_dispatched += actions.len() as u64;
        state.log.record(report.clone());

        for action in &actions {
            match action {
                ResponseAction::Log => log::info!("violation: {report}"),
                ResponseAction::Warn => log::warn!("violation: {report}"),
                ResponseAction::SilentFail => {}
                ResponseAction::Custom => {
                    if let Some(custom) = &state.custom_action {
                        custom(&report);
                    }
                }
                // The remaining actions are carried out by the embedding
                // (connection layer, ban list); the sink records intent.
                other => log::warn!("violation response {other:?}: {report}"),
            }
        }
        actions
    }

    /// Most recent `limit` reports, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<ViolationReport> {
        let state = self.state.lock().unwrap();
        state.log.newest_first().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> SinkStats {
        self.state.lock().unwrap().stats.clone()
    }

    /// Seconds the sink has been alive; handy for monitoring dashboards.
    pub fn uptime_secs(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }
}

fn default_policies() -> HashMap<ViolationKind, Vec<ResponseAction>> {
    let mut policies = HashMap::new();
    policies.insert(
        ViolationKind::TimingAnomaly,
        vec![ResponseAction::Log, ResponseAction::Throttle],
    );
    policies.insert(
        ViolationKind::TokenMismatch,
        vec![ResponseAction::Warn, ResponseAction::Throttle],
    );
    policies.insert(
        ViolationKind::StateManipulation,
        vec![ResponseAction::Warn, ResponseAction::ResetState],
    );
    policies.insert(
        ViolationKind::CooldownManipulation,
        vec![ResponseAction::Warn, ResponseAction::ResetState],
    );
    policies.insert(
        ViolationKind::ChargeManipulation,
        vec![ResponseAction::Warn, ResponseAction::ResetState],
    );
    policies.insert(
        ViolationKind::RapidExecution,
        vec![ResponseAction::Warn, ResponseAction::Throttle],
    );
    policies.insert(
        ViolationKind::ComboExploitation,
        vec![ResponseAction::Log, ResponseAction::SilentFail],
    );
    policies.insert(
        ViolationKind::ParameterTampering,
        vec![ResponseAction::Warn, ResponseAction::Disconnect],
    );
    policies.insert(
        ViolationKind::PermissionBypass,
        vec![ResponseAction::Warn, ResponseAction::Disconnect],
    );
    policies.insert(
        ViolationKind::PacketReplay,
        vec![ResponseAction::Warn, ResponseAction::Challenge],
    );
    policies
}
