//! Runtime configuration for every subsystem.
//!
//! Defaults are the documented production values. `ServerConfig::from_env`
//! loads `.env` (when present) and applies `WYD_*` overrides on top, so a
//! deployment can tune a single knob without shipping a full config file.

use serde::Deserialize;
use std::env;

/// Event bus tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub use_async_dispatch: bool,
    pub max_queue_size: usize,
    pub num_worker_threads: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            use_async_dispatch: true,
            max_queue_size: 1000,
            num_worker_threads: 2,
        }
    }
}

/// Timer subsystem tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub use_high_resolution: bool,
    pub num_threads: usize,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            use_high_resolution: true,
            num_threads: 1,
        }
    }
}

/// Reconnection controller tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
    pub use_randomization: bool,
    pub randomization_factor: f64,
    pub keep_alive: bool,
    pub keep_alive_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub intelligent_reconnect: bool,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            initial_delay_ms: 500,
            backoff_multiplier: 1.5,
            max_delay_ms: 30000,
            use_randomization: true,
            randomization_factor: 0.2,
            keep_alive: true,
            keep_alive_interval_ms: 30000,
            ping_timeout_ms: 5000,
            intelligent_reconnect: true,
        }
    }
}

/// Engine-wide skill defaults; individual skills may override each field
/// through their `SkillOptions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SkillEngineConfig {
    pub interruptible: bool,
    pub max_charges: u32,
    pub charge_restore_ms: u64,
    pub execution_buffer_size: usize,
    pub anomaly_threshold: f32,
    /// Allowed client/server timestamp drift before an execution is flagged.
    pub timestamp_drift_ms: u64,
    /// Window inside which an execution id may not be replayed.
    pub replay_window_ms: u64,
    /// How long an actor is throttled after a security violation.
    pub throttle_duration_ms: u64,
}

impl Default for SkillEngineConfig {
    fn default() -> Self {
        Self {
            interruptible: true,
            max_charges: 1,
            charge_restore_ms: 0,
            execution_buffer_size: 5,
            anomaly_threshold: 0.85,
            timestamp_drift_ms: 5000,
            replay_window_ms: 30000,
            throttle_duration_ms: 10000,
        }
    }
}

/// Top-level configuration consumed by `Server::new`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub event_bus: EventBusConfig,
    pub timer: TimerConfig,
    pub reconnection: ReconnectionConfig,
    pub skill_engine: SkillEngineConfig,
    pub data_dir: Option<String>,
}

impl ServerConfig {
    /// Defaults, then `.env`, then process environment.
    pub fn from_env() -> Self {
        // Missing .env is fine; variables may come from the environment.
        let _ = dotenvy::dotenv();

        let mut config = Self::default();
        if let Some(v) = read_env_bool("WYD_BUS_ASYNC") {
            config.event_bus.use_async_dispatch = v;
        }
        if let Some(v) = read_env_parse::<usize>("WYD_BUS_QUEUE_SIZE") {
            config.event_bus.max_queue_size = v;
        }
        if let Some(v) = read_env_parse::<usize>("WYD_BUS_WORKERS") {
            config.event_bus.num_worker_threads = v;
        }
        if let Some(v) = read_env_parse::<usize>("WYD_TIMER_THREADS") {
            config.timer.num_threads = v;
        }
        if let Some(v) = read_env_bool("WYD_RECONNECT_ENABLED") {
            config.reconnection.enabled = v;
        }
        if let Some(v) = read_env_parse::<u32>("WYD_RECONNECT_MAX_ATTEMPTS") {
            config.reconnection.max_attempts = v;
        }
        if let Some(v) = read_env_parse::<u64>("WYD_RECONNECT_INITIAL_DELAY_MS") {
            config.reconnection.initial_delay_ms = v;
        }
        if let Some(v) = read_env_parse::<u64>("WYD_RECONNECT_MAX_DELAY_MS") {
            config.reconnection.max_delay_ms = v;
        }
        if let Some(v) = env::var("WYD_DATA_DIR").ok().filter(|s| !s.is_empty()) {
            config.data_dir = Some(v);
        }
        config
    }
}

fn read_env_bool(key: &str) -> Option<bool> {
    match env::var(key).ok()?.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        other => {
            log::warn!("Ignoring unparseable boolean for {key}: {other}");
            None
        }
    }
}

fn read_env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring unparseable value for {key}: {raw}");
            None
        }
    }
}
