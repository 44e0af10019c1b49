use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str, default: T) -> T {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key).map(|v| v.to_ascii_lowercase()) {
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

// ── Periodic overlap policy ───────────────────────────────────

/// What a periodic tick does while the previous execution of the same task
/// is still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Dispatch every tick unconditionally; slow handlers may overlap.
    #[default]
    Allow,
    /// Drop the tick if the previous execution has not finished.
    Skip,
}

impl std::str::FromStr for OverlapPolicy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(OverlapPolicy::Allow),
            "skip" => Ok(OverlapPolicy::Skip),
            other => Err(SchedulerError::Config(format!(
                "unknown periodic overlap policy '{}' (expected allow or skip)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for OverlapPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlapPolicy::Allow => write!(f, "allow"),
            OverlapPolicy::Skip => write!(f, "skip"),
        }
    }
}

// ── Scheduler config ──────────────────────────────────────────

/// Scheduler configuration, from env vars or a TOML file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of sync worker threads. 0 = available parallelism.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    /// Whether to start the dedicated async loop thread.
    #[serde(default = "default_async_loop")]
    pub async_loop: bool,
    /// How long to wait for the async loop thread to come up.
    #[serde(default = "default_loop_start_timeout")]
    pub loop_start_timeout_ms: u64,
    /// Upper bound for draining the pool and joining the loop on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    /// Behavior of periodic ticks that arrive while the previous run is live.
    #[serde(default)]
    pub periodic_overlap: OverlapPolicy,
}

/// Upper bound for `loop_start_timeout_ms` and `shutdown_timeout_ms` (one hour).
pub const MAX_TIMEOUT_MS: u64 = 60 * 60 * 1_000;

fn default_worker_threads() -> usize { 2 }
fn default_async_loop() -> bool { true }
fn default_loop_start_timeout() -> u64 { 2_000 }
fn default_shutdown_timeout() -> u64 { 2_000 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            async_loop: default_async_loop(),
            loop_start_timeout_ms: default_loop_start_timeout(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            periodic_overlap: OverlapPolicy::default(),
        }
    }
}

impl SchedulerConfig {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `DISPATCH_PROFILE`. When set (e.g. `TEST`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("DISPATCH_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            worker_threads: profiled_env_parse(p, "DISPATCH_WORKER_THREADS", default_worker_threads()),
            async_loop: profiled_env_bool(p, "DISPATCH_ASYNC_LOOP", default_async_loop()),
            loop_start_timeout_ms: profiled_env_parse(
                p,
                "DISPATCH_LOOP_START_TIMEOUT_MS",
                default_loop_start_timeout(),
            ),
            shutdown_timeout_ms: profiled_env_parse(
                p,
                "DISPATCH_SHUTDOWN_TIMEOUT_MS",
                default_shutdown_timeout(),
            ),
            periodic_overlap: profiled_env_opt(p, "DISPATCH_PERIODIC_OVERLAP")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
        }
    }

    /// Parse config from a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, SchedulerError> {
        let config: SchedulerConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SchedulerError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject settings that would make shutdown or startup unbounded.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.shutdown_timeout_ms == 0 {
            return Err(SchedulerError::Config(
                "shutdown_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.async_loop && self.loop_start_timeout_ms == 0 {
            return Err(SchedulerError::Config(
                "loop_start_timeout_ms must be greater than zero".to_string(),
            ));
        }
        for (field, value) in [
            ("shutdown_timeout_ms", self.shutdown_timeout_ms),
            ("loop_start_timeout_ms", self.loop_start_timeout_ms),
        ] {
            if value > MAX_TIMEOUT_MS {
                return Err(SchedulerError::Config(format!(
                    "{} must be at most {} (got {})",
                    field, MAX_TIMEOUT_MS, value
                )));
            }
        }
        Ok(())
    }

    /// Resolve worker thread count (0 means use available parallelism).
    pub fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        } else {
            self.worker_threads
        }
    }

    pub fn loop_start_timeout(&self) -> Duration {
        Duration::from_millis(self.loop_start_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config:");
        tracing::info!("  workers:     {} (configured {})", self.resolved_worker_threads(), self.worker_threads);
        tracing::info!("  async loop:  {} (start timeout {}ms)", self.async_loop, self.loop_start_timeout_ms);
        tracing::info!("  shutdown:    timeout={}ms", self.shutdown_timeout_ms);
        tracing::info!("  periodic:    overlap={}", self.periodic_overlap);
    }
}

// ── Interval parsing ──────────────────────────────────────────

/// Parse a human-readable duration string into a [`Duration`].
///
/// Supports components: `Xd`, `Xh`, `Xm`, `Xs` and `Xms`, combinable as in
/// "1m30s" or "2s500ms". A bare number is read as milliseconds.
/// Returns `None` if the string is empty, unparseable or zero.
pub fn parse_interval(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut found_unit = false;
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            num_buf.push(ch);
            continue;
        }
        let n: u64 = num_buf.parse().ok()?;
        num_buf.clear();
        let unit_ms = match ch {
            'd' => 86_400_000,
            'h' => 3_600_000,
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            'm' => 60_000,
            's' => 1_000,
            _ => return None,
        };
        total_ms = total_ms.checked_add(n.checked_mul(unit_ms)?)?;
        found_unit = true;
    }

    if !num_buf.is_empty() {
        if found_unit {
            // "30m15" is ambiguous
            return None;
        }
        total_ms = num_buf.parse().ok()?;
    }

    if total_ms == 0 {
        return None;
    }

    Some(Duration::from_millis(total_ms))
}
