use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::caser::NameCasing;
use crate::error::{QuarryError, Result};

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

fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str) -> Option<T> {
    profiled_env_opt(profile, key).and_then(|v| v.parse().ok())
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `QUARRY_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("QUARRY_PROFILE", "").to_uppercase();
        let mut config = Self {
            profile,
            ..Self::default()
        };
        config.apply_env_overrides();
        config
    }

    /// Parse config from a TOML string, then apply env overrides.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(toml_str)?;
        if config.profile.is_empty() {
            config.profile = env_or("QUARRY_PROFILE", "");
        }
        config.profile = config.profile.to_uppercase();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    pub fn validate(&self) -> Result<()> {
        self.sync.validate()
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  sync:     concurrency={}, max_depth={}, resource_fanout={}",
            self.sync.concurrency,
            self.sync.max_depth,
            self.sync.resource_fanout
        );
        tracing::info!(
            "  timing:   resource_timeout={}s, metrics_interval={}s",
            self.sync.resource_timeout_secs,
            self.sync.metrics_interval_secs
        );
        tracing::info!("  lookup:   name_casing={}", self.sync.name_casing);
        tracing::info!("  logging:  format={}", self.logging.format);
    }

    /// Apply environment variable overrides.
    ///
    /// - `QUARRY_CONCURRENCY` -> `sync.concurrency`
    /// - `QUARRY_MAX_DEPTH` -> `sync.max_depth`
    /// - `QUARRY_RESOURCE_FANOUT` -> `sync.resource_fanout`
    /// - `QUARRY_RESOURCE_TIMEOUT_SECS` -> `sync.resource_timeout_secs`
    /// - `QUARRY_METRICS_INTERVAL_SECS` -> `sync.metrics_interval_secs`
    /// - `QUARRY_NAME_CASING` -> `sync.name_casing`
    /// - `QUARRY_LOG_FORMAT` -> `logging.format`
    pub fn apply_env_overrides(&mut self) {
        let p = self.profile.clone();
        let p = p.as_str();
        if let Some(v) = profiled_env_parse(p, "QUARRY_CONCURRENCY") {
            self.sync.concurrency = v;
        }
        if let Some(v) = profiled_env_parse(p, "QUARRY_MAX_DEPTH") {
            self.sync.max_depth = v;
        }
        if let Some(v) = profiled_env_parse(p, "QUARRY_RESOURCE_FANOUT") {
            self.sync.resource_fanout = v;
        }
        if let Some(v) = profiled_env_parse(p, "QUARRY_RESOURCE_TIMEOUT_SECS") {
            self.sync.resource_timeout_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "QUARRY_METRICS_INTERVAL_SECS") {
            self.sync.metrics_interval_secs = v;
        }
        if let Some(v) = profiled_env_parse(p, "QUARRY_NAME_CASING") {
            self.sync.name_casing = v;
        }
        if let Some(v) = profiled_env_opt(p, "QUARRY_LOG_FORMAT") {
            self.logging.format = v;
        }
    }
}

// ── Sync ──────────────────────────────────────────────────────

/// Knobs for the resolution scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Total admission budget. Divided by `resource_fanout` to get the
    /// table concurrency at depth 1.
    pub concurrency: usize,
    /// Expected height of the table tree. Raised automatically when the
    /// tree is taller.
    pub max_depth: usize,
    /// Resource slots per table slot.
    pub resource_fanout: usize,
    pub resource_timeout_secs: u64,
    pub metrics_interval_secs: u64,
    pub name_casing: NameCasing,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: 10_000,
            max_depth: 4,
            resource_fanout: 100,
            resource_timeout_secs: 600,
            metrics_interval_secs: 30,
            name_casing: NameCasing::Pascal,
        }
    }
}

impl SyncConfig {
    pub fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_secs)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(QuarryError::Config("sync.concurrency must be > 0".into()));
        }
        if self.max_depth == 0 {
            return Err(QuarryError::Config("sync.max_depth must be > 0".into()));
        }
        if self.resource_fanout == 0 {
            return Err(QuarryError::Config("sync.resource_fanout must be > 0".into()));
        }
        if self.metrics_interval_secs == 0 {
            return Err(QuarryError::Config("sync.metrics_interval_secs must be > 0".into()));
        }
        Ok(())
    }
}

// ── Logging ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// "text" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "text".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}
