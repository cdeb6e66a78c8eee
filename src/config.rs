//! TOML configuration for the netmeter agent.
//!
//! Layered model: compiled-in defaults, overridden by a TOML file found via
//! the `NETMETER_CONFIG` environment variable or the standard system
//! location.  Every section is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "NETMETER_CONFIG";

/// Standard system-wide config location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/netmeter/netmeter.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the agent process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub reports: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded agent configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `NETMETER_CONFIG` environment variable.
    /// 2. `/etc/netmeter/netmeter.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "NETMETER_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Pending-set persistence and due-check cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Directory holding one JSON file per pending test definition.
    pub storage_dir: PathBuf,
    /// Mirror every add/remove to disk immediately.  When `false`, the
    /// pending set is only written on an explicit flush (shutdown).
    pub realtime: bool,
    /// Upper bound on how long the agent loop sleeps between due checks.
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("data/scheduler"),
            realtime: true,
            poll_interval_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// A running probe is stopped after this many seconds.
    pub run_timeout_sec: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            run_timeout_sec: 120,
        }
    }
}

impl ExecutorConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_sec)
    }
}

// ---------------------------------------------------------------------------
// Traffic
// ---------------------------------------------------------------------------

/// Data-transfer budget and connection retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficConfig {
    /// Bytes probes may still transfer.  Reserved at prepare time.
    pub available_bytes: u64,
    /// TCP connect attempts before a target is declared unreachable.
    pub connect_attempts: u32,
    /// Delay before the second attempt; doubled for every further attempt.
    pub retry_backoff_ms: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            available_bytes: 2 * 1024 * 1024 * 1024,
            connect_attempts: 3,
            retry_backoff_ms: 250,
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Directory holding one JSON file per reported test identity.
    pub storage_dir: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("data/reports"),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AgentConfig::default();

        assert_eq!(cfg.scheduler.storage_dir, PathBuf::from("data/scheduler"));
        assert!(cfg.scheduler.realtime);
        assert_eq!(cfg.scheduler.poll_interval(), Duration::from_secs(1));

        assert_eq!(cfg.executor.run_timeout(), Duration::from_secs(120));

        assert_eq!(cfg.traffic.available_bytes, 2_147_483_648);
        assert_eq!(cfg.traffic.connect_attempts, 3);
        assert_eq!(cfg.traffic.retry_backoff_ms, 250);

        assert_eq!(cfg.reports.storage_dir, PathBuf::from("data/reports"));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[scheduler]
storage_dir = "/var/lib/netmeter/scheduler"
realtime = false
poll_interval_ms = 250

[executor]
run_timeout_sec = 60

[traffic]
available_bytes = 31457280
connect_attempts = 5
retry_backoff_ms = 100

[reports]
storage_dir = "/var/lib/netmeter/reports"

[logging]
level = "debug"
json = true
"#;

        let cfg: AgentConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(
            cfg.scheduler.storage_dir,
            PathBuf::from("/var/lib/netmeter/scheduler")
        );
        assert!(!cfg.scheduler.realtime);
        assert_eq!(cfg.scheduler.poll_interval_ms, 250);
        assert_eq!(cfg.executor.run_timeout_sec, 60);
        assert_eq!(cfg.traffic.available_bytes, 31_457_280);
        assert_eq!(cfg.traffic.connect_attempts, 5);
        assert_eq!(cfg.traffic.retry_backoff_ms, 100);
        assert_eq!(
            cfg.reports.storage_dir,
            PathBuf::from("/var/lib/netmeter/reports")
        );
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
[traffic]
available_bytes = 1000
"#;

        let cfg: AgentConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.traffic.available_bytes, 1000);
        assert_eq!(cfg.traffic.connect_attempts, 3);
        assert!(cfg.scheduler.realtime);
        assert_eq!(cfg.executor.run_timeout_sec, 120);
    }

    #[test]
    fn test_poll_interval_has_floor() {
        let cfg = SchedulerConfig {
            poll_interval_ms: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(cfg.poll_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("netmeter.toml");
        std::fs::write(
            &path,
            r#"
[executor]
run_timeout_sec = 30
"#,
        )
        .unwrap();

        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.executor.run_timeout_sec, 30);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = AgentConfig::load(Path::new("/nonexistent/path/netmeter.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = AgentConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let roundtripped: AgentConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(cfg.scheduler.storage_dir, roundtripped.scheduler.storage_dir);
        assert_eq!(
            cfg.traffic.available_bytes,
            roundtripped.traffic.available_bytes
        );
    }
}
