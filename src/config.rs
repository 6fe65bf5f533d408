//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Backup tool executable (looked up on `PATH` when not absolute).
    pub tool: String,
    /// Directory holding the tool's config files.
    pub config_dir: PathBuf,
    /// Path of the job history database.
    pub database_path: PathBuf,
    /// HTTP port.
    pub port: u16,
    /// Whether successful backups trigger a follow-up stats query.
    pub stats_follow_up: bool,
    /// Upper bound for the follow-up stats query.
    pub stats_timeout: Duration,
    /// How long persisted, finished jobs stay in memory.
    pub retention: Duration,
    /// Interval between retention sweeps.
    pub sweep_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tool: "borgmatic".to_string(),
            config_dir: PathBuf::from("/etc/borgmatic"),
            database_path: PathBuf::from("/data/dashborg.db"),
            port: 8000,
            stats_follow_up: true,
            stats_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(3600), // 1 hour
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Build from `DASHBORG_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tool: std::env::var("DASHBORG_TOOL").unwrap_or(defaults.tool),
            config_dir: std::env::var("DASHBORG_CONFIG_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.config_dir),
            database_path: std::env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            port: env_parse("DASHBORG_PORT", defaults.port),
            stats_follow_up: env_parse("DASHBORG_STATS_FOLLOW_UP", defaults.stats_follow_up),
            stats_timeout: Duration::from_secs(env_parse(
                "DASHBORG_STATS_TIMEOUT_SECS",
                defaults.stats_timeout.as_secs(),
            )),
            retention: Duration::from_secs(env_parse(
                "DASHBORG_RETENTION_SECS",
                defaults.retention.as_secs(),
            )),
            sweep_interval: Duration::from_secs(env_parse(
                "DASHBORG_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval.as_secs(),
            )),
        }
    }

    /// Resolve a config label (a bare file name) inside `config_dir`.
    pub fn config_path(&self, label: &str) -> Result<PathBuf, ConfigError> {
        if label.is_empty()
            || label.contains('/')
            || label.contains('\\')
            || label.split('.').all(|part| part.is_empty())
            || label.contains("..")
        {
            return Err(ConfigError::InvalidValue {
                key: "config".to_string(),
                message: format!("'{label}' is not a plain file name"),
            });
        }
        Ok(self.config_dir.join(label))
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, fallback = %default, "Ignoring invalid config value");
            default
        }),
        Err(_) => default,
    }
}
