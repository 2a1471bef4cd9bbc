// Configuration loading: defaults <- YAML file <- KAMAL_NAPPER_* environment.
mod defaults;

use crate::core::logger::Logger;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix for environment overrides, e.g. `KAMAL_NAPPER_IDLE_TIMEOUT=300`.
pub const ENV_PREFIX: &str = "KAMAL_NAPPER_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Daemon configuration. Read-only after load; all durations are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Seconds a host may go without user traffic before its app is stopped
    pub idle_timeout: u64,
    /// Seconds between supervisor ticks
    pub poll_interval: u64,
    /// Seconds an app may stay in Starting before it is given up on
    pub startup_timeout: u64,
    /// Extra attempts for external commands (0 = single attempt)
    pub max_retries: u32,
    pub health_check_port: u16,
    pub health_check_path: String,
    /// Seconds covering connect + read of one health probe
    pub health_check_timeout: u64,
    /// Directory holding state.yml and its backups
    pub state_dir: PathBuf,
    /// Hostname the daemon itself is served under; never managed
    pub own_hostname: Option<String>,
    pub log_level: String,
    /// Optional file the logger appends to in addition to stderr
    pub log_file: Option<PathBuf>,
    /// Reverse-proxy container: log source and maintenance command target
    pub proxy_container_name: String,
    /// Plain-text access logs scanned when the proxy log is unavailable
    pub access_log_dir: Option<PathBuf>,
    /// State-sync fires roughly once per N per-host checks (1 = every check)
    pub state_sync_sample_rate: u64,
}

/// Partial view of the YAML file; absent keys keep their defaults.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    idle_timeout: Option<u64>,
    poll_interval: Option<u64>,
    startup_timeout: Option<u64>,
    max_retries: Option<u32>,
    health_check_port: Option<u16>,
    health_check_path: Option<String>,
    health_check_timeout: Option<u64>,
    state_dir: Option<PathBuf>,
    own_hostname: Option<String>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
    proxy_container_name: Option<String>,
    access_log_dir: Option<PathBuf>,
    state_sync_sample_rate: Option<u64>,
}

impl Config {
    /// Load defaults, overlay the YAML file at `path` (when given and present),
    /// then apply environment overrides. Validation is a separate step so the
    /// CLI can report all load-time problems before the fatal check. The
    /// logger receives a warning for every env override that is ignored.
    pub fn load(path: Option<&Path>, logger: &Logger) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            let file: ConfigFile =
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            config.overlay(file);
        }

        config.apply_env_overrides(logger);
        Ok(config)
    }

    fn overlay(&mut self, file: ConfigFile) {
        if let Some(v) = file.idle_timeout {
            self.idle_timeout = v;
        }
        if let Some(v) = file.poll_interval {
            self.poll_interval = v;
        }
        if let Some(v) = file.startup_timeout {
            self.startup_timeout = v;
        }
        if let Some(v) = file.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = file.health_check_port {
            self.health_check_port = v;
        }
        if let Some(v) = file.health_check_path {
            self.health_check_path = v;
        }
        if let Some(v) = file.health_check_timeout {
            self.health_check_timeout = v;
        }
        if let Some(v) = file.state_dir {
            self.state_dir = v;
        }
        if let Some(v) = file.own_hostname {
            self.own_hostname = Some(v);
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if let Some(v) = file.log_file {
            self.log_file = Some(v);
        }
        if let Some(v) = file.proxy_container_name {
            self.proxy_container_name = v;
        }
        if let Some(v) = file.access_log_dir {
            self.access_log_dir = Some(v);
        }
        if let Some(v) = file.state_sync_sample_rate {
            self.state_sync_sample_rate = v;
        }
    }

    /// Each field answers to `KAMAL_NAPPER_<UPPER_KEY>`, coerced to the
    /// field's type. Malformed values are ignored with a warning rather than
    /// fatal so a typo in the environment cannot keep the daemon from booting.
    fn apply_env_overrides(&mut self, logger: &Logger) {
        if let Some(v) = env_number("IDLE_TIMEOUT", logger) {
            self.idle_timeout = v;
        }
        if let Some(v) = env_number("POLL_INTERVAL", logger) {
            self.poll_interval = v;
        }
        if let Some(v) = env_number("STARTUP_TIMEOUT", logger) {
            self.startup_timeout = v;
        }
        if let Some(v) = env_number("MAX_RETRIES", logger) {
            self.max_retries = v;
        }
        if let Some(v) = env_number("HEALTH_CHECK_PORT", logger) {
            self.health_check_port = v;
        }
        if let Some(v) = env_string("HEALTH_CHECK_PATH", logger) {
            self.health_check_path = v;
        }
        if let Some(v) = env_number("HEALTH_CHECK_TIMEOUT", logger) {
            self.health_check_timeout = v;
        }
        if let Some(v) = env_string("STATE_DIR", logger) {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = env_string("OWN_HOSTNAME", logger) {
            self.own_hostname = Some(v);
        }
        if let Some(v) = env_string("LOG_LEVEL", logger) {
            self.log_level = v;
        }
        if let Some(v) = env_string("LOG_FILE", logger) {
            self.log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = env_string("PROXY_CONTAINER_NAME", logger) {
            self.proxy_container_name = v;
        }
        if let Some(v) = env_string("ACCESS_LOG_DIR", logger) {
            self.access_log_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env_number("STATE_SYNC_SAMPLE_RATE", logger) {
            self.state_sync_sample_rate = v;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        positive("idle_timeout", self.idle_timeout)?;
        positive("poll_interval", self.poll_interval)?;
        positive("startup_timeout", self.startup_timeout)?;
        positive("health_check_timeout", self.health_check_timeout)?;
        positive("health_check_port", u64::from(self.health_check_port))?;
        positive("state_sync_sample_rate", self.state_sync_sample_rate)?;

        if !self.health_check_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "health_check_path",
                reason: format!("must start with '/', got {:?}", self.health_check_path),
            });
        }
        if self.proxy_container_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "proxy_container_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.state_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "state_dir",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    // Typed duration accessors; config keys stay plain seconds in the file.

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout)
    }
}

fn env_raw(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}")).ok()
}

fn warn_ignored(logger: &Logger, key: &str, raw: &str, expected: &str) {
    logger.warn(
        "config",
        &format!("ignoring {ENV_PREFIX}{key}={raw:?}: expected {expected}"),
    );
}

fn env_string(key: &str, logger: &Logger) -> Option<String> {
    let raw = env_raw(key)?;
    let value = raw.trim().to_string();
    if value.is_empty() {
        warn_ignored(logger, key, &raw, "a non-empty string");
        return None;
    }
    Some(value)
}

fn env_number<T: std::str::FromStr>(key: &str, logger: &Logger) -> Option<T> {
    let raw = env_raw(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn_ignored(logger, key, &raw, "an unsigned integer in range");
            None
        }
    }
}
