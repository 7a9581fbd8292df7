//! fleetroll.toml configuration parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub poll: PollConfig,
    pub command: CommandConfig,
    pub executor: Option<ExecutorConfig>,
    pub notify: Option<NotifyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path of the redb database file.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Well-known key of the single-run lease.
    #[serde(default = "default_lock_name")]
    pub name: String,
    #[serde(default = "default_lock_ttl")]
    pub ttl: String,
    /// Heartbeat period. Defaults to a third of the TTL.
    pub renew_interval: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Instances in flight across all regions.
    #[serde(default = "default_global_concurrency")]
    pub global_concurrency: usize,
    /// Instances in flight per region.
    #[serde(default = "default_region_concurrency")]
    pub region_concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_initial_interval")]
    pub initial_interval: String,
    #[serde(default = "default_max_interval")]
    pub max_interval: String,
    /// Give up on an invocation after this long and mark it failed.
    #[serde(default = "default_instance_timeout")]
    pub instance_timeout: String,
}

/// The fixed payload sent to every instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Versioned object-storage path of the installation script.
    pub script_url: String,
    /// Versioned object-storage path of the installer package, if separate.
    pub installer_url: Option<String>,
    /// Agent version the health check must report.
    pub expected_version: String,
}

/// External program that talks to the command-execution service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/fleetroll/state.redb")
}

fn default_lock_name() -> String {
    "rollout".to_string()
}

fn default_lock_ttl() -> String {
    "5m".to_string()
}

fn default_global_concurrency() -> usize {
    50
}

fn default_region_concurrency() -> usize {
    10
}

fn default_initial_interval() -> String {
    "2s".to_string()
}

fn default_max_interval() -> String {
    "30s".to_string()
}

fn default_instance_timeout() -> String {
    "10m".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: default_lock_name(),
            ttl: default_lock_ttl(),
            renew_interval: None,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            global_concurrency: default_global_concurrency(),
            region_concurrency: default_region_concurrency(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            instance_timeout: default_instance_timeout(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Result<Duration, ConfigError> {
        duration_field("lock.ttl", &self.ttl)
    }

    pub fn renew_interval(&self) -> Result<Duration, ConfigError> {
        match &self.renew_interval {
            Some(s) => duration_field("lock.renew_interval", s),
            None => Ok(self.ttl()? / 3),
        }
    }
}

impl PollConfig {
    pub fn initial_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("poll.initial_interval", &self.initial_interval)
    }

    pub fn max_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("poll.max_interval", &self.max_interval)
    }

    pub fn instance_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("poll.instance_timeout", &self.instance_timeout)
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.global_concurrency == 0 || self.dispatch.region_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "dispatch concurrency limits must be at least 1".to_string(),
            ));
        }

        let ttl = self.lock.ttl()?;
        if ttl.is_zero() {
            return Err(ConfigError::Invalid("lock.ttl must be non-zero".to_string()));
        }
        let renew = self.lock.renew_interval()?;
        if renew.is_zero() || renew >= ttl {
            return Err(ConfigError::Invalid(
                "lock.renew_interval must be non-zero and shorter than lock.ttl".to_string(),
            ));
        }

        let initial = self.poll.initial_interval()?;
        let max = self.poll.max_interval()?;
        if initial.is_zero() || max < initial {
            return Err(ConfigError::Invalid(
                "poll.max_interval must be at least poll.initial_interval".to_string(),
            ));
        }
        self.poll.instance_timeout()?;

        if let Some(executor) = &self.executor {
            if executor.program.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "executor.program must not be empty".to_string(),
                ));
            }
        }

        if self.command.expected_version.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "command.expected_version must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

/// Parse a duration string like "5s", "500ms", "10m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        let mins = mins.parse::<u64>().ok()?;
        mins.checked_mul(60).map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        let hours = hours.parse::<u64>().ok()?;
        hours.checked_mul(3600).map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[command]
script_url = "s3://agent-dist/agent/2.4.1/install.sh"
expected_version = "2.4.1"
"#;

    #[test]
    fn parse_minimal_applies_defaults() {
        let config = FleetConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.lock.name, "rollout");
        assert_eq!(config.lock.ttl().unwrap(), Duration::from_secs(300));
        assert_eq!(config.lock.renew_interval().unwrap(), Duration::from_secs(100));
        assert_eq!(config.dispatch.global_concurrency, 50);
        assert_eq!(config.dispatch.region_concurrency, 10);
        assert_eq!(config.poll.instance_timeout().unwrap(), Duration::from_secs(600));
        assert!(config.executor.is_none());
        assert!(config.notify.is_none());
    }

    #[test]
    fn parse_full() {
        let toml_str = r#"
[store]
path = "/tmp/fleet.redb"

[lock]
name = "agent-rollout"
ttl = "90s"
renew_interval = "20s"

[dispatch]
global_concurrency = 20
region_concurrency = 5

[poll]
initial_interval = "500ms"
max_interval = "10s"
instance_timeout = "5m"

[command]
script_url = "s3://agent-dist/agent/2.4.1/install.sh"
installer_url = "s3://agent-dist/agent/2.4.1/agent.tar.gz"
expected_version = "2.4.1"

[executor]
program = "/usr/local/bin/send-command"
args = ["--instance", "{instance_id}", "--region", "{region}"]

[notify]
webhook_url = "https://hooks.example.com/T000/B000"
"#;
        let config = FleetConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.store.path, PathBuf::from("/tmp/fleet.redb"));
        assert_eq!(config.lock.renew_interval().unwrap(), Duration::from_secs(20));
        assert_eq!(config.poll.initial_interval().unwrap(), Duration::from_millis(500));
        let executor = config.executor.unwrap();
        assert_eq!(executor.args.len(), 4);
        assert!(config.notify.unwrap().webhook_url.is_some());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let toml_str = format!("{MINIMAL}\n[dispatch]\nglobal_concurrency = 0\n");
        let err = FleetConfig::from_toml_str(&toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_renew_longer_than_ttl() {
        let toml_str = format!("{MINIMAL}\n[lock]\nttl = \"30s\"\nrenew_interval = \"45s\"\n");
        assert!(FleetConfig::from_toml_str(&toml_str).is_err());
    }

    #[test]
    fn rejects_garbage_duration() {
        let toml_str = format!("{MINIMAL}\n[poll]\ninstance_timeout = \"soon\"\n");
        let err = FleetConfig::from_toml_str(&toml_str).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidDuration { field: "poll.instance_timeout", .. }
        ));
    }

    #[test]
    fn missing_command_section_fails() {
        assert!(FleetConfig::from_toml_str("[lock]\nttl = \"1m\"\n").is_err());
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetroll.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = FleetConfig::from_file(&path).unwrap();
        assert_eq!(config.command.expected_version, "2.4.1");

        let missing = FleetConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("ten"), None);
    }

    #[test]
    fn parse_duration_rejects_overflow() {
        let huge = format!("{}m", u64::MAX);
        assert_eq!(parse_duration(&huge), None);
        assert_eq!(parse_duration(&format!("{}h", u64::MAX / 1000)), None);
        assert_eq!(
            parse_duration(&format!("{}m", u64::MAX / 60)),
            Some(Duration::from_secs(u64::MAX / 60 * 60))
        );
    }
}
