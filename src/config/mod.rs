use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "WALLET_BRIDGE_";
pub const DEFAULT_CHANNEL_NAME: &str = "ui<->background";
const MIN_FRAME_SIZE: usize = 1024;
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config encode: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("{0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    pub channel_name: String,
    pub socket_dir: Option<String>,
    pub connect_timeout_ms: u64,
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.to_string(),
            socket_dir: None,
            connect_timeout_ms: 5000,
            reconnect_initial_backoff_ms: 250,
            reconnect_max_backoff_ms: 5000,
            max_frame_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AbandonPolicy {
    /// Calls left pending on a replaced session never complete.
    #[default]
    Abandon,
    /// Calls left pending on a replaced session fail with `SessionReplaced`.
    Cancel,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StartupPolicy {
    #[default]
    RequireAll,
    BestEffort,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub status_interval_secs: u64,
    pub request_timeout_ms: Option<u64>,
    pub abandon_policy: AbandonPolicy,
    pub startup_policy: StartupPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            status_interval_secs: 20,
            request_timeout_ms: None,
            abandon_policy: AbandonPolicy::Abandon,
            startup_policy: StartupPolicy::RequireAll,
        }
    }
}

/// Runtime knobs for the client, resolved from `Config`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub channel_name: String,
    pub connect_timeout: Duration,
    pub reconnect_initial_backoff: Duration,
    pub reconnect_max_backoff: Duration,
    pub max_frame_size: usize,
    pub status_interval: Duration,
    pub request_timeout: Option<Duration>,
    pub abandon_policy: AbandonPolicy,
    pub startup_policy: StartupPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Config::default().client_options()
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)?;
            config = toml::from_str::<Config>(&raw)?;
            tracing::debug!(path = %config_path.display(), "loaded config file");
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Transport settings
        if let Ok(val) = env::var(format!("{}CHANNEL_NAME", ENV_PREFIX)) {
            self.transport.channel_name = val;
        }
        if let Ok(val) = env::var(format!("{}SOCKET_DIR", ENV_PREFIX)) {
            self.transport.socket_dir = Some(val);
        }
        if let Ok(val) = env::var(format!("{}CONNECT_TIMEOUT_MS", ENV_PREFIX)) {
            if let Ok(ms) = val.parse() {
                self.transport.connect_timeout_ms = ms;
            }
        }
        if let Ok(val) = env::var(format!("{}MAX_FRAME_SIZE", ENV_PREFIX)) {
            if let Ok(size) = val.parse() {
                self.transport.max_frame_size = size;
            }
        }

        // Client settings
        if let Ok(val) = env::var(format!("{}STATUS_INTERVAL_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.client.status_interval_secs = secs;
            }
        }
        if let Ok(val) = env::var(format!("{}REQUEST_TIMEOUT_MS", ENV_PREFIX)) {
            self.client.request_timeout_ms = val.parse().ok().filter(|ms| *ms > 0);
        }
        if let Ok(val) = env::var(format!("{}ABANDON_POLICY", ENV_PREFIX)) {
            match val.as_str() {
                "abandon" => self.client.abandon_policy = AbandonPolicy::Abandon,
                "cancel" => self.client.abandon_policy = AbandonPolicy::Cancel,
                other => tracing::warn!(value = %other, "ignoring unknown abandon policy"),
            }
        }
        if let Ok(val) = env::var(format!("{}STARTUP_POLICY", ENV_PREFIX)) {
            match val.as_str() {
                "require_all" => self.client.startup_policy = StartupPolicy::RequireAll,
                "best_effort" => self.client.startup_policy = StartupPolicy::BestEffort,
                other => tracing::warn!(value = %other, "ignoring unknown startup policy"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transport.channel_name.trim().is_empty() {
            return Err(ConfigError::Invalid("transport.channel_name must be set"));
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.connect_timeout_ms must be non-zero",
            ));
        }
        if self.transport.reconnect_initial_backoff_ms == 0 {
            return Err(ConfigError::Invalid(
                "transport.reconnect_initial_backoff_ms must be non-zero",
            ));
        }
        if self.transport.reconnect_max_backoff_ms < self.transport.reconnect_initial_backoff_ms {
            return Err(ConfigError::Invalid(
                "transport.reconnect_max_backoff_ms must be >= reconnect_initial_backoff_ms",
            ));
        }
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&self.transport.max_frame_size) {
            return Err(ConfigError::Invalid(
                "transport.max_frame_size must be between 1 KiB and 16 MiB",
            ));
        }
        if self.client.status_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "client.status_interval_secs must be non-zero",
            ));
        }
        if self.client.request_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "client.request_timeout_ms must be non-zero when set",
            ));
        }
        Ok(())
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            channel_name: self.transport.channel_name.clone(),
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            reconnect_initial_backoff: Duration::from_millis(
                self.transport.reconnect_initial_backoff_ms,
            ),
            reconnect_max_backoff: Duration::from_millis(self.transport.reconnect_max_backoff_ms),
            max_frame_size: self.transport.max_frame_size,
            status_interval: Duration::from_secs(self.client.status_interval_secs),
            request_timeout: self.client.request_timeout_ms.map(Duration::from_millis),
            abandon_policy: self.client.abandon_policy,
            startup_policy: self.client.startup_policy,
        }
    }

    /// Directory holding the per-channel sockets.
    pub fn socket_dir(&self) -> PathBuf {
        if let Some(dir) = &self.transport.socket_dir {
            return PathBuf::from(dir);
        }
        dirs::runtime_dir().unwrap_or_else(env::temp_dir)
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        if path.as_ref().exists() {
            return Err(ConfigError::Invalid("config.toml already exists"));
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wallet-bridge")
        .join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.transport.channel_name, DEFAULT_CHANNEL_NAME);
        assert_eq!(parsed.client.status_interval_secs, 20);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [client]
            abandon_policy = "cancel"
            request_timeout_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(parsed.client.abandon_policy, AbandonPolicy::Cancel);
        assert_eq!(parsed.client.startup_policy, StartupPolicy::RequireAll);
        assert_eq!(parsed.transport.max_frame_size, 64 * 1024);

        let opts = parsed.client_options();
        assert_eq!(opts.request_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(opts.status_interval, Duration::from_secs(20));
    }

    #[test]
    fn validate_rejects_empty_channel_and_zero_intervals() {
        let mut cfg = Config::default();
        cfg.transport.channel_name = "  ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.client.status_interval_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.client.request_timeout_ms = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_backoff_and_frame_bounds() {
        let mut cfg = Config::default();
        cfg.transport.reconnect_initial_backoff_ms = 1000;
        cfg.transport.reconnect_max_backoff_ms = 500;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.transport.max_frame_size = 16;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn explicit_socket_dir_wins() {
        let mut cfg = Config::default();
        cfg.transport.socket_dir = Some("/tmp/wallet-sockets".to_string());
        assert_eq!(cfg.socket_dir(), PathBuf::from("/tmp/wallet-sockets"));
    }
}
