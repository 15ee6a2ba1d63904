//! # Configuration Management Module
//!
//! All runtime settings for the GSM link live in one TOML file, loaded once at
//! startup and then passed explicitly to the components that need them. No
//! hardware default is process-global: the serial opener, the dispatcher and the
//! poller each receive their own section.
//!
//! ## Configuration Structure
//!
//! - [`GsmConfig`] - serial port, baud rate, command deadline, settle timings,
//!   simulation fallback
//! - [`DispatchConfig`] - retry policy and worker pool size
//! - [`PollerConfig`] - inbound polling cadence
//! - [`StorageConfig`] - data directory for persisted records
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gsm]
//! port = "/dev/ttyUSB0"
//! baud_rate = 9600
//! timeout_secs = 5
//! simulate_when_absent = true
//!
//! [gsm.device_ports]
//! "7" = "/dev/ttyUSB1"
//!
//! [dispatch]
//! max_attempts = 3
//! retry_delay_secs = 60
//! backoff = "fixed"
//!
//! [poller]
//! enabled = true
//! interval_secs = 60
//! ```
//!
//! ## Environment Integration
//!
//! `GSM_PORT`, `GSM_BAUD_RATE` and `GSM_TIMEOUT` override the file, following the
//! precedence: CLI args > Environment > Config file > Defaults.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::fs;

use crate::dispatch::{Backoff, RetryPolicy};
use crate::protocol::ExchangeTiming;
use crate::serial::PortMap;
use crate::storage::DeviceId;

pub const ENV_PORT: &str = "GSM_PORT";
pub const ENV_BAUD_RATE: &str = "GSM_BAUD_RATE";
pub const ENV_TIMEOUT: &str = "GSM_TIMEOUT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gsm: GsmConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GsmConfig {
    /// Serial device of the GSM module (e.g. /dev/ttyUSB0, /dev/ttyS0 on GPIO UART)
    pub port: String,
    pub baud_rate: u32,
    /// Deadline for one command round-trip, in seconds
    pub timeout_secs: u64,
    /// Per-device port overrides keyed by device id. Devices without an entry use `port`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub device_ports: HashMap<String, String>,
    /// Report a simulated delivery when no module is attached. Disable in production
    /// so a missing modem surfaces as a hardware error instead of a silent success.
    #[serde(default = "default_simulate_when_absent")]
    pub simulate_when_absent: bool,
    /// Wait after opening the port before the first command (ms)
    #[serde(default)]
    pub open_settle_ms: Option<u64>,
    /// Settle window after each intermediate command (ms)
    #[serde(default)]
    pub step_settle_ms: Option<u64>,
    /// Poll interval while waiting for a busy port to be released (ms)
    #[serde(default)]
    pub busy_poll_ms: Option<u64>,
}

fn default_simulate_when_absent() -> bool {
    true
}

impl GsmConfig {
    /// Port routing for every device, with unparseable override keys skipped.
    pub fn port_map(&self) -> PortMap {
        self.device_ports
            .iter()
            .filter_map(|(k, v)| k.trim().parse::<DeviceId>().ok().map(|id| (id, v)))
            .fold(PortMap::new(&self.port), |map, (id, port)| {
                map.with_override(id, port)
            })
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Timing profile for protocol exchanges.
    pub fn timing(&self) -> ExchangeTiming {
        let defaults = ExchangeTiming::default();
        ExchangeTiming {
            open_settle: self
                .open_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.open_settle),
            step_settle: self
                .step_settle_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.step_settle),
            command_timeout: self.command_timeout(),
            busy_poll: self
                .busy_poll_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.busy_poll),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    #[serde(default)]
    pub backoff: BackoffKind,
    /// Multiplier applied per attempt when `backoff = "exponential"`
    #[serde(default)]
    pub backoff_multiplier: Option<u32>,
    /// Upper bound for exponential delays (seconds)
    #[serde(default)]
    pub max_retry_delay_secs: Option<u64>,
    /// Random jitter added to each retry delay (ms, 0 disables)
    #[serde(default)]
    pub retry_jitter_ms: Option<u64>,
    /// Maximum number of exchanges running at the same time across all devices
    #[serde(default)]
    pub workers: Option<usize>,
    /// Terminal jobs kept for status queries before the oldest are forgotten
    #[serde(default)]
    pub history_limit: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_secs: 60,
            backoff: BackoffKind::Fixed,
            backoff_multiplier: Some(2),
            max_retry_delay_secs: Some(900),
            retry_jitter_ms: Some(0),
            workers: Some(4),
            history_limit: Some(256),
        }
    }
}

impl DispatchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.retry_delay_secs);
        let backoff = match self.backoff {
            BackoffKind::Fixed => Backoff::Fixed,
            BackoffKind::Exponential => Backoff::Exponential {
                factor: self.backoff_multiplier.unwrap_or(2).max(1),
                max_delay: Duration::from_secs(self.max_retry_delay_secs.unwrap_or(900)),
            },
        };
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay,
            backoff,
            jitter: Duration::from_millis(self.retry_jitter_ms.unwrap_or(0)),
        }
    }

    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or(4).max(1)
    }

    pub fn effective_history_limit(&self) -> usize {
        self.history_limit.unwrap_or(256)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Exchange log entries kept in memory for queries; older entries stay on disk only
    #[serde(default)]
    pub log_cache_limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a file, then apply environment overrides.
    pub async fn load(path: &str) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok()).await
    }

    /// Like [`Config::load`], with overrides taken from `lookup` instead of the
    /// process environment.
    pub async fn load_with<F>(path: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply `GSM_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(ENV_PORT).filter(|p| !p.trim().is_empty()) {
            self.gsm.port = port.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_BAUD_RATE) {
            self.gsm.baud_rate = raw
                .trim()
                .parse()
                .map_err(|e| anyhow!("Invalid {}={}: {}", ENV_BAUD_RATE, raw, e))?;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT) {
            self.gsm.timeout_secs = raw
                .trim()
                .parse()
                .map_err(|e| anyhow!("Invalid {}={}: {}", ENV_TIMEOUT, raw, e))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.gsm.port.trim().is_empty() {
            bail!("gsm.port must not be empty");
        }
        if self.gsm.baud_rate == 0 {
            bail!("gsm.baud_rate must be positive");
        }
        if self.gsm.timeout_secs == 0 {
            bail!("gsm.timeout_secs must be at least 1");
        }
        if self.dispatch.max_attempts == 0 {
            bail!("dispatch.max_attempts must be at least 1");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gsm: GsmConfig {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
                timeout_secs: 5,
                device_ports: HashMap::new(),
                simulate_when_absent: true,
                open_settle_ms: Some(1000),
                step_settle_ms: Some(500),
                busy_poll_ms: Some(50),
            },
            dispatch: DispatchConfig::default(),
            poller: PollerConfig::default(),
            storage: StorageConfig {
                data_dir: "./data".to_string(),
                log_cache_limit: Some(1000),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("canelink.log".to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardware_profile() {
        let config = Config::default();
        assert_eq!(config.gsm.baud_rate, 9600);
        assert_eq!(config.gsm.timeout_secs, 5);
        assert!(config.gsm.simulate_when_absent);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.retry_delay_secs, 60);
        assert_eq!(config.poller.interval_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn timing_uses_configured_windows() {
        let config = Config::default();
        let timing = config.gsm.timing();
        assert_eq!(timing.open_settle, Duration::from_secs(1));
        assert_eq!(timing.step_settle, Duration::from_millis(500));
        assert_eq!(timing.command_timeout, Duration::from_secs(5));
    }

    #[test]
    fn env_overrides_take_precedence() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            (ENV_PORT, "/dev/ttyACM0"),
            (ENV_BAUD_RATE, "115200"),
            (ENV_TIMEOUT, "8"),
        ]
        .into_iter()
        .collect();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.gsm.port, "/dev/ttyACM0");
        assert_eq!(config.gsm.baud_rate, 115200);
        assert_eq!(config.gsm.timeout_secs, 8);
    }

    #[test]
    fn invalid_baud_override_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|k| (k == ENV_BAUD_RATE).then(|| "fast".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_BAUD_RATE));
    }

    #[test]
    fn device_port_override() {
        let mut config = Config::default();
        config
            .gsm
            .device_ports
            .insert("7".to_string(), "/dev/ttyUSB1".to_string());
        config
            .gsm
            .device_ports
            .insert("not-a-device".to_string(), "/dev/ttyUSB2".to_string());
        let map = config.gsm.port_map();
        assert_eq!(map.port_for(7), "/dev/ttyUSB1");
        assert_eq!(map.port_for(8), "/dev/ttyUSB0");
    }

    #[test]
    fn exponential_backoff_maps_to_policy() {
        let dispatch = DispatchConfig {
            backoff: BackoffKind::Exponential,
            backoff_multiplier: Some(3),
            max_retry_delay_secs: Some(120),
            ..DispatchConfig::default()
        };
        let policy = dispatch.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(
            policy.backoff,
            Backoff::Exponential {
                factor: 3,
                max_delay: Duration::from_secs(120)
            }
        );
    }

    #[test]
    fn toml_round_trip_keeps_sections() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        assert!(text.contains("[gsm]"));
        assert!(text.contains("[dispatch]"));
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.gsm.port, config.gsm.port);
        assert_eq!(parsed.dispatch.backoff, BackoffKind::Fixed);
    }

    #[test]
    fn minimal_file_fills_defaults() {
        let text = r#"
            [gsm]
            port = "/dev/ttyS0"
            baud_rate = 9600
            timeout_secs = 5

            [storage]
            data_dir = "./data"

            [logging]
            level = "debug"
        "#;
        let parsed: Config = toml::from_str(text).unwrap();
        assert!(parsed.gsm.simulate_when_absent);
        assert_eq!(parsed.dispatch.max_attempts, 3);
        assert!(parsed.poller.enabled);
        assert!(parsed.logging.file.is_none());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path_str = path.to_string_lossy().to_string();
        tokio_test::block_on(async {
            Config::create_default(&path_str).await.unwrap();
            let loaded = Config::load_with(&path_str, |_| None).await.unwrap();
            assert_eq!(loaded.gsm.baud_rate, 9600);
            assert_eq!(loaded.gsm.port, Config::default().gsm.port);

            let overridden = Config::load_with(&path_str, |k| (k == ENV_PORT).then(|| "/dev/ttyACM1".to_string()))
                .await
                .unwrap();
            assert_eq!(overridden.gsm.port, "/dev/ttyACM1");
        });
    }
}
