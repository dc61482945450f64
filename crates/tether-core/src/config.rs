//! configuration
//!
//! Every field has a default, so an empty TOML file (or none at all) yields a
//! working configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub timing: TimingConfig,
    pub options: OptionSets,
    pub discovery: DiscoveryConfig,
    pub transport: TransportConfig,
}

/// intervals and timeouts
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// host heartbeat publish interval
    pub heartbeat_interval_ms: u64,
    /// silence after which a client considers the host gone
    pub heartbeat_timeout_ms: u64,
    /// how often the client compares silence against the timeout
    pub watchdog_interval_ms: u64,
    /// abort a connection attempt after this long
    pub connect_timeout_ms: u64,
    /// countdown ticks before the game starts
    pub countdown_ticks: u32,
    /// countdown and active-session tick period
    pub tick_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 3_000,
            watchdog_interval_ms: 3_000,
            connect_timeout_ms: 10_000,
            countdown_ticks: 3,
            tick_interval_ms: 1_000,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// the durations and bets a session may use
///
/// Received session data outside these sets is rejected.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionSets {
    pub durations_minutes: Vec<u32>,
    pub bet_amounts: Vec<u64>,
    pub default_duration_minutes: u32,
    pub default_bet_amount: u64,
}

impl Default for OptionSets {
    fn default() -> Self {
        Self {
            durations_minutes: vec![5, 10, 15, 20, 25],
            bet_amounts: vec![5, 10, 15, 20, 25],
            default_duration_minutes: 15,
            default_bet_amount: 15,
        }
    }
}

impl OptionSets {
    pub fn allows_duration(&self, minutes: u32) -> bool {
        minutes > 0 && self.durations_minutes.contains(&minutes)
    }

    pub fn allows_bet(&self, amount: u64) -> bool {
        amount > 0 && self.bet_amounts.contains(&amount)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// characters of the host name carried in the advertisement
    pub name_budget: usize,
    /// total advertised local-name budget in bytes
    pub max_local_name_bytes: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            name_budget: 8,
            max_local_name_bytes: 29,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// largest chunk returned by a single offset read
    pub max_transfer_size: usize,
    /// participants required before the host may start
    pub min_participants: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_transfer_size: 182,
            min_participants: 2,
        }
    }
}

impl TetherConfig {
    /// load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timing;
        if t.heartbeat_interval_ms == 0
            || t.heartbeat_timeout_ms == 0
            || t.watchdog_interval_ms == 0
            || t.tick_interval_ms == 0
            || t.connect_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("intervals must be non-zero".into()));
        }
        if t.heartbeat_timeout_ms < t.heartbeat_interval_ms {
            return Err(ConfigError::Invalid(
                "heartbeat timeout shorter than heartbeat interval".into(),
            ));
        }

        let o = &self.options;
        if o.durations_minutes.is_empty() || o.bet_amounts.is_empty() {
            return Err(ConfigError::Invalid("option sets must not be empty".into()));
        }
        if o.durations_minutes.contains(&0) || o.bet_amounts.contains(&0) {
            return Err(ConfigError::Invalid("options must be positive".into()));
        }
        if !o.allows_duration(o.default_duration_minutes) {
            return Err(ConfigError::Invalid(format!(
                "default duration {} not in option set",
                o.default_duration_minutes
            )));
        }
        if !o.allows_bet(o.default_bet_amount) {
            return Err(ConfigError::Invalid(format!(
                "default bet {} not in option set",
                o.default_bet_amount
            )));
        }

        if self.discovery.name_budget == 0 {
            return Err(ConfigError::Invalid("name budget must be non-zero".into()));
        }
        if self.transport.max_transfer_size == 0 {
            return Err(ConfigError::Invalid("max transfer size must be non-zero".into()));
        }
        if self.transport.min_participants == 0 {
            return Err(ConfigError::Invalid("min participants must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TetherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.heartbeat_interval_ms, 1_000);
        assert_eq!(config.timing.heartbeat_timeout_ms, 3_000);
        assert_eq!(config.timing.connect_timeout_ms, 10_000);
        assert_eq!(config.timing.countdown_ticks, 3);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = TetherConfig::from_toml_str("").unwrap();
        assert_eq!(config, TetherConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = TetherConfig::from_toml_str(
            r#"
            [timing]
            heartbeat_timeout_ms = 5000

            [options]
            bet_amounts = [10, 50]
            default_bet_amount = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.timing.heartbeat_timeout_ms, 5_000);
        assert_eq!(config.timing.heartbeat_interval_ms, 1_000);
        assert!(config.options.allows_bet(50));
        assert!(!config.options.allows_bet(15));
    }

    #[test]
    fn test_rejects_default_outside_set() {
        let err = TetherConfig::from_toml_str(
            r#"
            [options]
            bet_amounts = [10, 50]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_short_timeout() {
        let mut config = TetherConfig::default();
        config.timing.heartbeat_timeout_ms = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "[timing]\ncountdown_ticks = 5\n").unwrap();

        let config = TetherConfig::load(&path).unwrap();
        assert_eq!(config.timing.countdown_ticks, 5);

        let missing = TetherConfig::load(dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
    }
}
