//! Engine and replica configuration.
//!
//! Values come from code defaults, a serialized config, or `TALLY_*`
//! environment variables. A missing replica URL is fatal: the engine refuses
//! to start rather than silently running without a remote.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{TallyError, TallyResult};

pub const ENV_REPLICA_URL: &str = "TALLY_REPLICA_URL";
pub const ENV_REPLICA_AUTH_TOKEN: &str = "TALLY_REPLICA_AUTH_TOKEN";
pub const ENV_IDLE_INTERVAL_MS: &str = "TALLY_IDLE_INTERVAL_MS";
pub const ENV_URGENT_INTERVAL_MS: &str = "TALLY_URGENT_INTERVAL_MS";
pub const ENV_SETTLE_DELAY_MS: &str = "TALLY_SETTLE_DELAY_MS";

const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_URGENT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Sync cadence with no outstanding deletions.
    #[serde(default = "default_idle_interval", with = "millis")]
    pub idle_interval: Duration,
    /// Sync cadence while local deletions wait to reach the remote.
    #[serde(default = "default_urgent_interval", with = "millis")]
    pub urgent_interval: Duration,
    /// Delay before the follow-up cycle after a delete or leaving edit mode.
    #[serde(default = "default_settle_delay", with = "millis")]
    pub settle_delay: Duration,
}

fn default_idle_interval() -> Duration {
    DEFAULT_IDLE_INTERVAL
}

fn default_urgent_interval() -> Duration {
    DEFAULT_URGENT_INTERVAL
}

fn default_settle_delay() -> Duration {
    DEFAULT_SETTLE_DELAY
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_interval: DEFAULT_IDLE_INTERVAL,
            urgent_interval: DEFAULT_URGENT_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> TallyResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> TallyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(ms) = parse_millis(&lookup, ENV_IDLE_INTERVAL_MS)? {
            config.idle_interval = ms;
        }
        if let Some(ms) = parse_millis(&lookup, ENV_URGENT_INTERVAL_MS)? {
            config.urgent_interval = ms;
        }
        if let Some(ms) = parse_millis(&lookup, ENV_SETTLE_DELAY_MS)? {
            config.settle_delay = ms;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TallyResult<()> {
        if self.urgent_interval.is_zero() || self.idle_interval.is_zero() {
            return Err(TallyError::Config(
                "sync intervals must be greater than zero".to_string(),
            ));
        }
        if self.urgent_interval > self.idle_interval {
            return Err(TallyError::Config(format!(
                "urgent interval ({:?}) must not exceed idle interval ({:?})",
                self.urgent_interval, self.idle_interval
            )));
        }
        Ok(())
    }

    pub fn interval_for(&self, urgent: bool) -> Duration {
        if urgent {
            self.urgent_interval
        } else {
            self.idle_interval
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,
}

impl ReplicaConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
        }
    }

    pub fn from_env() -> TallyResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> TallyResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup(ENV_REPLICA_URL)
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| TallyError::Config(format!("{} must be set", ENV_REPLICA_URL)))?;

        Ok(Self {
            url,
            auth_token: lookup(ENV_REPLICA_AUTH_TOKEN).filter(|t| !t.is_empty()),
        })
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> TallyResult<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| TallyError::Config(format!("{} is not a number: {:?}", key, raw))),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_keep_idle_double_urgent() {
        let config = EngineConfig::default();
        assert_eq!(config.idle_interval, config.urgent_interval * 2);
        assert_eq!(config.interval_for(true), Duration::from_secs(5));
        assert_eq!(config.interval_for(false), Duration::from_secs(10));
    }

    #[test]
    fn test_engine_config_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_IDLE_INTERVAL_MS, "2000"),
            (ENV_URGENT_INTERVAL_MS, "1000"),
        ]))
        .unwrap();
        assert_eq!(config.idle_interval, Duration::from_millis(2000));
        assert_eq!(config.urgent_interval, Duration::from_millis(1000));
        assert_eq!(config.settle_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_engine_config_rejects_garbage() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_SETTLE_DELAY_MS, "soon")])).unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));

        let err = EngineConfig::from_lookup(lookup(&[
            (ENV_IDLE_INTERVAL_MS, "100"),
            (ENV_URGENT_INTERVAL_MS, "500"),
        ]))
        .unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));
    }

    #[test]
    fn test_replica_url_is_required() {
        let err = ReplicaConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, TallyError::Config(_)));

        let config = ReplicaConfig::from_lookup(lookup(&[
            (ENV_REPLICA_URL, "sqlite:replica.db"),
            (ENV_REPLICA_AUTH_TOKEN, "secret"),
        ]))
        .unwrap();
        assert_eq!(config.url, "sqlite:replica.db");
        assert_eq!(config.auth_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_engine_config_deserializes_millis() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"idle_interval": 4000, "urgent_interval": 2000}"#).unwrap();
        assert_eq!(config.idle_interval, Duration::from_secs(4));
        assert_eq!(config.urgent_interval, Duration::from_secs(2));
        assert_eq!(config.settle_delay, DEFAULT_SETTLE_DELAY);
    }
}
