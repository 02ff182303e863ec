//! gh-ost migration tuning.
//!
//! Defaults match the conservative settings used for production MySQL
//! fleets. Individual migrations can override a subset of knobs with an
//! inline directive comment in the statement:
//!
//! ```sql
//! -- ghost: max-lag=3s chunk-size=500
//! ALTER TABLE orders ADD COLUMN note TEXT
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Tuning knobs for gh-ost style online migrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GhostConfig {
    /// Rows copied per chunk.
    pub chunk_size: u64,
    /// DML events applied per batch during binlog replay.
    pub dml_batch_size: u64,
    /// Interval between heartbeat/copy ticks.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Maximum tolerated heartbeat or replication lag for cutover to
    /// proceed.
    #[serde(with = "humantime_serde")]
    pub max_lag: Duration,
    /// Maximum time the cutover may hold table locks. The gate also refuses
    /// to open while lag exceeds this, since the rename would then outlast
    /// its lock budget.
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
    /// How many times the cutover gate is rechecked before giving up.
    pub cutover_retries: u32,
    /// Ceiling for the copy process's exponential retry backoff.
    #[serde(with = "humantime_serde")]
    pub backoff_max_interval: Duration,
    /// Interval between cutover gate checks.
    #[serde(with = "humantime_serde")]
    pub gate_interval: Duration,
    /// Interval between progress polls during the sync phase.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Directory holding postpone flag files.
    pub flag_dir: PathBuf,
}

impl Default for GhostConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            dml_batch_size: 10,
            heartbeat_interval: Duration::from_millis(100),
            max_lag: Duration::from_millis(1500),
            lock_timeout: Duration::from_secs(60),
            cutover_retries: 60,
            backoff_max_interval: Duration::from_secs(64),
            gate_interval: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            flag_dir: std::env::temp_dir(),
        }
    }
}

impl GhostConfig {
    /// Returns this config with any inline `-- ghost:` directives from the
    /// statement applied on top.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStatement`] on unknown keys or unparseable
    /// values.
    pub fn with_directives(&self, statement: &str) -> Result<Self> {
        let mut config = self.clone();
        for line in statement.lines() {
            let Some(rest) = line.trim().strip_prefix("-- ghost:") else {
                continue;
            };
            for pair in rest.split_whitespace() {
                let (key, value) = pair.split_once('=').ok_or_else(|| {
                    Error::InvalidStatement {
                        message: format!("ghost directive `{pair}` is not key=value"),
                    }
                })?;
                match key {
                    "chunk-size" => config.chunk_size = parse_u64(key, value)?,
                    "dml-batch-size" => config.dml_batch_size = parse_u64(key, value)?,
                    "max-lag" => config.max_lag = parse_duration(key, value)?,
                    "lock-timeout" => config.lock_timeout = parse_duration(key, value)?,
                    "backoff-max" => config.backoff_max_interval = parse_duration(key, value)?,
                    "cutover-retries" => {
                        config.cutover_retries =
                            u32::try_from(parse_u64(key, value)?).map_err(|_| {
                                Error::InvalidStatement {
                                    message: format!("ghost directive `{key}` out of range"),
                                }
                            })?;
                    }
                    other => {
                        return Err(Error::InvalidStatement {
                            message: format!("unknown ghost directive `{other}`"),
                        });
                    }
                }
            }
        }
        Ok(config)
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| Error::InvalidStatement {
        message: format!("ghost directive `{key}={value}` is not a number"),
    })
}

fn parse_duration(key: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|_| Error::InvalidStatement {
        message: format!("ghost directive `{key}={value}` is not a duration"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = GhostConfig::default();
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.max_lag, Duration::from_millis(1500));
        assert_eq!(config.lock_timeout, Duration::from_secs(60));
        assert_eq!(config.cutover_retries, 60);
        assert_eq!(config.backoff_max_interval, Duration::from_secs(64));
    }

    #[test]
    fn directives_override_defaults() {
        let statement =
            "-- ghost: max-lag=3s chunk-size=500 backoff-max=10s\nALTER TABLE orders ADD COLUMN note TEXT";
        let config = GhostConfig::default().with_directives(statement).unwrap();
        assert_eq!(config.max_lag, Duration::from_secs(3));
        assert_eq!(config.chunk_size, 500);
        assert_eq!(config.backoff_max_interval, Duration::from_secs(10));
        // Untouched knobs keep their defaults.
        assert_eq!(config.lock_timeout, Duration::from_secs(60));
    }

    #[test]
    fn statement_without_directives_is_unchanged() {
        let config = GhostConfig::default()
            .with_directives("ALTER TABLE orders ADD COLUMN note TEXT")
            .unwrap();
        assert_eq!(config.chunk_size, GhostConfig::default().chunk_size);
    }

    #[test]
    fn unknown_directive_is_rejected() {
        let err = GhostConfig::default()
            .with_directives("-- ghost: throttle-flag=/tmp/x")
            .unwrap_err();
        assert!(err.to_string().contains("throttle-flag"));
    }

    #[test]
    fn malformed_value_is_rejected() {
        assert!(GhostConfig::default()
            .with_directives("-- ghost: chunk-size=lots")
            .is_err());
        assert!(GhostConfig::default()
            .with_directives("-- ghost: max-lag=soon")
            .is_err());
        assert!(GhostConfig::default()
            .with_directives("-- ghost: chunk-size")
            .is_err());
    }
}
