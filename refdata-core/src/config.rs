//! Configuration types
//!
//! Every section has development defaults, a `from_env()` constructor reading
//! `REFDATA_*` variables, and is validated as part of [`RefdataConfig::validate`].

use crate::constants::*;
use crate::{ConfigError, RefdataResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

fn min_duration(field: &str, value: Duration, min: Duration) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: format!("{:?}", value),
            reason: format!("{} must be at least {:?}", field, min),
        });
    }
    Ok(())
}

fn min_count(field: &str, value: usize, min: usize) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: format!("{} must be at least {}", field, min),
        });
    }
    Ok(())
}

// ============================================================================
// WRITE CONSISTENCY
// ============================================================================

/// WAIT_COMMIT submission settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// How long a WAIT_COMMIT submission waits before returning PENDING
    pub wait_commit_timeout: Duration,
    /// Status re-check tick while waiting
    pub commit_poll_interval: Duration,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            wait_commit_timeout: Duration::from_millis(DEFAULT_WAIT_COMMIT_TIMEOUT_MS),
            commit_poll_interval: Duration::from_millis(DEFAULT_COMMIT_POLL_INTERVAL_MS),
        }
    }
}

impl ConsistencyConfig {
    /// Environment variables:
    /// - `REFDATA_WAIT_COMMIT_TIMEOUT_MS` (default: 300)
    /// - `REFDATA_COMMIT_POLL_INTERVAL_MS` (default: 10)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            wait_commit_timeout: env_millis("REFDATA_WAIT_COMMIT_TIMEOUT_MS")
                .unwrap_or(defaults.wait_commit_timeout),
            commit_poll_interval: env_millis("REFDATA_COMMIT_POLL_INTERVAL_MS")
                .unwrap_or(defaults.commit_poll_interval),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        min_duration(
            "consistency.wait_commit_timeout",
            self.wait_commit_timeout,
            Duration::from_millis(MIN_WAIT_COMMIT_TIMEOUT_MS),
        )?;
        min_duration(
            "consistency.commit_poll_interval",
            self.commit_poll_interval,
            Duration::from_millis(1),
        )
    }
}

// ============================================================================
// READ CONSISTENCY
// ============================================================================

/// Version-barrier read settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// How long a barrier read waits for the cache before falling back
    pub wait_for_reload: Duration,
    /// Re-check tick while waiting for a snapshot swap
    pub reload_poll_interval: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            wait_for_reload: Duration::from_millis(DEFAULT_WAIT_FOR_RELOAD_MS),
            reload_poll_interval: Duration::from_millis(DEFAULT_RELOAD_POLL_INTERVAL_MS),
        }
    }
}

impl QueryConfig {
    /// Environment variables:
    /// - `REFDATA_WAIT_FOR_RELOAD_MS` (default: 100)
    /// - `REFDATA_RELOAD_POLL_INTERVAL_MS` (default: 5)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            wait_for_reload: env_millis("REFDATA_WAIT_FOR_RELOAD_MS")
                .unwrap_or(defaults.wait_for_reload),
            reload_poll_interval: env_millis("REFDATA_RELOAD_POLL_INTERVAL_MS")
                .unwrap_or(defaults.reload_poll_interval),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        min_duration("query.wait_for_reload", self.wait_for_reload, Duration::from_millis(1))?;
        min_duration(
            "query.reload_poll_interval",
            self.reload_poll_interval,
            Duration::from_millis(1),
        )
    }
}

// ============================================================================
// OUTBOX / CACHE / DISPATCHER
// ============================================================================

/// Outbox relay settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_OUTBOX_POLL_INTERVAL_MS),
            batch_size: DEFAULT_OUTBOX_BATCH_SIZE,
        }
    }
}

impl OutboxConfig {
    /// Environment variables:
    /// - `REFDATA_OUTBOX_POLL_INTERVAL_MS` (default: 50)
    /// - `REFDATA_OUTBOX_BATCH_SIZE` (default: 200)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_millis("REFDATA_OUTBOX_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            batch_size: env_parse("REFDATA_OUTBOX_BATCH_SIZE").unwrap_or(defaults.batch_size),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        min_duration("outbox.poll_interval", self.poll_interval, Duration::from_millis(1))?;
        min_count("outbox.batch_size", self.batch_size, 1)
    }
}

/// Query cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum concurrent background reloads
    pub reload_parallelism: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reload_parallelism: DEFAULT_RELOAD_PARALLELISM,
        }
    }
}

impl CacheConfig {
    /// Environment variables:
    /// - `REFDATA_RELOAD_PARALLELISM` (default: 8)
    pub fn from_env() -> Self {
        Self {
            reload_parallelism: env_parse("REFDATA_RELOAD_PARALLELISM")
                .unwrap_or(DEFAULT_RELOAD_PARALLELISM),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        min_count("cache.reload_parallelism", self.reload_parallelism, 1)
    }
}

/// Command dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upper bound on draining partition queues at shutdown
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(DEFAULT_DISPATCHER_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl DispatcherConfig {
    /// Environment variables:
    /// - `REFDATA_DISPATCHER_SHUTDOWN_TIMEOUT_SECS` (default: 5)
    pub fn from_env() -> Self {
        Self {
            shutdown_timeout: env_parse::<u64>("REFDATA_DISPATCHER_SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(DEFAULT_DISPATCHER_SHUTDOWN_TIMEOUT_SECS)),
        }
    }
}

// ============================================================================
// BUS
// ============================================================================

/// Which invalidation bus variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BusKind {
    /// In-process fan-out
    #[default]
    Local,
    /// Pub/sub push plus replayable log with background recovery
    Durable,
}

impl std::str::FromStr for BusKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(BusKind::Local),
            "durable" => Ok(BusKind::Durable),
            other => Err(ConfigError::InvalidValue {
                field: "bus.kind".to_string(),
                value: other.to_string(),
                reason: "expected 'local' or 'durable'".to_string(),
            }),
        }
    }
}

/// Invalidation bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    pub kind: BusKind,
    /// Interval of the durable log recovery loop
    pub recovery_poll_interval: Duration,
    /// Max log records read per recovery tick
    pub recovery_batch_size: usize,
    /// Log position recovery starts after (0 = from the beginning)
    pub start_position: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::Local,
            recovery_poll_interval: Duration::from_millis(DEFAULT_RECOVERY_POLL_INTERVAL_MS),
            recovery_batch_size: DEFAULT_RECOVERY_BATCH_SIZE,
            start_position: 0,
        }
    }
}

impl BusConfig {
    /// Environment variables:
    /// - `REFDATA_BUS_KIND`: `local` or `durable` (default: local)
    /// - `REFDATA_BUS_RECOVERY_POLL_INTERVAL_MS` (default: 1000)
    /// - `REFDATA_BUS_RECOVERY_BATCH_SIZE` (default: 500)
    /// - `REFDATA_BUS_START_POSITION` (default: 0)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            kind: env_parse("REFDATA_BUS_KIND").unwrap_or(defaults.kind),
            recovery_poll_interval: env_millis("REFDATA_BUS_RECOVERY_POLL_INTERVAL_MS")
                .unwrap_or(defaults.recovery_poll_interval),
            recovery_batch_size: env_parse("REFDATA_BUS_RECOVERY_BATCH_SIZE")
                .unwrap_or(defaults.recovery_batch_size),
            start_position: env_parse("REFDATA_BUS_START_POSITION")
                .unwrap_or(defaults.start_position),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        min_duration(
            "bus.recovery_poll_interval",
            self.recovery_poll_interval,
            Duration::from_millis(MIN_RECOVERY_POLL_INTERVAL_MS),
        )?;
        min_count("bus.recovery_batch_size", self.recovery_batch_size, 1)
    }
}

// ============================================================================
// DICTIONARIES
// ============================================================================

/// One configured dictionary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryConfig {
    pub code: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DictionaryConfig {
    pub fn enabled(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            enabled: true,
        }
    }

    pub fn disabled(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            enabled: false,
        }
    }
}

/// Parse `COUNTRY,CURRENCY,-LEGACY` into dictionary configs.
/// A leading `-` marks the dictionary as disabled.
pub fn parse_dictionary_list(raw: &str) -> Vec<DictionaryConfig> {
    raw.split(',')
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(|code| match code.strip_prefix('-') {
            Some(disabled) => DictionaryConfig::disabled(disabled.trim()),
            None => DictionaryConfig::enabled(code),
        })
        .collect()
}

// ============================================================================
// MASTER CONFIG
// ============================================================================

/// Master configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RefdataConfig {
    pub consistency: ConsistencyConfig,
    pub query: QueryConfig,
    pub outbox: OutboxConfig,
    pub cache: CacheConfig,
    pub bus: BusConfig,
    pub dispatcher: DispatcherConfig,
    pub dictionaries: Vec<DictionaryConfig>,
}

impl RefdataConfig {
    /// Defaults with the given dictionaries registered and enabled.
    pub fn with_dictionaries<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dictionaries: codes.into_iter().map(DictionaryConfig::enabled).collect(),
            ..Self::default()
        }
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// `REFDATA_DICTIONARIES` is a comma-separated list of dictionary codes.
    pub fn from_env() -> Self {
        Self {
            consistency: ConsistencyConfig::from_env(),
            query: QueryConfig::from_env(),
            outbox: OutboxConfig::from_env(),
            cache: CacheConfig::from_env(),
            bus: BusConfig::from_env(),
            dispatcher: DispatcherConfig::from_env(),
            dictionaries: std::env::var("REFDATA_DICTIONARIES")
                .map(|raw| parse_dictionary_list(&raw))
                .unwrap_or_default(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> RefdataResult<()> {
        self.consistency.validate()?;
        self.query.validate()?;
        self.outbox.validate()?;
        self.cache.validate()?;
        self.bus.validate()?;
        for dict in &self.dictionaries {
            if dict.code.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "dictionaries.code".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}
