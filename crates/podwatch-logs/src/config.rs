use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use podwatch_types::SearchOptions;

use crate::error::{Result, WatchError};

/// Default number of lines kept per pod
pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Default depth of the live event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;

/// Default number of historical lines requested on first connect
pub const DEFAULT_TAIL_LINES: i64 = 100;

/// Watcher settings, loadable from TOML.
///
/// ```toml
/// buffer_capacity = 5000
/// tail_lines = 200
///
/// [backoff]
/// initial_ms = 250
/// max_ms = 10000
///
/// [search]
/// case_sensitive = true
/// ```
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherConfig {
    /// Lines retained per pod before the oldest are evicted
    pub buffer_capacity: usize,

    /// Live events a subscriber may fall behind before it starts losing lines
    pub event_capacity: usize,

    /// History requested when a pod is first watched (`None` = everything)
    pub tail_lines: Option<i64>,

    /// Reconnect policy
    pub backoff: BackoffConfig,

    /// Search defaults for callers that do not pass their own options
    pub search: SearchOptions,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            tail_lines: Some(DEFAULT_TAIL_LINES),
            backoff: BackoffConfig::default(),
            search: SearchOptions::default(),
        }
    }
}

impl WatcherConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(WatchError::Config("buffer_capacity must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(WatchError::Config("event_capacity must be at least 1".into()));
        }
        if let Some(n) = self.tail_lines {
            if n < 0 {
                return Err(WatchError::Config("tail_lines must not be negative".into()));
            }
        }
        self.backoff.validate()
    }
}

/// Exponential backoff between reconnect attempts
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            ..Default::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_ms`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(64) as i32);
        let ms = (self.initial_ms as f64 * factor).min(self.max_ms as f64);
        Duration::from_millis(ms as u64)
    }

    fn validate(&self) -> Result<()> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(WatchError::Config("backoff.multiplier must be >= 1.0".into()));
        }
        if self.max_ms < self.initial_ms {
            return Err(WatchError::Config(
                "backoff.max_ms must not be below backoff.initial_ms".into(),
            ));
        }
        Ok(())
    }
}
