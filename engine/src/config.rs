//! Configuration for the queue and the local cache.

use std::env;
use std::time::Duration;

/// Command queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Bound on the remote branch of a read
    pub remote_timeout: Duration,
    /// Delay before the first retry of a transient failure
    pub retry_delay: Duration,
    /// Upper bound for the exponential retry delay
    pub max_retry_delay: Duration,
    /// Buffered events per subscriber
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            remote_timeout: Duration::from_millis(5000),
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_millis(30_000),
            event_capacity: 256,
        }
    }
}

impl QueueConfig {
    /// Load settings from `PARADE_*` environment variables, falling back to
    /// the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            remote_timeout: millis("PARADE_REMOTE_TIMEOUT_MS")?.unwrap_or(defaults.remote_timeout),
            retry_delay: millis("PARADE_RETRY_DELAY_MS")?.unwrap_or(defaults.retry_delay),
            max_retry_delay: millis("PARADE_MAX_RETRY_DELAY_MS")?
                .unwrap_or(defaults.max_retry_delay),
            event_capacity: number("PARADE_EVENT_CAPACITY")?.unwrap_or(defaults.event_capacity),
        })
    }

    /// Delay before retry number `attempts` (1-based).
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.retry_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_retry_delay)
    }
}

/// Local cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Byte budget of the key/value cache
    pub byte_budget: usize,
    /// Bound on link hops while resolving a key path
    pub max_link_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            byte_budget: 5 * 1024 * 1024,
            max_link_depth: crate::local::DEFAULT_MAX_LINK_DEPTH,
        }
    }
}

impl CacheConfig {
    /// Load settings from `PARADE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            byte_budget: number("PARADE_CACHE_BYTES")?.unwrap_or(defaults.byte_budget),
            max_link_depth: number("PARADE_MAX_LINK_DEPTH")?.unwrap_or(defaults.max_link_depth),
        })
    }
}

fn number(name: &'static str) -> Result<Option<usize>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(None),
    }
}

fn millis(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(number(name)?.map(|ms| Duration::from_millis(ms as u64)))
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {name}")]
    Invalid { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = QueueConfig {
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_millis(1000),
            ..QueueConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(4), Duration::from_millis(800));
        assert_eq!(config.backoff(5), Duration::from_millis(1000));
        assert_eq!(config.backoff(500), Duration::from_millis(1000));
    }

    #[test]
    fn env_overrides_and_errors() {
        // No other test reads these variables.
        env::set_var("PARADE_CACHE_BYTES", "2048");
        env::set_var("PARADE_MAX_LINK_DEPTH", "four");

        let err = CacheConfig::from_env().unwrap_err();
        assert_eq!(err.to_string(), "invalid value 'four' for PARADE_MAX_LINK_DEPTH");

        env::set_var("PARADE_MAX_LINK_DEPTH", "4");
        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.byte_budget, 2048);
        assert_eq!(config.max_link_depth, 4);

        env::remove_var("PARADE_CACHE_BYTES");
        env::remove_var("PARADE_MAX_LINK_DEPTH");
    }
}
