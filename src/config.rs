//! Environment-driven configuration for the production watch service and logging

use std::path::PathBuf;

/// Env var overriding [`ServiceConfig::queue_capacity`].
pub const QUEUE_CAPACITY_ENV: &str = "DIRWATCH_QUEUE_CAPACITY";
/// Env var enabling the rolling file log in the demo binary.
pub const LOG_DIR_ENV: &str = "DIRWATCH_LOG_DIR";

const DEFAULT_QUEUE_CAPACITY: usize = 512;
const DEFAULT_LOG_FILTER: &str = "dirwatch=info";

/// Tuning for [`NotifyWatchService`](crate::production::NotifyWatchService).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Pending batches buffered between the OS callback and `take()`.
    /// Once full, further events are dropped and reported as one overflow.
    pub queue_capacity: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let queue_capacity = match lookup(QUEUE_CAPACITY_ENV) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    tracing::warn!(
                        value = %raw,
                        default = DEFAULT_QUEUE_CAPACITY,
                        "Invalid {}, using default",
                        QUEUE_CAPACITY_ENV
                    );
                    DEFAULT_QUEUE_CAPACITY
                }
            },
            None => DEFAULT_QUEUE_CAPACITY,
        };
        Self { queue_capacity }
    }
}

/// Logging settings for the demo binary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub filter: String,
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            filter: lookup("RUST_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.into()),
            log_dir: lookup(LOG_DIR_ENV)
                .filter(|dir| !dir.trim().is_empty())
                .map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(entries: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_service_config_default() {
        let config = ServiceConfig::from_lookup(lookup(&[]));
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.queue_capacity, 512);
    }

    #[test]
    fn test_service_config_override() {
        let config = ServiceConfig::from_lookup(lookup(&[(QUEUE_CAPACITY_ENV, " 64 ")]));
        assert_eq!(config.queue_capacity, 64);
    }

    #[test]
    fn test_service_config_rejects_zero_and_garbage() {
        let zero = ServiceConfig::from_lookup(lookup(&[(QUEUE_CAPACITY_ENV, "0")]));
        assert_eq!(zero.queue_capacity, 512);

        let garbage = ServiceConfig::from_lookup(lookup(&[(QUEUE_CAPACITY_ENV, "lots")]));
        assert_eq!(garbage.queue_capacity, 512);
    }

    #[test]
    fn test_log_config() {
        let config = LogConfig::from_lookup(lookup(&[]));
        assert_eq!(config.filter, "dirwatch=info");
        assert_eq!(config.log_dir, None);

        let config = LogConfig::from_lookup(lookup(&[
            ("RUST_LOG", "dirwatch=debug"),
            (LOG_DIR_ENV, "/var/log/dirwatch"),
        ]));
        assert_eq!(config.filter, "dirwatch=debug");
        assert_eq!(config.log_dir, Some(PathBuf::from("/var/log/dirwatch")));
    }
}
