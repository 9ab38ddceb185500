//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use chorus_core::day_key::DayCalendar;
use chorus_core::error::CoreError;
use chorus_core::scheduling::{BackoffPolicy, PRIORITY_NORMAL};
use chorus_economy::EconomyConfig;
use chorus_queue::config::DEFAULT_PROVIDER_TIMEOUT_FLOOR;
use chorus_queue::QueueConfig;

use crate::admission::PriorityPolicy;

/// Hour of the local day at which unused free-tier tokens are rotated.
pub const DEFAULT_ROTATION_HOUR: u32 = 23;

/// How often the daily scheduler checks for day boundaries.
pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Core(#[from] CoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Everything the binary needs to wire the broker together.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub queue: QueueConfig,
    pub provider_url: String,
    pub provider_api_key: Option<String>,
    /// `None` means no analytics feed: every day gets a zero contribution.
    pub contribution_url: Option<String>,
    pub economy: EconomyConfig,
    pub calendar: DayCalendar,
    pub rotation_hour: u32,
    pub scheduler_interval: Duration,
    pub default_priority: i32,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                       | Default               |
    /// |-------------------------------|-----------------------|
    /// | `DATABASE_URL`                | required              |
    /// | `DATABASE_MAX_CONNECTIONS`    | `10`                  |
    /// | `WORKER_CONCURRENCY`          | `5`                   |
    /// | `POLL_INTERVAL_MS`            | `1000`                |
    /// | `MAX_ATTEMPTS`                | `3`                   |
    /// | `BACKOFF_BASE_SECS`           | `2`                   |
    /// | `BACKOFF_MAX_SECS`            | `300`                 |
    /// | `STALL_TIMEOUT_SECS`          | `600`                 |
    /// | `STALL_CHECK_INTERVAL_SECS`   | `60`                  |
    /// | `HEARTBEAT_INTERVAL_SECS`     | `30`                  |
    /// | `PROVIDER_URL`                | required              |
    /// | `PROVIDER_API_KEY`            | unset                 |
    /// | `PROVIDER_TIMEOUT_FLOOR_SECS` | `60`                  |
    /// | `CONTRIBUTION_URL`            | unset (zero)          |
    /// | `BASE_FREE_TOKENS`            | `1000`                |
    /// | `BASE_PAID_TOKENS`            | `500`                 |
    /// | `DAY_KEY_UTC_OFFSET_HOURS`    | `0`                   |
    /// | `ROTATION_HOUR`               | `23`                  |
    /// | `SCHEDULER_INTERVAL_SECS`     | `60`                  |
    /// | `DEFAULT_PRIORITY`            | `10`                  |
    /// | `LOG_FORMAT`                  | `pretty` (or `json`)  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = QueueConfig::default();
        let economy_defaults = EconomyConfig::default();

        let backoff = BackoffPolicy::new(
            env.secs_or("BACKOFF_BASE_SECS", defaults.backoff.base)?,
            env.secs_or("BACKOFF_MAX_SECS", defaults.backoff.max)?,
        )?;
        let queue = QueueConfig {
            concurrency: env.parse_or("WORKER_CONCURRENCY", defaults.concurrency)?,
            poll_interval: Duration::from_millis(
                env.parse_or("POLL_INTERVAL_MS", defaults.poll_interval.as_millis() as u64)?,
            ),
            max_attempts: env.parse_or("MAX_ATTEMPTS", defaults.max_attempts)?,
            backoff,
            stall_timeout: env.secs_or("STALL_TIMEOUT_SECS", defaults.stall_timeout)?,
            stall_check_interval: env.secs_or("STALL_CHECK_INTERVAL_SECS", defaults.stall_check_interval)?,
            heartbeat_interval: env.secs_or("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            provider_timeout_floor: env
                .secs_or("PROVIDER_TIMEOUT_FLOOR_SECS", DEFAULT_PROVIDER_TIMEOUT_FLOOR)?,
        };
        queue.validate()?;

        let economy = EconomyConfig {
            base_free: env.parse_or("BASE_FREE_TOKENS", economy_defaults.base_free)?,
            base_paid: env.parse_or("BASE_PAID_TOKENS", economy_defaults.base_paid)?,
        };
        if economy.base_free < 0 || economy.base_paid < 0 {
            return Err(CoreError::Config("Base token amounts must not be negative".to_string()).into());
        }

        let rotation_hour = env.parse_or("ROTATION_HOUR", DEFAULT_ROTATION_HOUR)?;
        if rotation_hour > 23 {
            return Err(ConfigError::Invalid {
                var: "ROTATION_HOUR",
                value: rotation_hour.to_string(),
                reason: "must be between 0 and 23".to_string(),
            });
        }

        let log_format = match env.get("LOG_FORMAT").as_deref() {
            None | Some("pretty") | Some("text") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "LOG_FORMAT",
                    value: other.to_string(),
                    reason: "expected `pretty` or `json`".to_string(),
                })
            }
        };

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            db_max_connections: env.parse_or("DATABASE_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
            queue,
            provider_url: env.required("PROVIDER_URL")?,
            provider_api_key: env.get("PROVIDER_API_KEY"),
            contribution_url: env.get("CONTRIBUTION_URL"),
            economy,
            calendar: DayCalendar::with_offset_hours(env.parse_or("DAY_KEY_UTC_OFFSET_HOURS", 0)?)?,
            rotation_hour,
            scheduler_interval: env.secs_or("SCHEDULER_INTERVAL_SECS", DEFAULT_SCHEDULER_INTERVAL)?,
            default_priority: env.parse_or("DEFAULT_PRIORITY", PRIORITY_NORMAL)?,
            log_format,
        })
    }

    /// Admission priority policy built from `DEFAULT_PRIORITY`.
    pub fn priority_policy(&self) -> PriorityPolicy {
        PriorityPolicy::new(self.default_priority)
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Value of `name`, treating empty strings as unset.
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn parse_or<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: name,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs_or(&self, name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(Duration::from_secs(self.parse_or(name, default.as_secs())?))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|name| vars.get(name).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("DATABASE_URL", "postgres://localhost/chorus"),
        ("PROVIDER_URL", "http://provider:8080"),
    ];

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&REQUIRED).unwrap();
        assert_eq!(config.queue, QueueConfig::default());
        assert_eq!(config.economy, EconomyConfig::default());
        assert_eq!(config.rotation_hour, DEFAULT_ROTATION_HOUR);
        assert_eq!(config.default_priority, PRIORITY_NORMAL);
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(config.contribution_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("WORKER_CONCURRENCY", "8"),
            ("POLL_INTERVAL_MS", "250"),
            ("BACKOFF_BASE_SECS", "1"),
            ("BACKOFF_MAX_SECS", "60"),
            ("LOG_FORMAT", "json"),
            ("CONTRIBUTION_URL", "http://analytics"),
            ("DAY_KEY_UTC_OFFSET_HOURS", "-5"),
            ("DEFAULT_PRIORITY", "3"),
        ]);
        let config = load(&vars).unwrap();
        assert_eq!(config.queue.concurrency, 8);
        assert_eq!(config.queue.poll_interval, Duration::from_millis(250));
        assert_eq!(config.queue.backoff.max, Duration::from_secs(60));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.contribution_url.as_deref(), Some("http://analytics"));
        assert_eq!(config.priority_policy(), PriorityPolicy::new(3));
    }

    #[test]
    fn missing_database_url_is_reported() {
        assert_matches!(
            load(&[("PROVIDER_URL", "http://p")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("MAX_ATTEMPTS", "three"));
        assert_matches!(load(&vars), Err(ConfigError::Invalid { var: "MAX_ATTEMPTS", .. }));
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("ROTATION_HOUR", "24"));
        assert_matches!(load(&vars), Err(ConfigError::Invalid { var: "ROTATION_HOUR", .. }));

        let mut vars = REQUIRED.to_vec();
        vars.push(("WORKER_CONCURRENCY", "0"));
        assert_matches!(load(&vars), Err(ConfigError::Core(CoreError::Config(_))));

        let mut vars = REQUIRED.to_vec();
        vars.push(("DAY_KEY_UTC_OFFSET_HOURS", "20"));
        assert_matches!(load(&vars), Err(ConfigError::Core(CoreError::Config(_))));
    }
}
