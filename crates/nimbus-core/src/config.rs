// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Configuration loading from environment variables.

use std::time::Duration;

/// Nimbus Core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL; None selects in-memory storage
    pub database_url: Option<String>,
    /// Accounting consumers draining the shared record channel
    pub accounting_consumers: usize,
    /// Accounting batch size limit
    pub accounting_batch_size: usize,
    /// Maximum time a partial accounting batch may wait
    pub accounting_max_delay: Duration,
    /// Maximum billed wall time per owner or project; None disables quota
    pub quota_max_usage: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `NIMBUS_DATABASE_URL`: PostgreSQL connection string (default: in-memory)
    /// - `NIMBUS_ACCOUNTING_CONSUMERS`: parallel batch writers (default: 4)
    /// - `NIMBUS_ACCOUNTING_BATCH_SIZE`: max records per batch (default: 1000)
    /// - `NIMBUS_ACCOUNTING_MAX_DELAY_MS`: max batching delay (default: 500)
    /// - `NIMBUS_QUOTA_MAX_USAGE_HOURS`: per-wallet compute quota (default: unlimited)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("NIMBUS_DATABASE_URL").ok();

        let accounting_consumers: usize = std::env::var("NIMBUS_ACCOUNTING_CONSUMERS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("NIMBUS_ACCOUNTING_CONSUMERS", "must be a positive integer")
            })?;
        if accounting_consumers == 0 {
            return Err(ConfigError::Invalid(
                "NIMBUS_ACCOUNTING_CONSUMERS",
                "must be a positive integer",
            ));
        }

        let accounting_batch_size: usize = std::env::var("NIMBUS_ACCOUNTING_BATCH_SIZE")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("NIMBUS_ACCOUNTING_BATCH_SIZE", "must be a positive integer")
            })?;
        if accounting_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "NIMBUS_ACCOUNTING_BATCH_SIZE",
                "must be a positive integer",
            ));
        }

        let accounting_max_delay_ms: u64 = std::env::var("NIMBUS_ACCOUNTING_MAX_DELAY_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "NIMBUS_ACCOUNTING_MAX_DELAY_MS",
                    "must be a duration in milliseconds",
                )
            })?;

        let quota_max_usage = match std::env::var("NIMBUS_QUOTA_MAX_USAGE_HOURS") {
            Ok(raw) => {
                let hours: u64 = raw.parse().map_err(|_| {
                    ConfigError::Invalid("NIMBUS_QUOTA_MAX_USAGE_HOURS", "must be a whole number of hours")
                })?;
                Some(Duration::from_secs(hours * 3600))
            }
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            accounting_consumers,
            accounting_batch_size,
            accounting_max_delay: Duration::from_millis(accounting_max_delay_ms),
            quota_max_usage,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_all(guard: &mut EnvGuard) {
        guard.remove("NIMBUS_DATABASE_URL");
        guard.remove("NIMBUS_ACCOUNTING_CONSUMERS");
        guard.remove("NIMBUS_ACCOUNTING_BATCH_SIZE");
        guard.remove("NIMBUS_ACCOUNTING_MAX_DELAY_MS");
        guard.remove("NIMBUS_QUOTA_MAX_USAGE_HOURS");
    }

    #[test]
    fn test_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        let config = Config::from_env().unwrap();

        assert!(config.database_url.is_none());
        assert_eq!(config.accounting_consumers, 4);
        assert_eq!(config.accounting_batch_size, 1000);
        assert_eq!(config.accounting_max_delay, Duration::from_millis(500));
        assert!(config.quota_max_usage.is_none());
    }

    #[test]
    fn test_config_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        guard.set("NIMBUS_DATABASE_URL", "postgres://user:pass@db:5432/nimbus");
        guard.set("NIMBUS_ACCOUNTING_CONSUMERS", "8");
        guard.set("NIMBUS_ACCOUNTING_BATCH_SIZE", "250");
        guard.set("NIMBUS_ACCOUNTING_MAX_DELAY_MS", "100");
        guard.set("NIMBUS_QUOTA_MAX_USAGE_HOURS", "2000");

        let config = Config::from_env().unwrap();

        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://user:pass@db:5432/nimbus")
        );
        assert_eq!(config.accounting_consumers, 8);
        assert_eq!(config.accounting_batch_size, 250);
        assert_eq!(config.accounting_max_delay, Duration::from_millis(100));
        assert_eq!(
            config.quota_max_usage,
            Some(Duration::from_secs(2000 * 3600))
        );
    }

    #[test]
    fn test_config_invalid_consumers() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        guard.set("NIMBUS_ACCOUNTING_CONSUMERS", "not_a_number");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("NIMBUS_ACCOUNTING_CONSUMERS", _))
        ));

        guard.set("NIMBUS_ACCOUNTING_CONSUMERS", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("NIMBUS_ACCOUNTING_CONSUMERS", _))
        ));
    }

    #[test]
    fn test_config_invalid_batch_size() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        guard.set("NIMBUS_ACCOUNTING_BATCH_SIZE", "0");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("NIMBUS_ACCOUNTING_BATCH_SIZE", _))
        ));
    }

    #[test]
    fn test_config_invalid_quota() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clear_all(&mut guard);

        guard.set("NIMBUS_QUOTA_MAX_USAGE_HOURS", "-5");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("NIMBUS_QUOTA_MAX_USAGE_HOURS", _))
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
