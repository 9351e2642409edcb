//! Reconciler configuration.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use cirrus_reconcile::{BackoffPolicy, Poller, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default budget for a cluster to come up.
pub const DEFAULT_CREATE_TIMEOUT: Duration = Duration::from_secs(75 * 60);

/// Default budget for in-place updates to be observed.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default budget for a cluster to terminate.
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Upper bound on any configured timeout, interval or backoff delay.
pub const MAX_CONFIGURED_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Timeouts and polling cadence, per operation class.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Create-wait budget.
    pub create_timeout: Duration,

    /// Update-wait budget. Also bounds the wait for termination protection
    /// to clear before a delete.
    pub update_timeout: Duration,

    /// Delete-wait budget.
    pub delete_timeout: Duration,

    /// Delay between reads that do not satisfy the wait condition.
    pub poll_interval: Duration,

    /// Transient-failure backoff.
    pub backoff: BackoffPolicy,

    /// Log level (trace, debug, info, warn, error) or any `EnvFilter`
    /// directive. `RUST_LOG` overrides it when set.
    pub log_level: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            create_timeout: DEFAULT_CREATE_TIMEOUT,
            update_timeout: DEFAULT_UPDATE_TIMEOUT,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
            poll_interval: cirrus_reconcile::DEFAULT_POLL_INTERVAL,
            backoff: BackoffPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ReconcilerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup. Missing keys take
    /// their defaults; present but malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => {
                    let value: u64 = raw
                        .trim()
                        .parse()
                        .with_context(|| format!("{key} must be a whole number of seconds"))?;
                    Ok(Duration::from_secs(value))
                }
                None => Ok(default),
            }
        };

        let create_timeout = secs("CIRRUS_CREATE_TIMEOUT_SECS", defaults.create_timeout)?;
        let update_timeout = secs("CIRRUS_UPDATE_TIMEOUT_SECS", defaults.update_timeout)?;
        let delete_timeout = secs("CIRRUS_DELETE_TIMEOUT_SECS", defaults.delete_timeout)?;
        let poll_interval = secs("CIRRUS_POLL_INTERVAL_SECS", defaults.poll_interval)?;
        let backoff_max = secs("CIRRUS_BACKOFF_MAX_SECS", DEFAULT_BACKOFF_MAX)?;

        let backoff_base = match lookup("CIRRUS_BACKOFF_BASE_MS") {
            Some(raw) => Duration::from_millis(
                raw.trim()
                    .parse()
                    .context("CIRRUS_BACKOFF_BASE_MS must be a whole number of milliseconds")?,
            ),
            None => DEFAULT_BACKOFF_BASE,
        };

        let log_level = lookup("CIRRUS_LOG_LEVEL").unwrap_or(defaults.log_level);

        for (key, value) in [
            ("CIRRUS_CREATE_TIMEOUT_SECS", create_timeout),
            ("CIRRUS_UPDATE_TIMEOUT_SECS", update_timeout),
            ("CIRRUS_DELETE_TIMEOUT_SECS", delete_timeout),
            ("CIRRUS_POLL_INTERVAL_SECS", poll_interval),
            ("CIRRUS_BACKOFF_BASE_MS", backoff_base),
            ("CIRRUS_BACKOFF_MAX_SECS", backoff_max),
        ] {
            if value > MAX_CONFIGURED_DURATION {
                bail!("{key} exceeds the maximum of {MAX_CONFIGURED_DURATION:?}");
            }
        }
        EnvFilter::try_new(&log_level)
            .with_context(|| format!("CIRRUS_LOG_LEVEL {log_level:?} is not a valid filter"))?;
        if poll_interval.is_zero() {
            bail!("CIRRUS_POLL_INTERVAL_SECS must be greater than zero");
        }
        if backoff_base > backoff_max {
            bail!(
                "backoff base ({backoff_base:?}) exceeds backoff ceiling ({backoff_max:?})"
            );
        }

        Ok(Self {
            create_timeout,
            update_timeout,
            delete_timeout,
            poll_interval,
            backoff: BackoffPolicy {
                base: backoff_base,
                max: backoff_max,
                ..defaults.backoff
            },
            log_level,
        })
    }

    /// Filter for this config's log level, unless `RUST_LOG` is set.
    pub fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.log_level)
                .with_context(|| format!("invalid log level {:?}", self.log_level)),
        }
    }

    /// Install a global fmt subscriber filtered by [`env_filter`](Self::env_filter).
    pub fn init_tracing(&self) -> Result<()> {
        tracing_subscriber::registry()
            .with(self.env_filter()?)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("failed to install tracing subscriber")
    }

    /// Poller carrying this config's interval and backoff. Callers set the
    /// timeout per wait.
    pub fn poller(&self) -> Poller {
        Poller::new(self.update_timeout, self.poll_interval).with_backoff(self.backoff.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ReconcilerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ReconcilerConfig::default());
        assert_eq!(config.create_timeout, Duration::from_secs(4500));
        assert_eq!(config.delete_timeout, Duration::from_secs(1200));
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = ReconcilerConfig::from_lookup(lookup(&[
            ("CIRRUS_CREATE_TIMEOUT_SECS", "600"),
            ("CIRRUS_POLL_INTERVAL_SECS", "5"),
            ("CIRRUS_BACKOFF_BASE_MS", "250"),
            ("CIRRUS_LOG_LEVEL", "debug"),
        ]))
        .unwrap();
        assert_eq!(config.create_timeout, Duration::from_secs(600));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.backoff.base, Duration::from_millis(250));
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.poller().poll_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_malformed_value_is_rejected() {
        let err = ReconcilerConfig::from_lookup(lookup(&[("CIRRUS_DELETE_TIMEOUT_SECS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("CIRRUS_DELETE_TIMEOUT_SECS"));
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        for key in ["CIRRUS_CREATE_TIMEOUT_SECS", "CIRRUS_BACKOFF_MAX_SECS"] {
            let err = ReconcilerConfig::from_lookup(lookup(&[(key, "18446744073709551615")]))
                .unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }

        let week = MAX_CONFIGURED_DURATION.as_secs().to_string();
        let config =
            ReconcilerConfig::from_lookup(lookup(&[("CIRRUS_DELETE_TIMEOUT_SECS", week.as_str())]))
                .unwrap();
        assert_eq!(config.delete_timeout, MAX_CONFIGURED_DURATION);
    }

    #[test]
    fn test_invalid_log_level_is_rejected() {
        let err = ReconcilerConfig::from_lookup(lookup(&[("CIRRUS_LOG_LEVEL", "cirrus=loud")]))
            .unwrap_err();
        assert!(err.to_string().contains("CIRRUS_LOG_LEVEL"));

        let config =
            ReconcilerConfig::from_lookup(lookup(&[("CIRRUS_LOG_LEVEL", "cirrus_cluster=trace")]))
                .unwrap();
        assert_eq!(config.log_level, "cirrus_cluster=trace");
    }

    #[test]
    fn test_zero_poll_interval_is_rejected() {
        assert!(
            ReconcilerConfig::from_lookup(lookup(&[("CIRRUS_POLL_INTERVAL_SECS", "0")])).is_err()
        );
    }
}
