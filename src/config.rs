//! Configuration types.
//!
//! Everything is read from the environment once at startup. `Default` yields
//! the documented defaults so tests can build configs without touching env.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default admission ceiling.
pub const DEFAULT_MAX_ACTIVE_SESSIONS: usize = 3;
/// Default drain tick period.
pub const DEFAULT_DRAIN_INTERVAL_MS: u64 = 10_000;
/// Default first reconnect delay.
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 2_000;
/// Default reconnect budget.
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 5;
/// Queue the workers read jobs from.
pub const DEFAULT_OUTBOUND_QUEUE: &str = "job_results_webapp";
/// Queue the workers publish results to.
pub const DEFAULT_INBOUND_QUEUE: &str = "image_generation_webapp";

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of concurrently active sessions.
    pub max_active_sessions: usize,
    /// Period of the overflow drain task.
    pub drain_interval: Duration,
    pub broker: BrokerSettings,
    pub server: ServerConfig,
    /// Path of the libSQL job ledger.
    pub db_path: String,
    /// Directory for rolling log files (stderr only when unset).
    pub log_dir: Option<String>,
}

/// Broker endpoint, queue names and reconnect policy.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// AMQP URI. Usually carries credentials, so it is never logged.
    pub endpoint: SecretString,
    pub outbound_queue: String,
    pub inbound_queue: String,
    pub reconnect: ReconnectPolicy,
}

/// Bounded exponential backoff for the reconnect chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

/// HTTP front door settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// CORS origin. Any origin is allowed when unset.
    pub allowed_origin: Option<String>,
}

impl ReconnectPolicy {
    /// Delay after the `failed_attempt`-th consecutive failure (1-based).
    ///
    /// `base * 2^(n-1)`: 2s, 4s, 8s, 16s with the default base.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            endpoint: SecretString::from("amqp://127.0.0.1:5672/%2f"),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE.to_string(),
            inbound_queue: DEFAULT_INBOUND_QUEUE.to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            allowed_origin: None,
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: DEFAULT_MAX_ACTIVE_SESSIONS,
            drain_interval: Duration::from_millis(DEFAULT_DRAIN_INTERVAL_MS),
            broker: BrokerSettings::default(),
            server: ServerConfig::default(),
            db_path: "./data/job-dispatch.db".to_string(),
            log_dir: None,
        }
    }
}

impl DispatchConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let endpoint = get("CLOUDAMQP_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("CLOUDAMQP_URL".to_string()))?;

        let max_active_sessions = positive(
            "MAX_ACTIVE_SESSIONS",
            parse_or(&get, "MAX_ACTIVE_SESSIONS", DEFAULT_MAX_ACTIVE_SESSIONS)?,
        )?;
        let drain_interval_ms = positive(
            "DRAIN_INTERVAL_MS",
            parse_or(&get, "DRAIN_INTERVAL_MS", DEFAULT_DRAIN_INTERVAL_MS)?,
        )?;
        let base_delay_ms = positive(
            "RECONNECT_BASE_DELAY_MS",
            parse_or(&get, "RECONNECT_BASE_DELAY_MS", DEFAULT_RECONNECT_BASE_DELAY_MS)?,
        )?;
        let max_attempts = positive(
            "RECONNECT_MAX_ATTEMPTS",
            parse_or(&get, "RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS)?,
        )?;
        let port = parse_or(&get, "PORT", defaults.server.port)?;

        Ok(Self {
            max_active_sessions,
            drain_interval: Duration::from_millis(drain_interval_ms),
            broker: BrokerSettings {
                endpoint: SecretString::from(endpoint),
                outbound_queue: get("BROKER_OUTBOUND_QUEUE")
                    .unwrap_or(defaults.broker.outbound_queue),
                inbound_queue: get("BROKER_INBOUND_QUEUE").unwrap_or(defaults.broker.inbound_queue),
                reconnect: ReconnectPolicy {
                    base_delay: Duration::from_millis(base_delay_ms),
                    max_attempts,
                },
            },
            server: ServerConfig {
                port,
                allowed_origin: get("ALLOWED_ORIGIN"),
            },
            db_path: get("DISPATCH_DB_PATH").unwrap_or(defaults.db_path),
            log_dir: get("LOG_DIR"),
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

fn positive<T>(key: &str, value: T) -> Result<T, ConfigError>
where
    T: PartialOrd + Default,
{
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_endpoint_set() {
        let config =
            DispatchConfig::from_lookup(lookup(&[("CLOUDAMQP_URL", "amqp://broker/vh")])).unwrap();

        assert_eq!(config.max_active_sessions, 3);
        assert_eq!(config.drain_interval, Duration::from_secs(10));
        assert_eq!(config.broker.reconnect.base_delay, Duration::from_secs(2));
        assert_eq!(config.broker.reconnect.max_attempts, 5);
        assert_eq!(config.broker.outbound_queue, "job_results_webapp");
        assert_eq!(config.broker.inbound_queue, "image_generation_webapp");
        assert_eq!(config.broker.endpoint.expose_secret(), "amqp://broker/vh");
        assert_eq!(config.server.port, 3001);
        assert!(config.server.allowed_origin.is_none());
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        let err = DispatchConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(key) if key == "CLOUDAMQP_URL"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("CLOUDAMQP_URL", "amqp://broker"),
            ("MAX_ACTIVE_SESSIONS", "8"),
            ("DRAIN_INTERVAL_MS", "250"),
            ("RECONNECT_BASE_DELAY_MS", "100"),
            ("RECONNECT_MAX_ATTEMPTS", "2"),
            ("BROKER_OUTBOUND_QUEUE", "jobs"),
            ("BROKER_INBOUND_QUEUE", "results"),
            ("ALLOWED_ORIGIN", "https://app.example"),
        ]))
        .unwrap();

        assert_eq!(config.max_active_sessions, 8);
        assert_eq!(config.drain_interval, Duration::from_millis(250));
        assert_eq!(
            config.broker.reconnect,
            ReconnectPolicy {
                base_delay: Duration::from_millis(100),
                max_attempts: 2,
            }
        );
        assert_eq!(config.broker.outbound_queue, "jobs");
        assert_eq!(config.broker.inbound_queue, "results");
        assert_eq!(
            config.server.allowed_origin.as_deref(),
            Some("https://app.example")
        );
    }

    #[test]
    fn garbage_and_zero_values_are_rejected() {
        let err = DispatchConfig::from_lookup(lookup(&[
            ("CLOUDAMQP_URL", "amqp://broker"),
            ("MAX_ACTIVE_SESSIONS", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "MAX_ACTIVE_SESSIONS"));

        let err = DispatchConfig::from_lookup(lookup(&[
            ("CLOUDAMQP_URL", "amqp://broker"),
            ("RECONNECT_MAX_ATTEMPTS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "RECONNECT_MAX_ATTEMPTS"));
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(policy.delay_after(4), Duration::from_secs(16));
    }
}
