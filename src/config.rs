//! Service configuration from environment variables
//!
//! `.env` is loaded by `run()` before this is read, so values may come from
//! either place.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::billing::{ServiceSettings, StripeConfig, DEFAULT_PAUSE_CAP};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8787";
const DEFAULT_STRIPE_API_BASE: &str = "https://api.stripe.com";
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PROVIDER_MAX_RETRIES: u32 = 2;
const DEFAULT_RECONCILE_MAX_PER_MINUTE: usize = 30;
const PROVIDER_RETRY_BASE_DELAY_MS: u64 = 250;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("Could not determine a config directory; set ENTITLEMENTS_DB_PATH")]
    NoConfigDir,
}

/// Everything `run()` needs to start the service
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub stripe: StripeConfig,
    pub service: ServiceSettings,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let db_path = match get("ENTITLEMENTS_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        let bind_addr = parse_or(
            "ENTITLEMENTS_BIND_ADDR",
            get("ENTITLEMENTS_BIND_ADDR"),
            || DEFAULT_BIND_ADDR.parse().ok(),
        )?;

        let secret_key = get("STRIPE_SECRET_KEY").ok_or(ConfigError::Missing("STRIPE_SECRET_KEY"))?;
        let api_base = get("STRIPE_API_BASE").unwrap_or_else(|| DEFAULT_STRIPE_API_BASE.to_string());

        let timeout_secs: u64 = parse_or("PROVIDER_TIMEOUT_SECS", get("PROVIDER_TIMEOUT_SECS"), || {
            Some(DEFAULT_PROVIDER_TIMEOUT_SECS)
        })?;
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "PROVIDER_TIMEOUT_SECS",
                value: "0".to_string(),
            });
        }
        let max_retries: u32 = parse_or("PROVIDER_MAX_RETRIES", get("PROVIDER_MAX_RETRIES"), || {
            Some(DEFAULT_PROVIDER_MAX_RETRIES)
        })?;
        let pause_cap: u32 = parse_or("PAUSE_CAP", get("PAUSE_CAP"), || Some(DEFAULT_PAUSE_CAP))?;
        let reconcile_max_per_minute: usize = parse_or(
            "RECONCILE_MAX_PER_MINUTE",
            get("RECONCILE_MAX_PER_MINUTE"),
            || Some(DEFAULT_RECONCILE_MAX_PER_MINUTE),
        )?;

        let timeout = Duration::from_secs(timeout_secs);
        // Per-request timeout for one HTTP call; the service bounds the
        // whole query (several calls plus retries) with a wider budget
        let total_budget = timeout.saturating_mul(max_retries.saturating_add(1).saturating_mul(3));

        Ok(Self {
            db_path,
            bind_addr,
            stripe: StripeConfig {
                api_base,
                secret_key,
                timeout,
                max_retries,
                base_delay_ms: PROVIDER_RETRY_BASE_DELAY_MS,
            },
            service: ServiceSettings {
                pause_cap,
                reconcile_max_per_minute,
                provider_timeout: total_budget,
            },
        })
    }
}

fn parse_or<T, D>(name: &'static str, raw: Option<String>, default: D) -> Result<T, ConfigError>
where
    T: FromStr,
    D: FnOnce() -> Option<T>,
{
    match raw {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
        None => default().ok_or(ConfigError::Invalid {
            name,
            value: String::new(),
        }),
    }
}

/// `<config dir>/marketplace/entitlements.db`
fn default_db_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("marketplace").join("entitlements.db"))
        .ok_or(ConfigError::NoConfigDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "sk_test_1234567890abcdefghij";

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", KEY),
            ("ENTITLEMENTS_DB_PATH", "/tmp/ent.db"),
        ]))
        .unwrap();

        assert_eq!(config.db_path, PathBuf::from("/tmp/ent.db"));
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8787");
        assert_eq!(config.stripe.api_base, "https://api.stripe.com");
        assert_eq!(config.stripe.timeout, Duration::from_secs(10));
        assert_eq!(config.stripe.max_retries, 2);
        assert_eq!(config.service.pause_cap, 3);
        assert_eq!(config.service.reconcile_max_per_minute, 30);
        assert!(config.service.provider_timeout > config.stripe.timeout);
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", KEY),
            ("ENTITLEMENTS_DB_PATH", "/tmp/ent.db"),
            ("ENTITLEMENTS_BIND_ADDR", "0.0.0.0:9000"),
            ("STRIPE_API_BASE", "http://localhost:12111"),
            ("PROVIDER_TIMEOUT_SECS", "3"),
            ("PROVIDER_MAX_RETRIES", "0"),
            ("PAUSE_CAP", "5"),
            ("RECONCILE_MAX_PER_MINUTE", " 10 "),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.stripe.api_base, "http://localhost:12111");
        assert_eq!(config.stripe.timeout, Duration::from_secs(3));
        assert_eq!(config.stripe.max_retries, 0);
        assert_eq!(config.service.pause_cap, 5);
        assert_eq!(config.service.reconcile_max_per_minute, 10);
    }

    #[test]
    fn test_missing_key() {
        let err = Config::from_lookup(lookup(&[("ENTITLEMENTS_DB_PATH", "/tmp/ent.db")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("STRIPE_SECRET_KEY")));
    }

    #[test]
    fn test_invalid_numbers() {
        let err = Config::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", KEY),
            ("ENTITLEMENTS_DB_PATH", "/tmp/ent.db"),
            ("PAUSE_CAP", "three"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PAUSE_CAP", .. }));

        let err = Config::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", KEY),
            ("ENTITLEMENTS_DB_PATH", "/tmp/ent.db"),
            ("PROVIDER_TIMEOUT_SECS", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PROVIDER_TIMEOUT_SECS", .. }));
    }

    #[test]
    fn test_debug_hides_secret() {
        let config = Config::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", KEY),
            ("ENTITLEMENTS_DB_PATH", "/tmp/ent.db"),
        ]))
        .unwrap();
        assert!(!format!("{:?}", config).contains(KEY));
    }
}
