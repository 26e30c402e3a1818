use std::env;

use anyhow::Context;

use crate::checkout::ShippingPolicy;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub jwt_ttl_hours: i64,
    pub shipping: ShippingPolicy,
    pub concurrency_limit: usize,
    pub body_limit_bytes: usize,
    pub cors_allowed_origins: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").context("DATABASE_URL is not set")?;
        let jwt_secret = lookup("JWT_SECRET")
            .filter(|s| !s.is_empty())
            .context("JWT_SECRET is not set")?;
        let host = lookup("APP_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
        let port = parse_or(&lookup, "APP_PORT", 3000u16);
        let jwt_ttl_hours = parse_or(&lookup, "JWT_TTL_HOURS", 24i64).max(1);

        let flat_fee = parse_or(&lookup, "SHIPPING_FLAT_FEE", 20_000i64).max(0);
        let free_threshold = match lookup("FREE_SHIPPING_THRESHOLD") {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(0) => None,
                Ok(v) if v > 0 => Some(v),
                _ => Some(500_000),
            },
            None => Some(500_000),
        };

        let concurrency_limit = parse_or(&lookup, "CONCURRENCY_LIMIT", 100usize).max(1);
        let body_limit_bytes = parse_or(&lookup, "BODY_LIMIT_BYTES", 1024 * 1024usize);
        let cors_allowed_origins = lookup("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url,
            host,
            port,
            jwt_secret,
            jwt_ttl_hours,
            shipping: ShippingPolicy {
                flat_fee,
                free_threshold,
            },
            concurrency_limit,
            body_limit_bytes,
            cors_allowed_origins,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn applies_defaults() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/market"),
            ("JWT_SECRET", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3000);
        assert_eq!(config.jwt_ttl_hours, 24);
        assert_eq!(config.shipping.flat_fee, 20_000);
        assert_eq!(config.shipping.free_threshold, Some(500_000));
        assert_eq!(config.concurrency_limit, 100);
        assert!(config.cors_allowed_origins.is_empty());
    }

    #[test]
    fn requires_database_url_and_secret() {
        assert!(AppConfig::from_lookup(lookup_from(&[("JWT_SECRET", "s")])).is_err());
        assert!(
            AppConfig::from_lookup(lookup_from(&[("DATABASE_URL", "postgres://x")])).is_err()
        );
    }

    #[test]
    fn zero_threshold_disables_free_shipping() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://x"),
            ("JWT_SECRET", "s"),
            ("FREE_SHIPPING_THRESHOLD", "0"),
            ("APP_PORT", "not-a-port"),
            ("CORS_ALLOWED_ORIGINS", "http://a.test, http://b.test,"),
        ]))
        .unwrap();

        assert_eq!(config.shipping.free_threshold, None);
        assert_eq!(config.port, 3000);
        assert_eq!(
            config.cors_allowed_origins,
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
    }
}
