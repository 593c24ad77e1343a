//! Gateway configuration.

use std::time::Duration;

/// Rate limit pair: requests per minute and per hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    /// Requests allowed per minute.
    pub per_minute: u32,
    /// Requests allowed per hour.
    pub per_hour: u32,
}

impl RateLimit {
    /// Parse the `RATE_LIMIT_DEFAULT` format, e.g. `100/min;1000/hour`.
    /// Malformed values fall back to the default.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut limit = Self::default();
        for part in value.split(';') {
            let Some((count, unit)) = part.trim().split_once('/') else {
                continue;
            };
            let Ok(count) = count.trim().parse::<u32>() else {
                continue;
            };
            match unit.trim() {
                "min" | "minute" => limit.per_minute = count,
                "hour" => limit.per_hour = count,
                _ => {}
            }
        }
        limit
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            per_minute: 100,
            per_hour: 1000,
        }
    }
}

/// Configuration for the gateway service.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address (e.g. `0.0.0.0:8080`).
    pub listen_addr: String,
    /// Data directory for the store and the default secrets backend.
    pub data_dir: String,
    /// Shared secret for session cookies and CSRF-adjacent uses.
    pub secret_key: String,
    /// Shared secret JWTs are signed with.
    pub jwt_secret_key: String,
    /// Allowed CORS origins.
    pub cors_origins: Vec<String>,
    /// Redis URL for shared rate limit counters; in-process fallback when
    /// unset.
    pub redis_url: Option<String>,
    /// Default per-IP rate limit.
    pub rate_limit: RateLimit,
    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,
}

impl GatewayConfig {
    /// Load the configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns a message naming the missing variable; startup treats this
    /// as fatal (exit code 1).
    pub fn from_env() -> Result<Self, String> {
        let secret_key =
            std::env::var("SECRET_KEY").map_err(|_| "SECRET_KEY is required".to_string())?;
        let jwt_secret_key = std::env::var("JWT_SECRET_KEY")
            .map_err(|_| "JWT_SECRET_KEY is required".to_string())?;

        Ok(Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into()),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "/var/lib/gough".into()),
            secret_key,
            jwt_secret_key,
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_else(|_| vec!["*".to_string()]),
            redis_url: std::env::var("REDIS_URL").ok(),
            rate_limit: std::env::var("RATE_LIMIT_DEFAULT")
                .map(|v| RateLimit::parse(&v))
                .unwrap_or_default(),
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
        })
    }

    /// The request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_parse() {
        let limit = RateLimit::parse("100/min;1000/hour");
        assert_eq!(limit.per_minute, 100);
        assert_eq!(limit.per_hour, 1000);

        let limit = RateLimit::parse("250/min");
        assert_eq!(limit.per_minute, 250);
        assert_eq!(limit.per_hour, 1000);

        assert_eq!(RateLimit::parse("garbage"), RateLimit::default());
    }
}
