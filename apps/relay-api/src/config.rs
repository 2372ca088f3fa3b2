use std::collections::HashSet;
use std::time::Duration;

use relay_common::id::{prefix, prefixed_ulid};

/// Whether rate-limit counters are kept per connection or per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitScope {
    Connection,
    User,
}

impl RateLimitScope {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "connection" => Some(Self::Connection),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// Rate limiter tunables.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Ceiling of events per window.
    pub max_events: u64,
    /// Fixed window length.
    pub window: Duration,
    pub scope: RateLimitScope,
    /// Admit events when the shared store is unreachable.
    pub fail_open: bool,
    /// User ids that bypass the counter entirely.
    pub allowlist: HashSet<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_events: 100,
            window: Duration::from_secs(60),
            scope: RateLimitScope::Connection,
            fail_open: false,
            allowlist: HashSet::new(),
        }
    }
}

/// Relay configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// HMAC secret used to verify bearer JWTs issued by the auth service.
    pub jwt_secret: String,
    /// Redis connection string. When unset the relay runs single-process
    /// with an in-memory store.
    pub redis_url: Option<String>,
    /// Identifies this process on the cross-process relay channel.
    pub server_id: String,
    /// Document service origin used for room authorization.
    pub access_api_url: Option<String>,
    pub rate_limit: RateLimitConfig,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Consecutive dropped deliveries before a connection is force-closed.
    pub slow_consumer_limit: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Panics with a descriptive message if a required variable is missing.
    pub fn from_env() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            port: parsed_var("PORT").unwrap_or(4010),
            jwt_secret: required_var("JWT_SECRET"),
            redis_url: optional_var("REDIS_URL"),
            server_id: optional_var("SERVER_ID")
                .unwrap_or_else(|| prefixed_ulid(prefix::SERVER)),
            access_api_url: optional_var("ACCESS_API_URL"),
            rate_limit: RateLimitConfig {
                max_events: parsed_var("RATE_LIMIT_MAX_EVENTS").unwrap_or(defaults.max_events),
                window: parsed_var("RATE_LIMIT_WINDOW_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.window),
                scope: optional_var("RATE_LIMIT_SCOPE")
                    .and_then(|v| RateLimitScope::parse(&v))
                    .unwrap_or(defaults.scope),
                fail_open: parsed_var("RATE_LIMIT_FAIL_OPEN").unwrap_or(defaults.fail_open),
                allowlist: optional_var("RATE_LIMIT_ALLOWLIST")
                    .map(|v| parse_list(&v))
                    .unwrap_or_default(),
            },
            outbound_buffer: parsed_var("OUTBOUND_BUFFER").unwrap_or(256),
            slow_consumer_limit: parsed_var("SLOW_CONSUMER_LIMIT").unwrap_or(64),
        }
    }

    /// A config suitable for tests and local tooling: no Redis, no remote
    /// access service.
    pub fn local(jwt_secret: &str) -> Self {
        Self {
            port: 0,
            jwt_secret: jwt_secret.to_string(),
            redis_url: None,
            server_id: prefixed_ulid(prefix::SERVER),
            access_api_url: None,
            rate_limit: RateLimitConfig::default(),
            outbound_buffer: 256,
            slow_consumer_limit: 64,
        }
    }
}

fn required_var(name: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| panic!("{name} env var is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_list(value: &str) -> HashSet<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parses_case_insensitively() {
        assert_eq!(RateLimitScope::parse("User"), Some(RateLimitScope::User));
        assert_eq!(
            RateLimitScope::parse(" connection "),
            Some(RateLimitScope::Connection)
        );
        assert_eq!(RateLimitScope::parse("room"), None);
    }

    #[test]
    fn allowlist_skips_blank_entries() {
        let list = parse_list("u1, ,u2,,");
        assert_eq!(list.len(), 2);
        assert!(list.contains("u1"));
        assert!(list.contains("u2"));
    }

    #[test]
    fn local_config_uses_documented_defaults() {
        let config = Config::local("secret");
        assert_eq!(config.rate_limit.max_events, 100);
        assert_eq!(config.rate_limit.window, Duration::from_secs(60));
        assert!(!config.rate_limit.fail_open);
        assert!(config.redis_url.is_none());
        assert!(config.server_id.starts_with("srv_"));
    }
}
