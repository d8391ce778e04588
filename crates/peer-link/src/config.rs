use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::session::RetryPolicy;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_MAX_FILE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Settings for one peer-side coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkConfig {
    /// STUN/TURN urls handed to the channel provider. Empty means host
    /// candidates only.
    pub ice_servers: Vec<String>,
    /// Retry schedule for candidates that arrive before the remote description.
    pub retry: RetryPolicy,
    /// Largest inbound file accepted at `file-start`.
    pub max_file_bytes: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            retry: RetryPolicy::default(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

impl LinkConfig {
    /// Defaults overridden by `PEERDROP_ICE_SERVERS` (comma separated),
    /// `PEERDROP_CANDIDATE_RETRY_MS`, `PEERDROP_CANDIDATE_MAX_ATTEMPTS` and
    /// `PEERDROP_MAX_FILE_BYTES`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = match std::env::var("PEERDROP_ICE_SERVERS") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.ice_servers,
        };
        let interval_ms = parse_env(
            "PEERDROP_CANDIDATE_RETRY_MS",
            defaults.retry.interval.as_millis() as u64,
            1,
        );
        let max_attempts = parse_env(
            "PEERDROP_CANDIDATE_MAX_ATTEMPTS",
            defaults.retry.max_attempts,
            1,
        );
        let max_file_bytes = parse_env("PEERDROP_MAX_FILE_BYTES", defaults.max_file_bytes, 1);
        Self {
            ice_servers,
            retry: RetryPolicy {
                interval: Duration::from_millis(interval_ms),
                max_attempts,
                ..defaults.retry
            },
            max_file_bytes,
        }
    }
}

fn parse_env<T>(var: &str, default: T, min: T) -> T
where
    T: FromStr + PartialOrd + Copy + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(value) => match value.trim().parse::<T>() {
            Ok(parsed) if parsed >= min => parsed,
            Ok(parsed) => {
                warn!(
                    target: "peer_link::config",
                    var, %parsed, %min, %default, "value below minimum; using default"
                );
                default
            }
            Err(err) => {
                warn!(
                    target: "peer_link::config",
                    var,
                    error = %err,
                    %default,
                    "failed to parse value from env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.retry.interval, Duration::from_secs(1));
        assert_eq!(config.max_file_bytes, 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn unset_env_falls_back() {
        assert_eq!(parse_env("PEERDROP_TEST_UNSET_VARIABLE", 7u32, 1), 7);
    }
}
