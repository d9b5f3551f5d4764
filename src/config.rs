//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::relay::retry::RetryPolicy;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Optional JSON rule file. When unset, rules are loaded from the database.
    pub rules_path: Option<PathBuf>,
    /// Telegram bot token.
    pub telegram_token: Option<SecretString>,
    /// Upper bound on concurrent client calls across all events.
    pub max_parallel_sends: usize,
    /// Timeout applied to every single client call.
    pub send_timeout: Duration,
    /// Retry policy for transient client failures.
    pub retry: RetryPolicy,
    /// Quiet period after which a buffered album is considered complete.
    pub album_quiet: Duration,
    /// Delivery records older than this are purged. `None` keeps them forever.
    pub history_retention: Option<Duration>,
    /// Chat that receives operator notifications.
    pub notify_chat: Option<i64>,
    /// Minimum interval between two notifications with the same key.
    pub notify_interval: Duration,
    /// Long-poll timeout for `getUpdates`.
    pub poll_timeout: Duration,
    /// Directory for daily rolling log files, in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/relay.db"),
            rules_path: None,
            telegram_token: None,
            max_parallel_sends: 8,
            send_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            album_quiet: Duration::from_millis(1500),
            history_retention: None,
            notify_chat: None,
            notify_interval: Duration::from_secs(600), // 10 minutes
            poll_timeout: Duration::from_secs(30),
            log_dir: None,
        }
    }
}

impl RelayConfig {
    /// Build the configuration from `RELAY_*` / `TELEGRAM_*` environment variables.
    ///
    /// Unset variables fall back to defaults; set but unparseable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let db_path = std::env::var("RELAY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let rules_path = std::env::var("RELAY_RULES_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from);

        let max_parallel_sends: usize =
            env_parse("RELAY_MAX_PARALLEL_SENDS")?.unwrap_or(defaults.max_parallel_sends);
        if max_parallel_sends == 0 {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_MAX_PARALLEL_SENDS".into(),
                message: "must be at least 1".into(),
            });
        }

        let send_timeout = env_parse::<u64>("RELAY_SEND_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.send_timeout);

        let retry = RetryPolicy {
            max_attempts: env_parse("RELAY_RETRY_MAX_ATTEMPTS")?
                .unwrap_or(defaults.retry.max_attempts)
                .max(1),
            base_delay: env_parse::<u64>("RELAY_RETRY_BASE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: env_parse::<u64>("RELAY_RETRY_MAX_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
        };

        let album_quiet = env_parse::<u64>("RELAY_ALBUM_QUIET_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.album_quiet);

        let history_retention = env_parse::<u64>("RELAY_HISTORY_DAYS")?
            .filter(|days| *days > 0)
            .map(retention_from_days)
            .transpose()?;

        let notify_chat = env_parse::<i64>("RELAY_NOTIFY_CHAT")?;

        let notify_interval = env_parse::<u64>("RELAY_NOTIFY_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.notify_interval);

        let poll_timeout = env_parse::<u64>("RELAY_POLL_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_timeout);

        let log_dir = std::env::var("RELAY_LOG_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            db_path,
            rules_path,
            telegram_token,
            max_parallel_sends,
            send_timeout,
            retry,
            album_quiet,
            history_retention,
            notify_chat,
            notify_interval,
            poll_timeout,
            log_dir,
        })
    }
}

const SECS_PER_DAY: u64 = 24 * 3600;

fn retention_from_days(days: u64) -> Result<Duration, ConfigError> {
    days.checked_mul(SECS_PER_DAY)
        .map(Duration::from_secs)
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "RELAY_HISTORY_DAYS".into(),
            message: format!("{days} days is out of range"),
        })
}

/// Read and parse an optional environment variable.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        Err(_) => Ok(None),
    }
}
