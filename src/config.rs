//! Run configuration, threaded through the constructors of every component.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Worker count used on shared CI runners.
pub const CI_WORKERS: usize = 10;
/// Worker count everywhere else.
pub const DEFAULT_WORKERS: usize = 25;

/// How hard the API client tries before giving up on a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per logical request. Rate-limit cooldowns are not counted.
    pub max_attempts: u32,
    /// Unit of the exponential backoff: attempt `n` waits `base * 2^n`.
    pub backoff_base: Duration,
    /// Fixed wait after a 429 response.
    pub rate_limit_cooldown: Duration,
    /// Upper bound on a single HTTP exchange. An unanswered request fails
    /// as a transport error once this passes.
    pub request_timeout: Duration,
    /// Upper bound on handing one message to the notification sink.
    pub notify_timeout: Duration,
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            rate_limit_cooldown: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HarvestConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    pub relay_url: Option<String>,
    pub webhook_url: Option<String>,
    pub data_dir: PathBuf,
    pub build_dir: PathBuf,
}

impl HarvestConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("database.sqlite3")
    }
}

fn default_workers(on_ci: bool) -> usize {
    if on_ci {
        CI_WORKERS
    } else {
        DEFAULT_WORKERS
    }
}

/// Command-line interface of the harvester binary.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "comic-harvest",
    about = "Harvests chapter upload times and renders one JSON file per comic"
)]
pub struct Cli {
    /// Concurrent requests per stage (defaults to 10 on CI, 25 elsewhere)
    #[arg(long, env = "HARVEST_WORKERS")]
    pub workers: Option<usize>,

    /// Relay endpoint; the real URL is passed to it as the `url` query parameter
    #[arg(long, env = "HARVEST_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Webhook receiving rate-limit, retry and failure notifications
    #[arg(long, env = "HARVEST_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Attempts per request before giving up
    #[arg(long, env = "HARVEST_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Seconds before an unanswered request counts as failed
    #[arg(long, env = "HARVEST_REQUEST_TIMEOUT", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Directory holding the SQLite store
    #[arg(long, env = "HARVEST_DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Directory receiving the rendered JSON files
    #[arg(long, env = "HARVEST_BUILD_DIR", default_value = "build")]
    pub build_dir: PathBuf,
}

impl Cli {
    pub fn into_config(self) -> HarvestConfig {
        let on_ci = std::env::var_os("CI").is_some();
        if on_ci {
            tracing::info!("CI is enabled");
        }
        HarvestConfig {
            workers: self.workers.unwrap_or_else(|| default_workers(on_ci)).max(1),
            retry: RetryPolicy {
                max_attempts: self.max_retries.max(1),
                request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
                ..RetryPolicy::default()
            },
            relay_url: self.relay_url.filter(|url| !url.trim().is_empty()),
            webhook_url: self.webhook_url.filter(|url| !url.trim().is_empty()),
            data_dir: self.data_dir,
            build_dir: self.build_dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn ci_gets_smaller_pool() {
        assert_eq!(default_workers(true), CI_WORKERS);
        assert_eq!(default_workers(false), DEFAULT_WORKERS);
        assert!(CI_WORKERS < DEFAULT_WORKERS);
    }

    #[test]
    fn blank_addresses_disable_features() {
        let cli = Cli::parse_from([
            "comic-harvest",
            "--workers",
            "4",
            "--relay-url",
            " ",
            "--webhook-url",
            "",
            "--request-timeout-secs",
            "5",
        ]);
        let config = cli.into_config();
        assert_eq!(config.workers, 4);
        assert_eq!(config.retry.request_timeout, Duration::from_secs(5));
        assert!(config.relay_url.is_none());
        assert!(config.webhook_url.is_none());
        assert_eq!(config.database_path(), PathBuf::from("data/database.sqlite3"));
    }
}
