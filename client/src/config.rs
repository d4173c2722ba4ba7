//! Configuration for the sync runtime.

use listsync_engine::{BackoffPolicy, RetryBudgets};
use std::env;
use std::time::Duration;

/// Tuning for the sync engine, the queue and the conflict resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Periodic drain interval (gated on connectivity)
    pub interval: Duration,
    /// Changes per batch within one entity group
    pub batch_size: usize,
    /// Pause between consecutive batches of one group
    pub batch_delay: Duration,
    /// Transient failures tolerated per change before it is marked failed
    pub max_retries: u32,
    /// Wait before a change that failed transiently is sent again
    pub retry_backoff: BackoffPolicy,
    /// Upper bound of the random jitter added to each retry wait
    pub retry_jitter: Duration,
    /// Entity groups processed concurrently
    pub workers: usize,
    pub mapping_ttl: Duration,
    pub sweep_interval: Duration,
    /// Conflict records buffered before a history flush
    pub conflict_flush_threshold: usize,
    pub conflict_retention: Duration,
    pub resolver_attempts: u32,
    pub resolver_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_size: 10,
            batch_delay: Duration::from_millis(100),
            max_retries: 3,
            retry_backoff: BackoffPolicy {
                base: Duration::from_secs(2),
                max: Duration::from_secs(120),
            },
            retry_jitter: Duration::from_millis(500),
            workers: 4,
            mapping_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            conflict_flush_threshold: 10,
            conflict_retention: Duration::from_secs(30 * 24 * 60 * 60),
            resolver_attempts: 3,
            resolver_delay: Duration::from_millis(100),
        }
    }
}

impl SyncConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch(mut self, size: usize, delay: Duration) -> Self {
        self.batch_size = size.max(1);
        self.batch_delay = delay;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration, jitter: Duration) -> Self {
        self.retry_backoff = BackoffPolicy { base, max };
        self.retry_jitter = jitter;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_mapping_ttl(mut self, ttl: Duration) -> Self {
        self.mapping_ttl = ttl;
        self
    }

    pub fn with_conflict_flush_threshold(mut self, threshold: usize) -> Self {
        self.conflict_flush_threshold = threshold.max(1);
        self
    }

    pub fn with_resolver_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.resolver_attempts = attempts.max(1);
        self.resolver_delay = delay;
        self
    }
}

/// Tuning for the realtime connection manager.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    /// Pre-flight health probe timeout
    pub probe_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Upper bound of the random jitter added to each reconnect delay
    pub max_jitter: Duration,
    pub budgets: RetryBudgets,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(25),
            pong_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            max_jitter: Duration::from_secs(1),
            budgets: RetryBudgets::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn with_timeouts(mut self, connect: Duration, probe: Duration) -> Self {
        self.connect_timeout = connect;
        self.probe_timeout = probe;
        self
    }

    pub fn with_health_check(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
        self.ping_interval = ping_interval;
        self.pong_timeout = pong_timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff = BackoffPolicy { base, max };
        self
    }

    pub fn with_max_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn with_budgets(mut self, budgets: RetryBudgets) -> Self {
        self.budgets = budgets;
        self
    }
}

/// Daemon configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the remote API
    pub api_url: String,
    /// WebSocket endpoint of the realtime channel
    pub realtime_url: String,
    /// SQLite connection URL
    pub database_url: String,
    pub auth_token: Option<String>,
    pub sync: SyncConfig,
    pub connection: ConnectionConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = env::var("LISTSYNC_API_URL").map_err(|_| ConfigError::MissingApiUrl)?;
        let realtime_url =
            env::var("LISTSYNC_REALTIME_URL").map_err(|_| ConfigError::MissingRealtimeUrl)?;

        let database_url = env::var("LISTSYNC_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://listsync.db?mode=rwc".to_string());

        let interval = env::var("LISTSYNC_SYNC_INTERVAL_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::InvalidSyncInterval)?;

        let auth_token = env::var("LISTSYNC_AUTH_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            realtime_url,
            database_url,
            auth_token,
            sync: SyncConfig::default().with_interval(Duration::from_secs(interval)),
            connection: ConnectionConfig::default(),
        })
    }

    /// Health endpoint used for the pre-flight connectivity probe.
    pub fn health_url(&self) -> String {
        format!("{}/health", self.api_url)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("LISTSYNC_API_URL environment variable is required")]
    MissingApiUrl,

    #[error("LISTSYNC_REALTIME_URL environment variable is required")]
    MissingRealtimeUrl,

    #[error("Invalid LISTSYNC_SYNC_INTERVAL_SECS value")]
    InvalidSyncInterval,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}
