use std::time::Duration;

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres ledger when set, in-memory ledger otherwise
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    /// Mirror every lifecycle event to Redis pub/sub when set
    pub redis_url: Option<String>,
    pub metrics_port: u16,
    /// Upper bound on a single command, ledger I/O included
    pub command_timeout: Duration,
    /// How long an assign waits for the per-order lock
    pub assign_lock_timeout: Duration,
    /// Per-channel broadcast buffer before slow subscribers lag
    pub channel_capacity: usize,
    pub publish_max_attempts: u32,
    /// Full reload period for subscriber views
    pub view_resync_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            redis_url: None,
            metrics_port: 9090,
            command_timeout: Duration::from_millis(5000),
            assign_lock_timeout: Duration::from_millis(2000),
            channel_capacity: 256,
            publish_max_attempts: 3,
            view_resync_interval: Duration::from_millis(30_000),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "Unparseable setting, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(name, default.as_millis() as u64))
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", defaults.db_max_connections),
            redis_url: std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
            metrics_port: env_parse("METRICS_PORT", defaults.metrics_port),
            command_timeout: env_millis("COMMAND_TIMEOUT_MS", defaults.command_timeout),
            assign_lock_timeout: env_millis("ASSIGN_LOCK_TIMEOUT_MS", defaults.assign_lock_timeout),
            channel_capacity: env_parse("CHANNEL_CAPACITY", defaults.channel_capacity).max(1),
            publish_max_attempts: env_parse("PUBLISH_MAX_ATTEMPTS", defaults.publish_max_attempts).max(1),
            view_resync_interval: env_millis("VIEW_RESYNC_INTERVAL_MS", defaults.view_resync_interval),
        }
    }
}
