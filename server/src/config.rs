use std::env;
use std::time::Duration;

/// Server configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite record store.
    pub db_path: String,
    /// How long a connection may go without any traffic before it is closed
    /// (treated as an implicit leave).
    pub client_timeout: Duration,
    /// How long a session may sit with no connections before its coordinator
    /// is torn down.
    pub eviction_timeout: Duration,
    /// Oldest a roll record may grow before the retention sweep removes it.
    pub retention_age: Duration,
    /// How often the retention sweep runs.
    pub sweep_interval: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("DICEBOX_DB").unwrap_or_else(|_| "dicebox.db".to_string()),
            client_timeout: Duration::from_secs(env_u64("WS_CLIENT_TIMEOUT_SECS", 30)),
            eviction_timeout: Duration::from_secs(env_u64("SESSION_EVICTION_TIMEOUT_SECS", 600)),
            retention_age: Duration::from_secs(env_u64("ROLL_RETENTION_HOURS", 24) * 60 * 60),
            sweep_interval: Duration::from_secs(env_u64("RETENTION_SWEEP_INTERVAL_SECS", 3600)),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            log::warn!("Invalid {name}={value}; using default {default}");
            default
        }),
        Err(_) => default,
    }
}
