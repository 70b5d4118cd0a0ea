//! Configuration loaded from environment variables.
//!
//! Every knob has a production default and can be overridden through the
//! environment:
//!
//! | variable                        | default | meaning                         |
//! |---------------------------------|---------|---------------------------------|
//! | `DATABASE_URL`                  | (none)  | SQLite path, `sqlite://` ok     |
//! | `DATABASE_MAX_OPEN_CONNS`       | `25`    | read pool size                  |
//! | `DATABASE_MAX_IDLE_CONNS`       | `5`     | idle connections kept warm      |
//! | `DATABASE_CONN_MAX_LIFETIME`    | `30m`   | recycle connections after       |
//! | `DATABASE_CONN_MAX_IDLE_TIME`   | `10m`   | drop idle connections after     |
//!
//! Durations accept `ms`, `s`, `m` and `h` suffixes; a bare integer means
//! seconds.

use std::env;
use std::time::Duration;

const DEFAULT_MAX_OPEN_CONNS: u32 = 25;
const DEFAULT_MAX_IDLE_CONNS: u32 = 5;
const DEFAULT_CONN_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);
const DEFAULT_CONN_MAX_IDLE_TIME: Duration = Duration::from_secs(10 * 60);

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    database_url: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime: Duration,
    pub conn_max_idle_time: Duration,
}

impl Config {
    /// Build a config for a known database location with default pool
    /// settings. Used by tests and embedding applications.
    pub fn for_database(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_open_conns: DEFAULT_MAX_OPEN_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            conn_max_lifetime: DEFAULT_CONN_MAX_LIFETIME,
            conn_max_idle_time: DEFAULT_CONN_MAX_IDLE_TIME,
        }
    }

    /// Load configuration from environment variables, falling back to
    /// defaults for everything except `DATABASE_URL`.
    pub fn from_env() -> Self {
        Self {
            database_url: get_env_str("DATABASE_URL", ""),
            max_open_conns: get_env_u32("DATABASE_MAX_OPEN_CONNS", DEFAULT_MAX_OPEN_CONNS),
            max_idle_conns: get_env_u32("DATABASE_MAX_IDLE_CONNS", DEFAULT_MAX_IDLE_CONNS),
            conn_max_lifetime: get_env_duration("DATABASE_CONN_MAX_LIFETIME", DEFAULT_CONN_MAX_LIFETIME),
            conn_max_idle_time: get_env_duration("DATABASE_CONN_MAX_IDLE_TIME", DEFAULT_CONN_MAX_IDLE_TIME),
        }
    }

    /// Checks the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::DatabaseUrlEmpty);
        }

        Ok(())
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Filesystem path of the SQLite database, with an optional
    /// `sqlite://` scheme stripped.
    pub fn database_path(&self) -> &str {
        self.database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&self.database_url)
    }

    /// A copy of the database URL safe for logs: any `user:password@`
    /// userinfo has its password replaced with `***`.
    pub fn mask_database_url(&self) -> String {
        let url = &self.database_url;

        let Some(scheme_end) = url.find("://") else {
            return url.clone();
        };
        let after_scheme = &url[scheme_end + 3..];

        let Some(at) = after_scheme.rfind('@') else {
            return url.clone();
        };
        let userinfo = &after_scheme[..at];

        let Some(colon) = userinfo.find(':') else {
            return url.clone();
        };
        let password = &userinfo[colon + 1..];
        if password.is_empty() {
            return url.clone();
        }

        format!(
            "{}://{}:***{}",
            &url[..scheme_end],
            &userinfo[..colon],
            &after_scheme[at..]
        )
    }
}

/// Configuration errors reported before any connection is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    DatabaseUrlEmpty,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::DatabaseUrlEmpty => write!(f, "database URL cannot be empty"),
        }
    }
}

impl std::error::Error for ConfigError {}

fn get_env_str(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn get_env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read a duration from the environment, falling back to the default when
/// unset or unparseable.
pub fn get_env_duration(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| parse_duration(&v))
        .unwrap_or(default)
}

/// Parse `300ms`, `5s`, `30m`, `2h` or a bare integer number of seconds.
pub(crate) fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (number, unit): (&str, &str) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };

    let n: u64 = number.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(n)),
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}
