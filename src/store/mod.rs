//! The lineage store: persistence plus the background machinery that keeps
//! the correlation snapshot fresh.
//!
//! Construction runs the embedded schema migrations and spawns two owned
//! background tasks:
//!
//! - the debounced refresh controller ([`refresh`]), which coalesces bursts
//!   of data-change notifications into a single correlation view rebuild;
//! - the periodic cleanup loop ([`cleanup`]), which prunes expired
//!   duplicate-detection fingerprints.
//!
//! `close()` stops both: the pending refresh timer (if any) is cancelled,
//! an in-flight refresh is drained, and the cleanup loop is joined with a
//! shutdown timeout. Closing the store does not close the database handle;
//! the [`Connection`] is owned by the caller.
//!
//! ## Module organization
//!
//! - `connection` - write connection + read pool wrapper
//! - `ingest` - event and test-result ingestion with deduplication
//! - `refresh` - debounced refresh controller
//! - `cleanup` - periodic fingerprint pruning
//! - `views` - correlation snapshot rebuild and incident queries
//! - `health` - correlation health aggregation

mod cleanup;
mod connection;
mod health;
mod ingest;
mod refresh;
mod views;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::get_env_duration;
use crate::event::ValidationError;

pub use connection::{Connection, PoolStats};
pub use health::{HealthStats, OrphanDataset};
pub use views::Incident;

use refresh::RefreshController;

const DEFAULT_REFRESH_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Embedded schema migrations, applied in order. Every statement uses
/// IF NOT EXISTS so re-running the full set is harmless.
const MIGRATIONS: &[(&str, &str)] = &[
    ("01_lineage_events.sql", include_str!("../../migrations/01_lineage_events.sql")),
    ("02_lineage_edges.sql", include_str!("../../migrations/02_lineage_edges.sql")),
    ("03_test_results.sql", include_str!("../../migrations/03_test_results.sql")),
    ("04_correlation_views.sql", include_str!("../../migrations/04_correlation_views.sql")),
    ("05_event_fingerprints.sql", include_str!("../../migrations/05_event_fingerprints.sql")),
    ("06_api_keys.sql", include_str!("../../migrations/06_api_keys.sql")),
];

/// Store construction options.
///
/// `refresh_delay` is the debounce window for correlation view refreshes;
/// zero disables debounced refreshing entirely (the view is then refreshed
/// out-of-band via [`LineageStore::refresh_views`]). `cleanup_interval`
/// drives the fingerprint pruning loop and must be non-zero.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub refresh_delay: Duration,
    pub cleanup_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            refresh_delay: DEFAULT_REFRESH_DELAY,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl StoreOptions {
    /// Read options from `VIEW_REFRESH_DELAY` and `CLEANUP_INTERVAL`.
    pub fn from_env() -> Self {
        Self {
            refresh_delay: get_env_duration("VIEW_REFRESH_DELAY", DEFAULT_REFRESH_DELAY),
            cleanup_interval: get_env_duration("CLEANUP_INTERVAL", DEFAULT_CLEANUP_INTERVAL),
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Result of an ingestion call: the tri-state success outcome.
///
/// A duplicate is not an error; it reports that the logical record already
/// existed and nothing was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    Duplicate,
}

impl StoreOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, StoreOutcome::Stored)
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreOutcome::Duplicate)
    }
}

/// Store errors.
///
/// Validation failures are rejected before any I/O; database and pool
/// errors are surfaced to the caller without internal retries. Background
/// loop failures (refresh, cleanup) never appear here: they are logged and
/// absorbed by the owning loop.
#[derive(Debug)]
pub enum StoreError {
    InvalidEvent(ValidationError),
    InvalidTestResult(ValidationError),
    InvalidCleanupInterval,
    ConnectionClosed,
    Config(String),
    Database(rusqlite::Error),
    Pool(r2d2::Error),
    Serialization(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::InvalidEvent(e) => write!(f, "invalid lineage event: {e}"),
            StoreError::InvalidTestResult(e) => write!(f, "invalid test result: {e}"),
            StoreError::InvalidCleanupInterval => {
                write!(f, "cleanup interval must be greater than zero")
            }
            StoreError::ConnectionClosed => write!(f, "database connection is closed"),
            StoreError::Config(msg) => write!(f, "configuration error: {msg}"),
            StoreError::Database(e) => write!(f, "database error: {e}"),
            StoreError::Pool(e) => write!(f, "connection pool error: {e}"),
            StoreError::Serialization(e) => write!(f, "serialization error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database(e) => Some(e),
            StoreError::Pool(e) => Some(e),
            StoreError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::Pool(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

/// The lineage store.
///
/// Owns all derived state: edges, the correlation snapshot, health
/// statistics. Callers submit events and test results or read health
/// snapshots; they never mutate derived state directly.
pub struct LineageStore {
    conn: Arc<Connection>,
    refresh: RefreshController,
    cleanup: Mutex<Option<cleanup::CleanupLoop>>,
}

impl LineageStore {
    /// Create the store: run migrations, start the refresh controller and
    /// the cleanup loop. Must be called from within a tokio runtime.
    pub async fn new(conn: Arc<Connection>, options: StoreOptions) -> Result<Self, StoreError> {
        if options.cleanup_interval.is_zero() {
            return Err(StoreError::InvalidCleanupInterval);
        }

        run_migrations(&conn)?;

        let refresh_conn = Arc::clone(&conn);
        let refresh = RefreshController::start(options.refresh_delay, move || {
            let conn = Arc::clone(&refresh_conn);
            async move {
                if let Err(e) = views::refresh_correlation_views(&conn) {
                    log::error!("correlation view refresh failed: {e}");
                }
            }
        });

        let cleanup = cleanup::CleanupLoop::spawn(Arc::clone(&conn), options.cleanup_interval);

        log::info!(
            "lineage store started (refresh delay: {:?}, cleanup interval: {:?})",
            options.refresh_delay,
            options.cleanup_interval
        );

        Ok(Self {
            conn,
            refresh,
            cleanup: Mutex::new(Some(cleanup)),
        })
    }

    /// Stop the background loops.
    ///
    /// A refresh timer that has not fired is cancelled; a refresh that is
    /// already executing is awaited to completion. The cleanup loop is
    /// joined with a shutdown timeout. Safe to call more than once. Does
    /// not close the database connection.
    pub async fn close(&self) {
        self.refresh.close().await;

        let cleanup = self.cleanup.lock().unwrap().take();
        if let Some(cleanup) = cleanup {
            cleanup.stop().await;
        }
    }

    /// Verifies the backing database is reachable.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.conn.health_check()
    }

    /// Rebuild the correlation snapshot immediately, bypassing the
    /// debounce. This is the out-of-band refresh path used when the
    /// debounced controller is disabled.
    pub async fn refresh_views(&self) -> Result<(), StoreError> {
        views::refresh_correlation_views(&self.conn)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub(crate) fn notify_data_changed(&self) {
        self.refresh.notify_data_changed();
    }
}

fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    let guard = conn.write()?;

    for (name, sql) in MIGRATIONS {
        guard.execute_batch(sql)?;
        log::debug!("applied migration {name}");
    }

    Ok(())
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use tempfile::NamedTempFile;

    use crate::config::Config;

    /// A store over a fresh temp-file database with test-friendly timings.
    pub(crate) async fn temp_store(options: StoreOptions) -> (NamedTempFile, Arc<Connection>, LineageStore) {
        let temp = NamedTempFile::new().unwrap();
        let config = Config::for_database(temp.path().to_str().unwrap());
        let conn = Arc::new(Connection::open(&config).unwrap());
        let store = LineageStore::new(Arc::clone(&conn), options).await.unwrap();
        (temp, conn, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_cleanup_interval_is_rejected() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let config = crate::config::Config::for_database(temp.path().to_str().unwrap());
        let conn = Arc::new(Connection::open(&config).unwrap());

        let options = StoreOptions::default().with_cleanup_interval(Duration::ZERO);
        let err = LineageStore::new(conn, options).await.err().unwrap();
        assert!(matches!(err, StoreError::InvalidCleanupInterval));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_temp, _conn, store) = testutil::temp_store(StoreOptions::default()).await;
        store.close().await;
        store.close().await;
    }

    #[tokio::test]
    async fn migrations_are_rerunnable() {
        let temp = tempfile::NamedTempFile::new().unwrap();
        let config = crate::config::Config::for_database(temp.path().to_str().unwrap());
        let conn = Arc::new(Connection::open(&config).unwrap());

        let store = LineageStore::new(Arc::clone(&conn), StoreOptions::default())
            .await
            .unwrap();
        store.close().await;

        // A second store over the same database applies the same migrations
        // again without error.
        let store2 = LineageStore::new(conn, StoreOptions::default()).await.unwrap();
        store2.health_check().await.unwrap();
        store2.close().await;
    }

    #[test]
    fn outcome_accessors() {
        assert!(StoreOutcome::Stored.is_stored());
        assert!(!StoreOutcome::Stored.is_duplicate());
        assert!(StoreOutcome::Duplicate.is_duplicate());
    }

    #[test]
    fn options_builders() {
        let opts = StoreOptions::default()
            .with_refresh_delay(Duration::from_millis(50))
            .with_cleanup_interval(Duration::from_secs(10));
        assert_eq!(opts.refresh_delay, Duration::from_millis(50));
        assert_eq!(opts.cleanup_interval, Duration::from_secs(10));

        let defaults = StoreOptions::default();
        assert_eq!(defaults.refresh_delay, Duration::from_secs(5));
        assert_eq!(defaults.cleanup_interval, Duration::from_secs(3600));
    }
}
