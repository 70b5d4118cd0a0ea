//! Database connection wrapper.
//!
//! One SQLite database backs the whole store. Writes go through a single
//! connection behind a mutex (SQLite has one writer anyway; serializing in
//! process keeps check-then-insert sequences atomic). Reads come from an
//! r2d2 pool so correlation queries never queue behind ingestion.
//!
//! Every connection runs in WAL mode with NORMAL synchronous and foreign
//! keys on, and carries a 30 second busy timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::config::Config;

use super::StoreError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
";

/// Pooled database handle: a mutexed write connection plus a read pool.
pub struct Connection {
    write_conn: Arc<Mutex<rusqlite::Connection>>,
    read_pool: Pool<SqliteConnectionManager>,
    closed: AtomicBool,
}

/// Read pool statistics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub open_connections: u32,
    pub idle_connections: u32,
}

#[derive(Debug)]
struct ReadConnCustomizer;

impl r2d2::CustomizeConnection<rusqlite::Connection, rusqlite::Error> for ReadConnCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;

        Ok(())
    }
}

impl Connection {
    /// Open the database and build the read pool.
    ///
    /// Pool sizing comes from the config: `max_open_conns` bounds the pool,
    /// `max_idle_conns` connections are kept warm, and connections are
    /// recycled after `conn_max_lifetime` or dropped after sitting idle for
    /// `conn_max_idle_time`.
    pub fn open(config: &Config) -> Result<Self, StoreError> {
        config
            .validate()
            .map_err(|e| StoreError::Config(e.to_string()))?;

        let path = config.database_path().to_string();

        let write_conn = rusqlite::Connection::open(&path)?;
        write_conn.busy_timeout(BUSY_TIMEOUT)?;
        write_conn.execute_batch(CONNECTION_PRAGMAS)?;

        let manager = SqliteConnectionManager::file(&path);
        let read_pool = Pool::builder()
            .max_size(config.max_open_conns.max(1))
            .min_idle(Some(config.max_idle_conns.min(config.max_open_conns)))
            .max_lifetime(Some(config.conn_max_lifetime))
            .idle_timeout(Some(config.conn_max_idle_time))
            .connection_timeout(ACQUIRE_TIMEOUT)
            .connection_customizer(Box::new(ReadConnCustomizer))
            .build(manager)
            .map_err(StoreError::Pool)?;

        let conn = Self {
            write_conn: Arc::new(Mutex::new(write_conn)),
            read_pool,
            closed: AtomicBool::new(false),
        };

        // Immediate health check so misconfiguration fails at startup, not
        // on the first query.
        conn.health_check()?;

        log::info!(
            "database connection opened (path: {}, pool: {} open / {} idle)",
            path,
            config.max_open_conns,
            config.max_idle_conns
        );

        Ok(conn)
    }

    /// Exclusive access to the write connection.
    pub(crate) fn write(&self) -> Result<MutexGuard<'_, rusqlite::Connection>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::ConnectionClosed);
        }

        Ok(self.write_conn.lock().unwrap())
    }

    /// A pooled read connection.
    pub(crate) fn read(&self) -> Result<PooledConnection<SqliteConnectionManager>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::ConnectionClosed);
        }

        self.read_pool.get().map_err(StoreError::Pool)
    }

    /// Verifies the database answers queries.
    pub fn health_check(&self) -> Result<(), StoreError> {
        let conn = self.read()?;
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        if one != 1 {
            return Err(StoreError::ConnectionClosed);
        }

        Ok(())
    }

    /// Read pool statistics.
    pub fn stats(&self) -> PoolStats {
        let state = self.read_pool.state();

        PoolStats {
            open_connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    /// Marks the handle closed. Safe to call more than once; connections
    /// are released when the last reference drops.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!("database connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
