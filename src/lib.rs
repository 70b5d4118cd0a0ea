//! # lineflow
//!
//! Persistence and correlation engine for data-lineage observability.
//!
//! The store ingests lineage events (job runs with their dataset inputs and
//! outputs) and data-quality test results, derives lineage edges, and keeps
//! a debounced correlation snapshot answering: which failing tests are
//! attributable to a known upstream producer?
//!
//! ```no_run
//! use std::sync::Arc;
//! use lineflow::{Config, Connection, LineageStore, StoreOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::from_env();
//! let conn = Arc::new(Connection::open(&config)?);
//! let store = LineageStore::new(Arc::clone(&conn), StoreOptions::from_env()).await?;
//!
//! // ... store.store_event(&event).await? ...
//!
//! let health = store.compute_health().await?;
//! println!("correlation rate: {:.2}", health.correlation_rate);
//!
//! store.close().await;
//! conn.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## Module organization
//!
//! - `config` - environment-driven configuration
//! - `event` - lineage event and test result domain models
//! - `producer` - producer URL resolution
//! - `pattern` - dataset URN pattern matching
//! - `store` - the lineage store: ingestion, refresh, cleanup, health
//! - `keystore` - API key storage for ingestion plugins

pub mod config;
pub mod event;
pub mod keystore;
pub mod pattern;
pub mod producer;
pub mod store;

pub use config::{Config, ConfigError};
pub use event::{
    DatasetRef, DatasetRole, EventType, LineageEvent, TestResult, TestStatus, ValidationError,
};
pub use keystore::{ApiKey, ApiKeyStore, KeyStoreError, PersistentKeyStore};
pub use pattern::{PatternResolution, UrnPattern};
pub use producer::{extract_producer_name, extract_producer_version, resolve_producer};
pub use store::{
    Connection, HealthStats, Incident, LineageStore, OrphanDataset, PoolStats, StoreError,
    StoreOptions, StoreOutcome,
};
