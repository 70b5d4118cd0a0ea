//! Lineage store daemon.
//!
//! Opens the database from the environment, starts the lineage store with
//! its background refresh and cleanup loops, and reports correlation
//! health on an interval until interrupted.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin lineflowd
//! ```
//!
//! ## Environment Variables
//!
//! - DATABASE_URL - SQLite database path (required, `sqlite://` prefix ok)
//! - DATABASE_MAX_OPEN_CONNS - read pool size (default: 25)
//! - DATABASE_MAX_IDLE_CONNS - idle connections kept warm (default: 5)
//! - DATABASE_CONN_MAX_LIFETIME - connection recycle age (default: 30m)
//! - DATABASE_CONN_MAX_IDLE_TIME - idle connection age (default: 10m)
//! - VIEW_REFRESH_DELAY - debounce window for view refresh, 0 disables (default: 5s)
//! - CLEANUP_INTERVAL - fingerprint pruning period (default: 1h)
//! - HEALTH_REPORT_INTERVAL - how often to log health stats (default: 60s)
//! - RUST_LOG - logging level (optional, default: info)

use std::sync::Arc;

use lineflow::{Config, Connection, LineageStore, StoreOptions};
use tokio::time::{interval, Duration, MissedTickBehavior};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    config.validate()?;

    log::info!("starting lineflowd (database: {})", config.mask_database_url());

    let conn = Arc::new(Connection::open(&config)?);
    let options = StoreOptions::from_env();
    let store = LineageStore::new(Arc::clone(&conn), options).await?;

    let report_interval =
        lineflow::config::get_env_duration("HEALTH_REPORT_INTERVAL", Duration::from_secs(60));
    let mut ticker = interval(report_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                match store.compute_health().await {
                    Ok(health) => {
                        let stats = conn.stats();
                        log::info!(
                            "correlation health: rate {:.2} ({}/{} failing datasets correlated) | {} datasets, {} produced | pool {} open / {} idle",
                            health.correlation_rate,
                            health.correlated_failed_tested_datasets,
                            health.total_failed_tested_datasets,
                            health.total_datasets,
                            health.produced_datasets,
                            stats.open_connections,
                            stats.idle_connections,
                        );
                    }
                    Err(e) => log::error!("health computation failed: {e}"),
                }
            }
        }
    }

    store.close().await;
    conn.close();
    log::info!("lineflowd stopped");

    Ok(())
}
