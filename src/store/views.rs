//! Correlation snapshot rebuild and incident queries.
//!
//! The snapshot is a pair of tables standing in for a materialized view:
//! `resolved_datasets` maps every test URN pattern that resolves to exactly
//! one known dataset URN, and `incident_correlation_view` joins failing
//! tests through those resolutions to the producing job and its producer.
//! Both are rebuilt together in a single transaction, so readers observe
//! either the previous snapshot or the new one — stale but consistent,
//! never partial.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::event::TestStatus;
use crate::pattern::{PatternResolution, UrnPattern};

use super::{millis_to_datetime, now_millis, Connection, LineageStore, StoreError};

/// One row of the incident snapshot: a failing test attributed to the job
/// run that produced the failing dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Incident {
    pub test_id: String,
    pub test_status: TestStatus,
    pub observed_at: DateTime<Utc>,
    pub dataset_urn: String,
    pub job_name: String,
    pub producer_name: String,
    pub producer_version: String,
}

/// Rebuild the correlation snapshot.
///
/// Pattern resolution runs in process (patterns compile to regexes); the
/// incident join runs in SQL over the freshly written resolutions. The
/// whole rebuild is one transaction on the write connection — this is the
/// cost the debounce controller bounds.
pub(crate) fn refresh_correlation_views(conn: &Connection) -> Result<(), StoreError> {
    let started = std::time::Instant::now();

    let mut guard = conn.write()?;
    let tx = guard.transaction()?;

    let known_urns: Vec<String> = {
        let mut stmt =
            tx.prepare("SELECT DISTINCT dataset_urn FROM lineage_edges ORDER BY dataset_urn")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let patterns: Vec<String> = {
        let mut stmt = tx.prepare("SELECT DISTINCT dataset_urn_pattern FROM test_results")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };

    let now = now_millis();

    tx.execute("DELETE FROM resolved_datasets", [])?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO resolved_datasets (dataset_urn_pattern, resolved_urn, refreshed_at)
             VALUES (?1, ?2, ?3)",
        )?;

        for pattern in &patterns {
            let compiled = match UrnPattern::compile(pattern) {
                Ok(p) => p,
                Err(e) => {
                    log::warn!("skipping uncompilable dataset pattern: {e}");
                    continue;
                }
            };

            // Only unique resolutions enter the snapshot; unmatched and
            // ambiguous patterns stay out of correlation entirely.
            if let PatternResolution::Unique(urn) =
                compiled.resolve(known_urns.iter().map(String::as_str))
            {
                insert.execute(params![pattern, urn, now])?;
            }
        }
    }

    tx.execute("DELETE FROM incident_correlation_view", [])?;
    tx.execute(
        "INSERT INTO incident_correlation_view (
             test_id, test_status, observed_at, dataset_urn,
             job_name, producer_name, producer_version, refreshed_at
         )
         SELECT
             tr.test_id, tr.status, tr.observed_at, rd.resolved_urn,
             le.job_name,
             COALESCE(ev.producer_name, 'unknown'),
             COALESCE(ev.producer_version, ''),
             ?1
         FROM test_results tr
         JOIN resolved_datasets rd ON rd.dataset_urn_pattern = tr.dataset_urn_pattern
         JOIN lineage_edges le ON le.dataset_urn = rd.resolved_urn AND le.edge_type = 'OUTPUT'
         LEFT JOIN (
             SELECT job_name, producer_name, producer_version, MAX(occurred_at) AS occurred_at
             FROM lineage_events
             GROUP BY job_name
         ) ev ON ev.job_name = le.job_name
         WHERE tr.status IN ('FAIL', 'ERROR')",
        params![now],
    )?;

    tx.commit()?;

    let elapsed = started.elapsed();
    log::info!(
        "correlation views refreshed ({} patterns, {} known datasets, {:?})",
        patterns.len(),
        known_urns.len(),
        elapsed
    );

    if elapsed > std::time::Duration::from_secs(2) {
        log::warn!("slow correlation view refresh: {:?}", elapsed);
    }

    Ok(())
}

impl LineageStore {
    /// Read the incident snapshot, newest failures first.
    ///
    /// Freshness follows the last snapshot rebuild; call after the
    /// debounced refresh has run (or after [`LineageStore::refresh_views`]).
    pub async fn query_incidents(&self, limit: Option<usize>) -> Result<Vec<Incident>, StoreError> {
        let conn = self.conn().read()?;

        let mut sql = String::from(
            "SELECT test_id, test_status, observed_at, dataset_urn,
                    job_name, producer_name, producer_version
             FROM incident_correlation_view
             ORDER BY observed_at DESC, test_id",
        );
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(1)?;
            let observed_at: i64 = row.get(2)?;

            Ok(Incident {
                test_id: row.get(0)?,
                test_status: TestStatus::parse(&status).unwrap_or(TestStatus::Error),
                observed_at: millis_to_datetime(observed_at),
                dataset_urn: row.get(3)?,
                job_name: row.get(4)?,
                producer_name: row.get(5)?,
                producer_version: row.get(6)?,
            })
        })?;

        let incidents = rows.collect::<Result<Vec<_>, _>>()?;

        Ok(incidents)
    }
}
