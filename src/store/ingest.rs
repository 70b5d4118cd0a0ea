//! Event and test-result ingestion.
//!
//! `store_event` is the single write path for lineage events: validate,
//! dedupe by fingerprint, then persist the event row, its derived edges and
//! the TTL fingerprint row in one transaction. Only a newly-stored event
//! notifies the refresh controller — duplicate suppression happens strictly
//! before any refresh is scheduled, so replays never cause refresh work.
//!
//! Deduplication is two-layered: a fingerprint table with a 24-hour TTL is
//! the fast path, and the unique constraint on the events table is the
//! backstop that keeps replays idempotent after their TTL row has been
//! pruned. Concurrent submissions of the same event serialize on the write
//! connection, so at most one of them wins the insert.

use rusqlite::{params, OptionalExtension};

use crate::event::{LineageEvent, TestResult};
use crate::producer::resolve_producer;

use super::{now_millis, LineageStore, StoreError, StoreOutcome};

const FINGERPRINT_TTL_MILLIS: i64 = 24 * 60 * 60 * 1000;

impl LineageStore {
    /// Persist a lineage event.
    ///
    /// Returns `Stored` when the event was newly persisted and `Duplicate`
    /// when an event with the same fingerprint already exists. Duplicates
    /// derive no edges and trigger no refresh.
    pub async fn store_event(&self, event: &LineageEvent) -> Result<StoreOutcome, StoreError> {
        event.validate().map_err(StoreError::InvalidEvent)?;

        let fingerprint = event.fingerprint();
        let (producer_name, producer_version) = resolve_producer(&event.producer_url);
        let datasets_json = serde_json::to_string(&event.datasets)?;

        {
            let mut guard = self.conn().write()?;
            let now = now_millis();

            // Fast path: an unexpired fingerprint row marks a duplicate.
            let seen: Option<i64> = guard
                .query_row(
                    "SELECT 1 FROM event_fingerprints WHERE fingerprint = ?1 AND expires_at > ?2",
                    params![fingerprint, now],
                    |row| row.get(0),
                )
                .optional()?;

            if seen.is_some() {
                log::debug!(
                    "duplicate event detected (job: {}, run_id: {})",
                    event.job_name,
                    event.run_id
                );

                return Ok(StoreOutcome::Duplicate);
            }

            let tx = guard.transaction()?;

            let inserted = tx.execute(
                "INSERT INTO lineage_events (
                     event_id, fingerprint, event_type, job_name, run_id,
                     producer_url, producer_name, producer_version,
                     datasets, occurred_at, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    event.event_id,
                    fingerprint,
                    event.event_type.as_str(),
                    event.job_name,
                    event.run_id,
                    event.producer_url,
                    producer_name,
                    producer_version,
                    datasets_json,
                    event.occurred_at.timestamp_millis(),
                    now,
                ],
            );

            match inserted {
                Ok(_) => {}
                // Fingerprint TTL row already pruned but the event row
                // remains: the replay is still a duplicate, not a fault.
                Err(e) if is_unique_violation(&e, "lineage_events.fingerprint") => {
                    log::debug!(
                        "duplicate event detected via constraint (job: {}, run_id: {})",
                        event.job_name,
                        event.run_id
                    );

                    return Ok(StoreOutcome::Duplicate);
                }
                Err(e) => return Err(e.into()),
            }

            for dataset in &event.datasets {
                tx.execute(
                    "INSERT OR IGNORE INTO lineage_edges (job_name, dataset_urn, edge_type, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![event.job_name, dataset.urn, dataset.role.as_str(), now],
                )?;
            }

            tx.execute(
                "INSERT OR REPLACE INTO event_fingerprints (fingerprint, job_name, run_id, created_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    fingerprint,
                    event.job_name,
                    event.run_id,
                    now,
                    now + FINGERPRINT_TTL_MILLIS,
                ],
            )?;

            tx.commit()?;
        }

        log::info!(
            "event stored (job: {}, run_id: {}, type: {}, datasets: {})",
            event.job_name,
            event.run_id,
            event.event_type.as_str(),
            event.datasets.len()
        );

        self.notify_data_changed();

        Ok(StoreOutcome::Stored)
    }

    /// Persist a data-quality test result, upserting on
    /// `(test_id, observed_at)`.
    ///
    /// An identical resubmission is a `Duplicate` and does not notify the
    /// refresh controller; an insert or a value-changing update is `Stored`
    /// and does, since it changes the correlation inputs.
    pub async fn store_test_result(&self, result: &TestResult) -> Result<StoreOutcome, StoreError> {
        result.validate().map_err(StoreError::InvalidTestResult)?;

        let observed_at = result.observed_at.timestamp_millis();

        let outcome = {
            let guard = self.conn().write()?;
            let now = now_millis();

            let existing: Option<(String, String)> = guard
                .query_row(
                    "SELECT status, dataset_urn_pattern FROM test_results
                     WHERE test_id = ?1 AND observed_at = ?2",
                    params![result.test_id, observed_at],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((status, pattern))
                    if status == result.status.as_str()
                        && pattern == result.dataset_urn_pattern =>
                {
                    log::debug!("duplicate test result (test_id: {})", result.test_id);

                    StoreOutcome::Duplicate
                }
                Some(_) => {
                    guard.execute(
                        "UPDATE test_results
                         SET status = ?1, dataset_urn_pattern = ?2, updated_at = ?3
                         WHERE test_id = ?4 AND observed_at = ?5",
                        params![
                            result.status.as_str(),
                            result.dataset_urn_pattern,
                            now,
                            result.test_id,
                            observed_at,
                        ],
                    )?;

                    StoreOutcome::Stored
                }
                None => {
                    guard.execute(
                        "INSERT INTO test_results (test_id, dataset_urn_pattern, status, observed_at, created_at, updated_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                        params![
                            result.test_id,
                            result.dataset_urn_pattern,
                            result.status.as_str(),
                            observed_at,
                            now,
                            now,
                        ],
                    )?;

                    StoreOutcome::Stored
                }
            }
        };

        if outcome.is_stored() {
            log::info!(
                "test result stored (test_id: {}, status: {})",
                result.test_id,
                result.status.as_str()
            );

            self.notify_data_changed();
        }

        Ok(outcome)
    }
}

fn is_unique_violation(err: &rusqlite::Error, column: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, Some(msg)) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation && msg.contains(column)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::event::{DatasetRef, EventType, TestStatus};
    use crate::store::testutil::temp_store;
    use crate::store::{Connection, StoreOptions};

    fn sample_event() -> LineageEvent {
        LineageEvent::new(
            EventType::Complete,
            "transform_orders",
            "run-100",
            "https://github.com/dbt-labs/dbt-core/tree/1.5.0",
            vec![
                DatasetRef::input("postgresql://db/raw.orders"),
                DatasetRef::output("postgresql://db/marts.orders"),
            ],
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        let guard = conn.read().unwrap();
        guard.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[tokio::test]
    async fn store_then_replay_is_duplicate() {
        let (_temp, conn, store) = temp_store(StoreOptions::default()).await;
        let event = sample_event();

        assert_eq!(store.store_event(&event).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(store.store_event(&event).await.unwrap(), StoreOutcome::Duplicate);

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM lineage_events"), 1);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM lineage_edges"), 2);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM event_fingerprints"), 1);

        store.close().await;
    }

    #[tokio::test]
    async fn replay_with_different_event_id_is_still_duplicate() {
        let (_temp, conn, store) = temp_store(StoreOptions::default()).await;

        let event = sample_event();
        store.store_event(&event).await.unwrap();

        let mut replay = event.clone();
        replay.event_id = uuid::Uuid::new_v4().to_string();
        assert_eq!(store.store_event(&replay).await.unwrap(), StoreOutcome::Duplicate);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM lineage_events"), 1);

        store.close().await;
    }

    #[tokio::test]
    async fn edges_deduplicate_across_events() {
        let (_temp, conn, store) = temp_store(StoreOptions::default()).await;

        let start = LineageEvent::new(
            EventType::Start,
            "transform_orders",
            "run-1",
            "",
            vec![DatasetRef::output("postgresql://db/marts.orders")],
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        );
        let complete = LineageEvent::new(
            EventType::Complete,
            "transform_orders",
            "run-1",
            "",
            vec![DatasetRef::output("postgresql://db/marts.orders")],
            Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
        );

        assert!(store.store_event(&start).await.unwrap().is_stored());
        assert!(store.store_event(&complete).await.unwrap().is_stored());

        // Same (job, dataset, role) pair observed twice: one edge row.
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM lineage_edges"), 1);

        store.close().await;
    }

    #[tokio::test]
    async fn validation_is_rejected_before_io() {
        let (_temp, conn, store) = temp_store(StoreOptions::default()).await;

        let mut event = sample_event();
        event.run_id = String::new();
        assert!(matches!(
            store.store_event(&event).await,
            Err(StoreError::InvalidEvent(_))
        ));

        let mut event = sample_event();
        event.datasets.clear();
        assert!(matches!(
            store.store_event(&event).await,
            Err(StoreError::InvalidEvent(_))
        ));

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM lineage_events"), 0);

        store.close().await;
    }

    #[tokio::test]
    async fn malformed_producer_degrades_to_unknown() {
        let (_temp, conn, store) = temp_store(StoreOptions::default()).await;

        let mut event = sample_event();
        event.producer_url = String::new();
        store.store_event(&event).await.unwrap();

        let guard = conn.read().unwrap();
        let (name, version): (String, String) = guard
            .query_row(
                "SELECT producer_name, producer_version FROM lineage_events",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(name, "unknown");
        assert_eq!(version, "");
        drop(guard);

        store.close().await;
    }

    #[tokio::test]
    async fn replay_after_fingerprint_pruned_hits_constraint_backstop() {
        let (_temp, conn, store) = temp_store(StoreOptions::default()).await;

        let event = sample_event();
        store.store_event(&event).await.unwrap();

        // Simulate TTL pruning of the fast-path row.
        {
            let guard = conn.write().unwrap();
            guard.execute("DELETE FROM event_fingerprints", []).unwrap();
        }

        assert_eq!(store.store_event(&event).await.unwrap(), StoreOutcome::Duplicate);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM lineage_events"), 1);

        store.close().await;
    }

    #[tokio::test]
    async fn test_result_upsert_semantics() {
        let (_temp, conn, store) = temp_store(StoreOptions::default()).await;

        let observed = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let fail = TestResult::new("not_null_orders_id", "postgresql://db/marts.orders", TestStatus::Fail, observed);

        assert_eq!(store.store_test_result(&fail).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(store.store_test_result(&fail).await.unwrap(), StoreOutcome::Duplicate);

        // Same key, new status: value-changing update.
        let pass = TestResult::new("not_null_orders_id", "postgresql://db/marts.orders", TestStatus::Pass, observed);
        assert_eq!(store.store_test_result(&pass).await.unwrap(), StoreOutcome::Stored);

        assert_eq!(count(&conn, "SELECT COUNT(*) FROM test_results"), 1);
        let guard = conn.read().unwrap();
        let status: String = guard
            .query_row("SELECT status FROM test_results", [], |row| row.get(0))
            .unwrap();
        assert_eq!(status, "PASS");
        drop(guard);

        // A different observation time is a new row.
        let later = TestResult::new(
            "not_null_orders_id",
            "postgresql://db/marts.orders",
            TestStatus::Fail,
            Utc.timestamp_opt(1_700_000_100, 0).unwrap(),
        );
        assert_eq!(store.store_test_result(&later).await.unwrap(), StoreOutcome::Stored);
        assert_eq!(count(&conn, "SELECT COUNT(*) FROM test_results"), 2);

        store.close().await;
    }

    #[tokio::test]
    async fn test_result_validation() {
        let (_temp, _conn, store) = temp_store(StoreOptions::default()).await;

        let invalid = TestResult::new("", "urn:x", TestStatus::Fail, Utc::now());
        assert!(matches!(
            store.store_test_result(&invalid).await,
            Err(StoreError::InvalidTestResult(_))
        ));

        store.close().await;
    }
}
