//! Correlation health aggregation.
//!
//! Answers the platform's primary SLA question: of the datasets whose
//! latest data-quality outcome is failing, how many can be attributed to a
//! known upstream producer? All statistics are distinct-dataset counts —
//! the same dataset may appear in many events and tests, and counting rows
//! instead of URNs would inflate every number.
//!
//! Health is recomputed from the live tables on every call; its only
//! consistency guarantee is being computed against a single read snapshot,
//! so it is never cached as long-lived state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::event::TestStatus;
use crate::pattern::{PatternResolution, UrnPattern};

use super::{millis_to_datetime, LineageStore, StoreError};

/// Correlation health statistics. All counts are distinct dataset URNs.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthStats {
    /// Datasets whose latest test outcome is FAIL or ERROR.
    pub total_failed_tested_datasets: usize,
    /// The failing subset that also has a known producer (OUTPUT edge).
    pub correlated_failed_tested_datasets: usize,
    /// Datasets with any resolved test result.
    pub total_datasets: usize,
    /// Datasets with at least one OUTPUT edge.
    pub produced_datasets: usize,
    /// Tested datasets (any status) that also have a producer.
    pub correlated_datasets: usize,
    /// `correlated_failed / total_failed`; 0.0 when nothing is failing.
    pub correlation_rate: f64,
}

impl HealthStats {
    /// True when no tested dataset is currently failing.
    pub fn is_healthy(&self) -> bool {
        self.total_failed_tested_datasets == 0
    }
}

/// A tested dataset with no known producer: either its pattern resolved to
/// a dataset nothing produces, or the pattern did not resolve at all (the
/// URN field then carries the raw pattern).
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanDataset {
    pub dataset_urn: String,
    pub test_count: usize,
    pub last_seen: DateTime<Utc>,
}

/// (pattern, status, observed_at) rows in deterministic order.
type TestRow = (String, String, i64);

impl LineageStore {
    /// Compute correlation health from the current events, edges and test
    /// results.
    pub async fn compute_health(&self) -> Result<HealthStats, StoreError> {
        let (known_urns, produced_urns, rows) = self.load_correlation_inputs()?;

        // Latest test outcome per uniquely-resolved dataset. Rows arrive
        // ordered by (observed_at, id), so equal timestamps resolve to the
        // later row.
        let mut cache: HashMap<String, Option<String>> = HashMap::new();
        let mut latest: HashMap<String, TestStatus> = HashMap::new();
        let mut latest_at: HashMap<String, i64> = HashMap::new();

        for (pattern, status, observed_at) in rows {
            let Some(urn) = resolve_unique(&mut cache, &pattern, &known_urns) else {
                continue;
            };
            let status = TestStatus::parse(&status).unwrap_or(TestStatus::Error);

            let newer = latest_at.get(&urn).map_or(true, |at| observed_at >= *at);
            if newer {
                latest_at.insert(urn.clone(), observed_at);
                latest.insert(urn, status);
            }
        }

        let total_datasets = latest.len();
        let correlated_datasets = latest
            .keys()
            .filter(|urn| produced_urns.contains(*urn))
            .count();

        let failing: Vec<&String> = latest
            .iter()
            .filter(|(_, status)| status.is_incident())
            .map(|(urn, _)| urn)
            .collect();
        let total_failed_tested_datasets = failing.len();
        let correlated_failed_tested_datasets = failing
            .iter()
            .filter(|urn| produced_urns.contains(urn.as_str()))
            .count();

        let correlation_rate = if total_failed_tested_datasets > 0 {
            correlated_failed_tested_datasets as f64 / total_failed_tested_datasets as f64
        } else {
            0.0
        };

        Ok(HealthStats {
            total_failed_tested_datasets,
            correlated_failed_tested_datasets,
            total_datasets,
            produced_datasets: produced_urns.len(),
            correlated_datasets,
            correlation_rate,
        })
    }

    /// Tested datasets that cannot be traced to a producer, most-tested
    /// first. Unresolvable patterns are reported under their raw pattern.
    pub async fn query_orphan_datasets(&self) -> Result<Vec<OrphanDataset>, StoreError> {
        let (known_urns, produced_urns, rows) = self.load_correlation_inputs()?;

        let mut cache: HashMap<String, Option<String>> = HashMap::new();
        let mut orphans: HashMap<String, (usize, i64)> = HashMap::new();

        for (pattern, _status, observed_at) in rows {
            let key = match resolve_unique(&mut cache, &pattern, &known_urns) {
                Some(urn) if produced_urns.contains(&urn) => continue,
                Some(urn) => urn,
                None => pattern,
            };

            let entry = orphans.entry(key).or_insert((0, observed_at));
            entry.0 += 1;
            entry.1 = entry.1.max(observed_at);
        }

        let mut result: Vec<OrphanDataset> = orphans
            .into_iter()
            .map(|(dataset_urn, (test_count, last_seen))| OrphanDataset {
                dataset_urn,
                test_count,
                last_seen: millis_to_datetime(last_seen),
            })
            .collect();

        result.sort_by(|a, b| {
            b.test_count
                .cmp(&a.test_count)
                .then_with(|| a.dataset_urn.cmp(&b.dataset_urn))
        });

        Ok(result)
    }

    fn load_correlation_inputs(
        &self,
    ) -> Result<(Vec<String>, HashSet<String>, Vec<TestRow>), StoreError> {
        let conn = self.conn().read()?;

        let known_urns: Vec<String> = {
            let mut stmt =
                conn.prepare("SELECT DISTINCT dataset_urn FROM lineage_edges ORDER BY dataset_urn")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let produced_urns: HashSet<String> = {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT dataset_urn FROM lineage_edges WHERE edge_type = 'OUTPUT'",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<_, _>>()?
        };

        let rows: Vec<TestRow> = {
            let mut stmt = conn.prepare(
                "SELECT dataset_urn_pattern, status, observed_at
                 FROM test_results
                 ORDER BY observed_at ASC, id ASC",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            rows.collect::<Result<_, _>>()?
        };

        Ok((known_urns, produced_urns, rows))
    }
}

/// Resolve a pattern to its unique URN, memoizing per distinct pattern.
/// Unmatched and ambiguous patterns memoize as `None`.
fn resolve_unique(
    cache: &mut HashMap<String, Option<String>>,
    pattern: &str,
    known_urns: &[String],
) -> Option<String> {
    if let Some(resolved) = cache.get(pattern) {
        return resolved.clone();
    }

    let resolved = match UrnPattern::compile(pattern) {
        Ok(compiled) => match compiled.resolve(known_urns.iter().map(String::as_str)) {
            PatternResolution::Unique(urn) => Some(urn),
            PatternResolution::Unmatched | PatternResolution::Ambiguous(_) => None,
        },
        Err(e) => {
            log::warn!("skipping uncompilable dataset pattern: {e}");
            None
        }
    };

    cache.insert(pattern.to_string(), resolved.clone());

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::time::Duration;

    use crate::event::{DatasetRef, EventType, LineageEvent, TestResult};
    use crate::store::testutil::temp_store;
    use crate::store::{LineageStore, StoreOptions};

    fn ts(offset: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap()
    }

    async fn no_refresh_store() -> (tempfile::NamedTempFile, std::sync::Arc<crate::store::Connection>, LineageStore)
    {
        temp_store(StoreOptions::default().with_refresh_delay(Duration::ZERO)).await
    }

    async fn seed_producer(store: &LineageStore) {
        let event = LineageEvent::new(
            EventType::Complete,
            "transform_orders",
            "run-1",
            "https://github.com/dbt-labs/dbt-core/tree/1.5.0",
            vec![
                DatasetRef::input("postgresql://db/raw.orders"),
                DatasetRef::output("postgresql://db/marts.orders"),
            ],
            ts(0),
        );
        store.store_event(&event).await.unwrap();
    }

    #[tokio::test]
    async fn empty_store_is_healthy_with_zero_rate() {
        let (_temp, _conn, store) = no_refresh_store().await;

        let stats = store.compute_health().await.unwrap();
        assert_eq!(stats.total_failed_tested_datasets, 0);
        assert_eq!(stats.correlation_rate, 0.0);
        assert!(stats.is_healthy());

        store.close().await;
    }

    #[tokio::test]
    async fn counts_are_distinct_dataset_urns() {
        let (_temp, _conn, store) = no_refresh_store().await;
        seed_producer(&store).await;

        store
            .store_test_result(&TestResult::new(
                "not_null_orders_id",
                "postgresql://db/marts.orders",
                TestStatus::Fail,
                ts(100),
            ))
            .await
            .unwrap();
        // A second failing test on the same dataset must not double count.
        store
            .store_test_result(&TestResult::new(
                "orders_rowcount",
                "postgresql://db/marts.orders",
                TestStatus::Error,
                ts(110),
            ))
            .await
            .unwrap();
        store
            .store_test_result(&TestResult::new(
                "raw_orders_schema",
                "postgresql://db/raw.orders",
                TestStatus::Pass,
                ts(120),
            ))
            .await
            .unwrap();

        let stats = store.compute_health().await.unwrap();
        assert_eq!(stats.total_failed_tested_datasets, 1);
        assert_eq!(stats.correlated_failed_tested_datasets, 1);
        assert_eq!(stats.total_datasets, 2);
        assert_eq!(stats.produced_datasets, 1);
        assert_eq!(stats.correlated_datasets, 1);
        assert_eq!(stats.correlation_rate, 1.0);
        assert!(!stats.is_healthy());

        store.close().await;
    }

    #[tokio::test]
    async fn latest_status_wins() {
        let (_temp, _conn, store) = no_refresh_store().await;
        seed_producer(&store).await;

        store
            .store_test_result(&TestResult::new(
                "orders_fresh",
                "postgresql://db/marts.orders",
                TestStatus::Fail,
                ts(100),
            ))
            .await
            .unwrap();
        store
            .store_test_result(&TestResult::new(
                "orders_fresh",
                "postgresql://db/marts.orders",
                TestStatus::Pass,
                ts(200),
            ))
            .await
            .unwrap();

        let stats = store.compute_health().await.unwrap();
        assert_eq!(stats.total_failed_tested_datasets, 0, "recovered dataset is not failing");
        assert_eq!(stats.total_datasets, 1);
        assert_eq!(stats.correlation_rate, 0.0);

        store.close().await;
    }

    #[tokio::test]
    async fn uncorrelated_failure_lowers_the_rate() {
        let (_temp, _conn, store) = no_refresh_store().await;
        seed_producer(&store).await;

        store
            .store_test_result(&TestResult::new(
                "orders_fresh",
                "postgresql://db/marts.orders",
                TestStatus::Fail,
                ts(100),
            ))
            .await
            .unwrap();
        // raw.orders is input-only: failing but unattributable.
        store
            .store_test_result(&TestResult::new(
                "raw_orders_schema",
                "postgresql://db/raw.orders",
                TestStatus::Fail,
                ts(100),
            ))
            .await
            .unwrap();

        let stats = store.compute_health().await.unwrap();
        assert_eq!(stats.total_failed_tested_datasets, 2);
        assert_eq!(stats.correlated_failed_tested_datasets, 1);
        assert_eq!(stats.correlation_rate, 0.5);

        store.close().await;
    }

    #[tokio::test]
    async fn ambiguous_and_unmatched_patterns_are_excluded() {
        let (_temp, _conn, store) = no_refresh_store().await;

        let event = LineageEvent::new(
            EventType::Complete,
            "load_warehouse",
            "run-7",
            "",
            vec![
                DatasetRef::output("postgresql://db/marts.orders"),
                DatasetRef::output("postgresql://db/marts.customers"),
            ],
            ts(0),
        );
        store.store_event(&event).await.unwrap();

        store
            .store_test_result(&TestResult::new(
                "marts_rowcount",
                "postgresql://db/marts.**",
                TestStatus::Fail,
                ts(100),
            ))
            .await
            .unwrap();
        store
            .store_test_result(&TestResult::new(
                "refunds_fresh",
                "postgresql://db/marts.refunds",
                TestStatus::Fail,
                ts(100),
            ))
            .await
            .unwrap();

        let stats = store.compute_health().await.unwrap();
        // Neither pattern resolves to exactly one URN, so no dataset counts
        // toward any total.
        assert_eq!(stats.total_failed_tested_datasets, 0);
        assert_eq!(stats.total_datasets, 0);
        assert_eq!(stats.produced_datasets, 2);
        assert_eq!(stats.correlation_rate, 0.0);

        store.close().await;
    }

    #[tokio::test]
    async fn repeated_identical_events_leave_health_unchanged() {
        let (_temp, _conn, store) = no_refresh_store().await;
        seed_producer(&store).await;

        store
            .store_test_result(&TestResult::new(
                "orders_fresh",
                "postgresql://db/marts.orders",
                TestStatus::Fail,
                ts(100),
            ))
            .await
            .unwrap();

        let baseline = store.compute_health().await.unwrap();

        let replay = LineageEvent::new(
            EventType::Complete,
            "transform_orders",
            "run-1",
            "https://github.com/dbt-labs/dbt-core/tree/1.5.0",
            vec![
                DatasetRef::input("postgresql://db/raw.orders"),
                DatasetRef::output("postgresql://db/marts.orders"),
            ],
            ts(0),
        );
        for _ in 0..100 {
            assert!(store.store_event(&replay).await.unwrap().is_duplicate());
        }

        let after = store.compute_health().await.unwrap();
        assert_eq!(baseline, after);

        store.close().await;
    }

    #[tokio::test]
    async fn orphans_are_reported_most_tested_first() {
        let (_temp, _conn, store) = no_refresh_store().await;
        seed_producer(&store).await;

        // Correlated failure: not an orphan.
        store
            .store_test_result(&TestResult::new(
                "orders_fresh",
                "postgresql://db/marts.orders",
                TestStatus::Fail,
                ts(100),
            ))
            .await
            .unwrap();

        // Input-only dataset: resolved orphan, tested twice.
        for (i, t) in [200, 300].iter().enumerate() {
            store
                .store_test_result(&TestResult::new(
                    format!("raw_orders_check_{i}"),
                    "postgresql://db/raw.orders",
                    TestStatus::Fail,
                    ts(*t),
                ))
                .await
                .unwrap();
        }

        // Unresolvable pattern: orphan keyed by the raw pattern.
        store
            .store_test_result(&TestResult::new(
                "refunds_fresh",
                "postgresql://db/marts.refunds",
                TestStatus::Fail,
                ts(400),
            ))
            .await
            .unwrap();

        let orphans = store.query_orphan_datasets().await.unwrap();
        assert_eq!(orphans.len(), 2);
        assert_eq!(orphans[0].dataset_urn, "postgresql://db/raw.orders");
        assert_eq!(orphans[0].test_count, 2);
        assert_eq!(orphans[0].last_seen, ts(300));
        assert_eq!(orphans[1].dataset_urn, "postgresql://db/marts.refunds");
        assert_eq!(orphans[1].test_count, 1);

        store.close().await;
    }
}
