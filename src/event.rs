//! Lineage event and data-quality test domain models.
//!
//! `LineageEvent` describes one run-state update of a data job together with
//! the datasets it read and wrote. Events are immutable once persisted;
//! their identity for duplicate detection is a deterministic fingerprint,
//! not the caller-supplied event id.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Longest accepted test identifier.
const MAX_TEST_ID_LEN: usize = 750;

/// Run states of a lineage event.
///
/// Terminal states (COMPLETE, FAIL, ABORT) describe a finished run and do
/// not transition further.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Start,
    Running,
    Complete,
    Fail,
    Abort,
    Other,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Start => "START",
            EventType::Running => "RUNNING",
            EventType::Complete => "COMPLETE",
            EventType::Fail => "FAIL",
            EventType::Abort => "ABORT",
            EventType::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "START" => Some(EventType::Start),
            "RUNNING" => Some(EventType::Running),
            "COMPLETE" => Some(EventType::Complete),
            "FAIL" => Some(EventType::Fail),
            "ABORT" => Some(EventType::Abort),
            "OTHER" => Some(EventType::Other),
            _ => None,
        }
    }

    /// True for run states that describe a finished run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventType::Complete | EventType::Fail | EventType::Abort)
    }
}

/// Role of a dataset within an event: consumed or produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatasetRole {
    Input,
    Output,
}

impl DatasetRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetRole::Input => "INPUT",
            DatasetRole::Output => "OUTPUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INPUT" => Some(DatasetRole::Input),
            "OUTPUT" => Some(DatasetRole::Output),
            _ => None,
        }
    }
}

/// A dataset reference carried by a lineage event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetRef {
    pub urn: String,
    pub role: DatasetRole,
}

impl DatasetRef {
    pub fn input(urn: impl Into<String>) -> Self {
        Self { urn: urn.into(), role: DatasetRole::Input }
    }

    pub fn output(urn: impl Into<String>) -> Self {
        Self { urn: urn.into(), role: DatasetRole::Output }
    }
}

/// One lineage event: a run-state update of a job with its dataset inputs
/// and outputs and the producer tool that emitted it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEvent {
    pub event_id: String,
    pub event_type: EventType,
    pub job_name: String,
    pub run_id: String,
    /// Producer URI of the emitting tool. May be empty or malformed; it
    /// degrades to the "unknown" producer instead of failing ingestion.
    pub producer_url: String,
    pub datasets: Vec<DatasetRef>,
    pub occurred_at: DateTime<Utc>,
}

impl LineageEvent {
    /// Create an event with a fresh random event id.
    pub fn new(
        event_type: EventType,
        job_name: impl Into<String>,
        run_id: impl Into<String>,
        producer_url: impl Into<String>,
        datasets: Vec<DatasetRef>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            job_name: job_name.into(),
            run_id: run_id.into(),
            producer_url: producer_url.into(),
            datasets,
            occurred_at,
        }
    }

    /// Deterministic identity of the logical event.
    ///
    /// Two events with the same run id, event type, occurrence time and
    /// dataset URN set are the same logical event, regardless of event id,
    /// dataset ordering or producer URL.
    ///
    /// Returns a 64-character lowercase hex SHA-256 digest.
    pub fn fingerprint(&self) -> String {
        let mut urns: Vec<&str> = self.datasets.iter().map(|d| d.urn.as_str()).collect();
        urns.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(self.run_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.event_type.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(
            self.occurred_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .as_bytes(),
        );
        for urn in urns {
            hasher.update([0x1f]);
            hasher.update(urn.as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Structural validation performed before any I/O.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.run_id.trim().is_empty() {
            return Err(ValidationError::MissingRunId);
        }
        if self.job_name.trim().is_empty() {
            return Err(ValidationError::MissingJobName);
        }
        if self.datasets.is_empty() {
            return Err(ValidationError::NoDatasets);
        }
        if self.datasets.iter().any(|d| d.urn.trim().is_empty()) {
            return Err(ValidationError::EmptyDatasetUrn);
        }

        Ok(())
    }
}

/// Outcome of a data-quality test execution.
///
/// Only FAIL and ERROR contribute to incident correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "PASS",
            TestStatus::Fail => "FAIL",
            TestStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PASS" => Some(TestStatus::Pass),
            "FAIL" => Some(TestStatus::Fail),
            "ERROR" => Some(TestStatus::Error),
            _ => None,
        }
    }

    /// True for outcomes that count as incidents.
    pub fn is_incident(&self) -> bool {
        matches!(self, TestStatus::Fail | TestStatus::Error)
    }
}

/// A data-quality test result against a dataset URN pattern.
///
/// The pattern may contain wildcards (`*` within a path segment, `**`
/// across segments); resolving it to a concrete dataset URN is the job of
/// the correlation health aggregator, not of ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test_id: String,
    pub dataset_urn_pattern: String,
    pub status: TestStatus,
    pub observed_at: DateTime<Utc>,
}

impl TestResult {
    pub fn new(
        test_id: impl Into<String>,
        dataset_urn_pattern: impl Into<String>,
        status: TestStatus,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            test_id: test_id.into(),
            dataset_urn_pattern: dataset_urn_pattern.into(),
            status,
            observed_at,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.test_id.trim().is_empty() {
            return Err(ValidationError::MissingTestId);
        }
        if self.test_id.len() > MAX_TEST_ID_LEN {
            return Err(ValidationError::TestIdTooLong(self.test_id.len()));
        }
        if self.dataset_urn_pattern.trim().is_empty() {
            return Err(ValidationError::MissingPattern);
        }

        Ok(())
    }
}

/// Structural validation failures, rejected before any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    MissingRunId,
    MissingJobName,
    NoDatasets,
    EmptyDatasetUrn,
    MissingTestId,
    TestIdTooLong(usize),
    MissingPattern,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::MissingRunId => write!(f, "run_id cannot be empty"),
            ValidationError::MissingJobName => write!(f, "job_name cannot be empty"),
            ValidationError::NoDatasets => {
                write!(f, "event must reference at least one dataset")
            }
            ValidationError::EmptyDatasetUrn => write!(f, "dataset urn cannot be empty"),
            ValidationError::MissingTestId => write!(f, "test_id cannot be empty"),
            ValidationError::TestIdTooLong(len) => {
                write!(f, "test_id cannot exceed {MAX_TEST_ID_LEN} characters: got {len}")
            }
            ValidationError::MissingPattern => {
                write!(f, "dataset_urn_pattern cannot be empty")
            }
        }
    }
}

impl std::error::Error for ValidationError {}
