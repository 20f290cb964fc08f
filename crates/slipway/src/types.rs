use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One step of the fixed pipeline sequence.
///
/// The order of [`Stage::SEQUENCE`] is the order releases move through; a
/// later stage is never checkpointed before an earlier one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discovered,
    Staged,
    MetadataFetched,
    ArtifactBuilt,
    Registered,
}

impl Stage {
    pub const SEQUENCE: [Stage; 5] = [
        Stage::Discovered,
        Stage::Staged,
        Stage::MetadataFetched,
        Stage::ArtifactBuilt,
        Stage::Registered,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Discovered => "discovered",
            Stage::Staged => "staged",
            Stage::MetadataFetched => "metadata_fetched",
            Stage::ArtifactBuilt => "artifact_built",
            Stage::Registered => "registered",
        }
    }

    /// The sequence up to and including `self`.
    pub fn up_to(self) -> &'static [Stage] {
        let idx = Stage::SEQUENCE
            .iter()
            .position(|s| *s == self)
            .unwrap_or(Stage::SEQUENCE.len() - 1);
        &Stage::SEQUENCE[..=idx]
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a release record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// Classification of a stage failure, persisted so operators can tell a
/// credential problem from a flaky network without reading logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network/timeout class failures; worth retrying via `clear-failure`.
    Transient,
    /// Credential failures; retrying blindly will not help.
    Auth,
    /// Everything that will fail the same way again (bad input, parse errors).
    Permanent,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Auth => "auth",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure returned by a stage collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct StageError {
    pub class: ErrorClass,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Transient, message: message.into() }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Auth, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { class: ErrorClass::Permanent, message: message.into() }
    }
}

pub type StageResult<T> = Result<T, StageError>;

/// Failure bookkeeping for a release, present only while `status` is
/// [`ReleaseStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub stage: Stage,
    pub class: ErrorClass,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub retry_count: u32,
}

/// Human-facing descriptive fields. Informational only: never used for
/// identity or control flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    pub title: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// One persistent record per release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseState {
    pub id: String,
    #[serde(default)]
    pub metadata: Option<ReleaseMetadata>,
    /// Paths produced by completed stages, keyed by stage. Used to detect
    /// stale checkpoints: a checkpoint whose artifact vanished is not
    /// trusted.
    #[serde(default)]
    pub stage_artifacts: BTreeMap<Stage, PathBuf>,
    /// Content fingerprint of the built artifact. Set exactly once, when
    /// the artifact-building stage succeeds.
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Completion timestamp per stage; a missing entry means "not done".
    #[serde(default)]
    pub checkpoints: BTreeMap<Stage, DateTime<Utc>>,
    pub status: ReleaseStatus,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    /// Total failures recorded for this release, across operator clears.
    #[serde(default)]
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReleaseState {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            metadata: None,
            stage_artifacts: BTreeMap::new(),
            fingerprint: None,
            checkpoints: BTreeMap::new(),
            status: ReleaseStatus::Pending,
            failure: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn checkpoint(&self, stage: Stage) -> Option<DateTime<Utc>> {
        self.checkpoints.get(&stage).copied()
    }

    /// The most recent checkpoint timestamp across all stages.
    pub fn latest_checkpoint(&self) -> Option<DateTime<Utc>> {
        self.checkpoints.values().max().copied()
    }

    /// The last stage in sequence order that has a checkpoint.
    pub fn last_completed_stage(&self) -> Option<Stage> {
        Stage::SEQUENCE
            .iter()
            .rev()
            .find(|s| self.checkpoints.contains_key(s))
            .copied()
    }
}

/// The tracker a run registers artifacts with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    /// Short tracker name used in logs and receipts.
    pub name: String,
    /// Base URL for the tracker web API, e.g. `https://tracker.example.net`.
    pub api_base: String,
}

/// Outcome of one release within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Reached `COMPLETE` (possibly with every stage skipped).
    Completed,
    /// A stage failed during this run.
    Failed,
    /// Left untouched because it was already `FAILED` before the run.
    SkippedFailed,
}

/// Per-release entry of a [`RunReceipt`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseReceipt {
    pub id: String,
    pub outcome: ReleaseOutcome,
    pub stages_run: Vec<Stage>,
    pub stages_skipped: Vec<Stage>,
    #[serde(default)]
    pub fingerprint: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Audit receipt for a whole engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReceipt {
    pub receipt_version: String,
    pub tracker: Tracker,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub releases: Vec<ReleaseReceipt>,
}

impl RunReceipt {
    pub fn completed(&self) -> usize {
        self.releases
            .iter()
            .filter(|r| r.outcome == ReleaseOutcome::Completed)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.releases
            .iter()
            .filter(|r| r.outcome != ReleaseOutcome::Completed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_sequence_is_fixed_and_ordered() {
        assert_eq!(Stage::SEQUENCE.len(), 5);
        assert_eq!(Stage::SEQUENCE[0], Stage::Discovered);
        assert_eq!(Stage::SEQUENCE[4], Stage::Registered);
        for pair in Stage::SEQUENCE.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn up_to_includes_self_and_predecessors() {
        assert_eq!(Stage::Discovered.up_to(), &[Stage::Discovered]);
        assert_eq!(
            Stage::MetadataFetched.up_to(),
            &[Stage::Discovered, Stage::Staged, Stage::MetadataFetched]
        );
        assert_eq!(Stage::Registered.up_to(), &Stage::SEQUENCE[..]);
    }

    #[test]
    fn stage_serializes_as_snake_case_map_key() {
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(Stage::MetadataFetched, Utc::now());
        let json = serde_json::to_string(&checkpoints).expect("serialize");
        assert!(json.contains("\"metadata_fetched\""));
        let parsed: BTreeMap<Stage, DateTime<Utc>> =
            serde_json::from_str(&json).expect("deserialize");
        assert!(parsed.contains_key(&Stage::MetadataFetched));
    }

    #[test]
    fn new_release_starts_pending_with_no_checkpoints() {
        let release = ReleaseState::new("r1");
        assert_eq!(release.status, ReleaseStatus::Pending);
        assert!(release.checkpoints.is_empty());
        assert!(release.fingerprint.is_none());
        assert_eq!(release.attempts, 0);
        assert_eq!(release.last_completed_stage(), None);
    }

    #[test]
    fn release_state_roundtrips_json() {
        let mut release = ReleaseState::new("r1");
        release.checkpoints.insert(Stage::Discovered, Utc::now());
        release.stage_artifacts.insert(Stage::Staged, PathBuf::from("x/y"));
        release.failure = Some(FailureRecord {
            stage: Stage::Staged,
            class: ErrorClass::Transient,
            message: "connection reset".to_string(),
            occurred_at: Utc::now(),
            retry_count: 1,
        });

        let json = serde_json::to_string_pretty(&release).expect("serialize");
        let parsed: ReleaseState = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed.id, "r1");
        assert_eq!(parsed.last_completed_stage(), Some(Stage::Discovered));
        assert_eq!(parsed.failure.expect("failure").class, ErrorClass::Transient);
    }

    #[test]
    fn stage_error_constructors_set_class() {
        assert_eq!(StageError::transient("x").class, ErrorClass::Transient);
        assert_eq!(StageError::auth("x").class, ErrorClass::Auth);
        assert_eq!(StageError::permanent("x").class, ErrorClass::Permanent);
        assert_eq!(StageError::transient("boom").to_string(), "boom");
    }

    #[test]
    fn receipt_counts_outcomes() {
        let now = Utc::now();
        let entry = |outcome| ReleaseReceipt {
            id: "r".to_string(),
            outcome,
            stages_run: vec![],
            stages_skipped: vec![],
            fingerprint: None,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        };
        let receipt = RunReceipt {
            receipt_version: "slipway.receipt.v1".to_string(),
            tracker: Tracker {
                name: "local".to_string(),
                api_base: "http://127.0.0.1:9999".to_string(),
            },
            started_at: now,
            finished_at: now,
            releases: vec![
                entry(ReleaseOutcome::Completed),
                entry(ReleaseOutcome::Failed),
                entry(ReleaseOutcome::SkippedFailed),
            ],
        };
        assert_eq!(receipt.completed(), 1);
        assert_eq!(receipt.failed(), 2);
    }
}
