//! Pipeline orchestration: checkpointed, resumable stage execution.
//!
//! The engine drives each release through the fixed stage sequence,
//! consulting the checkpoint tracker before every stage, invoking the
//! collaborators that do the actual work, and committing a checkpoint after
//! each success. Stage failures are recorded on the release and the run
//! moves on to the next release; only an untrustworthy store (corruption,
//! unknown schema) aborts the whole invocation.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;

use crate::checkpoint;
use crate::events::{EventKind, EventLog, events_path};
use crate::fingerprint;
use crate::state::{self, RECEIPT_VERSION, StateStore};
use crate::types::{
    FailureRecord, ReleaseMetadata, ReleaseOutcome, ReleaseReceipt, ReleaseState, ReleaseStatus,
    RunReceipt, Stage, StageError, StageResult, Tracker,
};

pub trait Reporter {
    fn info(&mut self, msg: &str);
    fn warn(&mut self, msg: &str);
    fn error(&mut self, msg: &str);
}

/// Collaborators that do the per-stage work the engine checkpoints.
pub trait StageOps {
    /// Place the release's source files into a per-release staging
    /// location and return its path.
    fn stage_artifacts(&mut self, release_id: &str) -> StageResult<PathBuf>;

    /// Produce the human-facing metadata for the release.
    fn fetch_metadata(&mut self, release_id: &str) -> StageResult<ReleaseMetadata>;

    /// Build the registrable artifact and return its path.
    fn build_artifact(
        &mut self,
        release_id: &str,
        metadata: &ReleaseMetadata,
    ) -> StageResult<PathBuf>;
}

/// The external system artifacts are registered with.
pub trait TrackerOps {
    /// Idempotency probe: does the tracker already know this fingerprint?
    fn has_fingerprint(&self, fingerprint: &str) -> StageResult<bool>;

    /// Irreversible registration side effect.
    fn register(&self, artifact: &Path, metadata: &ReleaseMetadata) -> StageResult<()>;
}

enum StageOutput {
    Nothing,
    Artifact(PathBuf),
    Metadata(ReleaseMetadata),
    Built { artifact: PathBuf, fingerprint: String },
}

/// Run the pipeline for `release_ids` against `store`.
///
/// Callers are expected to hold the run lock (`lock::RunLock`) for the
/// duration; the engine itself only takes the store lock around individual
/// reads and writes.
pub fn run_pipeline(
    store: &StateStore,
    tracker_info: &Tracker,
    ops: &mut dyn StageOps,
    tracker: &dyn TrackerOps,
    reporter: &mut dyn Reporter,
    release_ids: &[String],
) -> Result<RunReceipt> {
    let started_at = Utc::now();
    // An unreadable or unrecognized store aborts the whole invocation
    // before any release is touched; progress could not be recorded
    // trustworthily.
    store.snapshot()?;

    let mut log = EventLog::new(events_path(store.state_dir()));
    log.record("all", EventKind::RunStarted { release_count: release_ids.len() });
    log.flush()?;

    let mut releases = Vec::with_capacity(release_ids.len());
    for id in release_ids {
        let receipt = process_release(store, ops, tracker, reporter, &mut log, id)?;
        log.flush()?;
        releases.push(receipt);
    }

    let receipt = RunReceipt {
        receipt_version: RECEIPT_VERSION.to_string(),
        tracker: tracker_info.clone(),
        started_at,
        finished_at: Utc::now(),
        releases,
    };
    log.record(
        "all",
        EventKind::RunFinished { completed: receipt.completed(), failed: receipt.failed() },
    );
    log.flush()?;
    state::write_receipt(store.state_dir(), &receipt)?;
    Ok(receipt)
}

/// Reset a failed release to `PENDING`, preserving its checkpoints so a
/// retry resumes instead of restarting. Operator action; not called by the
/// engine itself.
pub fn clear_failure(store: &StateStore, release_id: &str) -> Result<()> {
    store.update(|doc| {
        let entry = doc
            .entries
            .get_mut(release_id)
            .with_context(|| format!("unknown release {release_id}"))?;
        if entry.status != ReleaseStatus::Failed {
            anyhow::bail!("release {release_id} has no failure to clear");
        }
        entry.failure = None;
        entry.status = ReleaseStatus::Pending;
        entry.updated_at = Utc::now();
        Ok(())
    })
}

fn process_release(
    store: &StateStore,
    ops: &mut dyn StageOps,
    tracker: &dyn TrackerOps,
    reporter: &mut dyn Reporter,
    log: &mut EventLog,
    id: &str,
) -> Result<ReleaseReceipt> {
    let started_at = Utc::now();
    let start = Instant::now();
    let mut stages_run = Vec::new();
    let mut stages_skipped = Vec::new();

    // DISCOVERED begins here: an unknown id gets a fresh PENDING record.
    let entry = store.update(|doc| {
        let entry = doc
            .entries
            .entry(id.to_string())
            .or_insert_with(|| ReleaseState::new(id));
        Ok(entry.clone())
    })?;

    if entry.status == ReleaseStatus::Failed {
        let detail = entry
            .failure
            .as_ref()
            .map(|f| format!("{} at {}: {}", f.class, f.stage, f.message))
            .unwrap_or_else(|| "no failure record".to_string());
        reporter.warn(&format!(
            "{id}: left untouched; previous run failed ({detail}); clear the failure to retry"
        ));
        log.record(id, EventKind::ReleaseLeftFailed);
        return Ok(ReleaseReceipt {
            id: id.to_string(),
            outcome: ReleaseOutcome::SkippedFailed,
            stages_run,
            stages_skipped,
            fingerprint: entry.fingerprint,
            started_at,
            finished_at: Utc::now(),
            duration_ms: start.elapsed().as_millis() as u64,
        });
    }

    log.record(id, EventKind::ReleaseStarted);

    for stage in Stage::SEQUENCE {
        // Re-snapshot every iteration: earlier stages in this run have
        // already mutated the record.
        let release = load_release(store, id)?;

        if checkpoint::should_skip(&release, stage) {
            reporter.info(&format!("{id}: {stage} already done (skipping)"));
            log.record(id, EventKind::StageSkipped { stage });
            stages_skipped.push(stage);
            continue;
        }
        if let Some((stale_stage, path)) = checkpoint::stale_artifact(&release, stage)
            && release.checkpoints.contains_key(&stage)
        {
            reporter.warn(&format!(
                "{id}: checkpoint for {stage} is stale ({} from {stale_stage} is missing); re-running",
                path.display()
            ));
            log.record(
                id,
                EventKind::CheckpointInvalidated { stage, path: path.to_path_buf() },
            );
        }

        reporter.info(&format!("{id}: running {stage}..."));
        log.record(id, EventKind::StageStarted { stage });
        store.update(|doc| {
            let entry = doc
                .entries
                .get_mut(id)
                .with_context(|| format!("unknown release {id}"))?;
            entry.status = ReleaseStatus::InProgress;
            entry.updated_at = Utc::now();
            Ok(())
        })?;

        let stage_start = Instant::now();
        match invoke_stage(ops, tracker, reporter, log, &release, stage) {
            Ok(output) => {
                commit_stage(store, id, stage, output)?;
                log.record(
                    id,
                    EventKind::StageCompleted {
                        stage,
                        duration_ms: stage_start.elapsed().as_millis() as u64,
                    },
                );
                stages_run.push(stage);
            }
            Err(err) => {
                let failure = record_failure(store, id, stage, &err)?;
                reporter.error(&format!(
                    "{id}: {stage} failed ({}): {} (attempt {})",
                    err.class, err.message, failure.retry_count
                ));
                log.record(
                    id,
                    EventKind::StageFailed {
                        stage,
                        class: err.class,
                        message: err.message.clone(),
                    },
                );
                let fingerprint = load_release(store, id)?.fingerprint;
                return Ok(ReleaseReceipt {
                    id: id.to_string(),
                    outcome: ReleaseOutcome::Failed,
                    stages_run,
                    stages_skipped,
                    fingerprint,
                    started_at,
                    finished_at: Utc::now(),
                    duration_ms: start.elapsed().as_millis() as u64,
                });
            }
        }
    }

    let fingerprint = store.update(|doc| {
        let entry = doc
            .entries
            .get_mut(id)
            .with_context(|| format!("unknown release {id}"))?;
        entry.status = ReleaseStatus::Complete;
        entry.updated_at = Utc::now();
        Ok(entry.fingerprint.clone())
    })?;
    reporter.info(&format!("{id}: complete"));
    log.record(id, EventKind::ReleaseCompleted);

    Ok(ReleaseReceipt {
        id: id.to_string(),
        outcome: ReleaseOutcome::Completed,
        stages_run,
        stages_skipped,
        fingerprint,
        started_at,
        finished_at: Utc::now(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn invoke_stage(
    ops: &mut dyn StageOps,
    tracker: &dyn TrackerOps,
    reporter: &mut dyn Reporter,
    log: &mut EventLog,
    release: &ReleaseState,
    stage: Stage,
) -> StageResult<StageOutput> {
    let id = release.id.as_str();
    match stage {
        // Discovery's work (creating the record) already happened; the
        // checkpoint just makes it visible in the store.
        Stage::Discovered => Ok(StageOutput::Nothing),
        Stage::Staged => ops.stage_artifacts(id).map(StageOutput::Artifact),
        Stage::MetadataFetched => ops.fetch_metadata(id).map(StageOutput::Metadata),
        Stage::ArtifactBuilt => {
            let metadata = release.metadata.as_ref().ok_or_else(|| {
                StageError::permanent("metadata missing; earlier stage left no record")
            })?;
            let artifact = ops.build_artifact(id, metadata)?;
            let fingerprint = fingerprint::fingerprint_file(&artifact)
                .map_err(|err| StageError::permanent(format!("{err:#}")))?;
            Ok(StageOutput::Built { artifact, fingerprint })
        }
        Stage::Registered => {
            let fingerprint = release.fingerprint.as_deref().ok_or_else(|| {
                StageError::permanent("fingerprint missing; artifact stage left no record")
            })?;
            if tracker.has_fingerprint(fingerprint)? {
                reporter.info(&format!(
                    "{id}: fingerprint {fingerprint} already registered (skipping upload)"
                ));
                log.record(
                    id,
                    EventKind::RegistrationSkipped { fingerprint: fingerprint.to_string() },
                );
                return Ok(StageOutput::Nothing);
            }
            let artifact = release.stage_artifacts.get(&Stage::ArtifactBuilt).ok_or_else(
                || StageError::permanent("artifact path missing; artifact stage left no record"),
            )?;
            let metadata = release.metadata.as_ref().ok_or_else(|| {
                StageError::permanent("metadata missing; earlier stage left no record")
            })?;
            tracker.register(artifact, metadata)?;
            Ok(StageOutput::Nothing)
        }
    }
}

fn commit_stage(store: &StateStore, id: &str, stage: Stage, output: StageOutput) -> Result<()> {
    match output {
        StageOutput::Nothing => checkpoint::record(store, id, stage, None, None),
        StageOutput::Artifact(path) => checkpoint::record(store, id, stage, Some(path), None),
        StageOutput::Metadata(metadata) => {
            store.update(|doc| {
                let entry = doc
                    .entries
                    .get_mut(id)
                    .with_context(|| format!("unknown release {id}"))?;
                entry.metadata = Some(metadata);
                Ok(())
            })?;
            checkpoint::record(store, id, stage, None, None)
        }
        StageOutput::Built { artifact, fingerprint } => {
            checkpoint::record(store, id, stage, Some(artifact), Some(fingerprint))
        }
    }
}

fn record_failure(
    store: &StateStore,
    id: &str,
    stage: Stage,
    err: &StageError,
) -> Result<FailureRecord> {
    store.update(|doc| {
        let entry = doc
            .entries
            .get_mut(id)
            .with_context(|| format!("unknown release {id}"))?;
        entry.attempts += 1;
        let failure = FailureRecord {
            stage,
            class: err.class,
            message: err.message.clone(),
            occurred_at: Utc::now(),
            retry_count: entry.attempts,
        };
        entry.status = ReleaseStatus::Failed;
        entry.failure = Some(failure.clone());
        entry.updated_at = failure.occurred_at;
        Ok(failure)
    })
}

fn load_release(store: &StateStore, id: &str) -> Result<ReleaseState> {
    let doc = store.snapshot()?;
    doc.entries
        .get(id)
        .cloned()
        .with_context(|| format!("release {id} vanished from the store"))
}
