//! Checkpoint recording and resume policy.
//!
//! A checkpoint is a claim that a stage completed. Claims are re-validated,
//! not trusted: a stage is only skipped while every artifact recorded for it
//! and for all earlier stages still exists on disk. A stale checkpoint is
//! not cleared by being queried — it is overwritten the next time the stage
//! actually succeeds.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::Utc;

use crate::state::StateStore;
use crate::types::{ReleaseState, Stage};

/// True only if `stage` has a checkpoint and no artifact recorded for it or
/// any earlier stage has gone missing.
pub fn should_skip(release: &ReleaseState, stage: Stage) -> bool {
    if !release.checkpoints.contains_key(&stage) {
        return false;
    }
    stale_artifact(release, stage).is_none()
}

/// The first recorded artifact for `stage` or an earlier stage that no
/// longer exists on disk, if any.
pub fn stale_artifact(release: &ReleaseState, stage: Stage) -> Option<(Stage, &Path)> {
    for s in stage.up_to() {
        if let Some(path) = release.stage_artifacts.get(s)
            && !path.exists()
        {
            return Some((*s, path.as_path()));
        }
    }
    None
}

/// Record a completed stage through the store's locked update primitive.
///
/// The checkpoint timestamp is clamped non-decreasing against existing
/// checkpoints, so a later stage never appears to have finished before an
/// earlier one. The fingerprint is write-once: recording a different value
/// for a release that already has one is an error.
pub fn record(
    store: &StateStore,
    release_id: &str,
    stage: Stage,
    artifact: Option<PathBuf>,
    fingerprint: Option<String>,
) -> Result<()> {
    store.update(|doc| {
        let entry = doc
            .entries
            .get_mut(release_id)
            .with_context(|| format!("unknown release {release_id}"))?;

        let now = Utc::now();
        let ts = entry.latest_checkpoint().map_or(now, |prev| now.max(prev));
        entry.checkpoints.insert(stage, ts);

        if let Some(path) = artifact {
            entry.stage_artifacts.insert(stage, path);
        }
        if let Some(fp) = fingerprint {
            if let Some(existing) = &entry.fingerprint
                && *existing != fp
                && entry.checkpoints.contains_key(&Stage::Registered)
            {
                // The artifact was already registered under the old value;
                // silently re-fingerprinting would orphan that registration.
                bail!(
                    "release {release_id} is registered under fingerprint {existing}; refusing to overwrite with {fp}"
                );
            }
            entry.fingerprint = Some(fp);
        }
        entry.updated_at = ts;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    use super::*;
    use crate::types::ReleaseState;

    fn release_with_checkpoint(stage: Stage) -> ReleaseState {
        let mut release = ReleaseState::new("r1");
        release.checkpoints.insert(stage, Utc::now());
        release
    }

    #[test]
    fn missing_checkpoint_means_run() {
        let release = ReleaseState::new("r1");
        assert!(!should_skip(&release, Stage::Staged));
    }

    #[test]
    fn checkpoint_without_artifacts_skips() {
        let release = release_with_checkpoint(Stage::Discovered);
        assert!(should_skip(&release, Stage::Discovered));
    }

    #[test]
    fn checkpoint_with_live_artifact_skips() {
        let td = tempdir().expect("tempdir");
        let artifact = td.path().join("staged");
        std::fs::create_dir(&artifact).expect("mkdir");

        let mut release = release_with_checkpoint(Stage::Staged);
        release.stage_artifacts.insert(Stage::Staged, artifact);
        assert!(should_skip(&release, Stage::Staged));
    }

    #[test]
    fn missing_artifact_invalidates_checkpoint() {
        let td = tempdir().expect("tempdir");
        let artifact = td.path().join("staged");
        std::fs::create_dir(&artifact).expect("mkdir");

        let mut release = release_with_checkpoint(Stage::Staged);
        release.stage_artifacts.insert(Stage::Staged, artifact.clone());
        std::fs::remove_dir(&artifact).expect("delete artifact");

        assert!(!should_skip(&release, Stage::Staged));
        let (stage, path) = stale_artifact(&release, Stage::Staged).expect("stale");
        assert_eq!(stage, Stage::Staged);
        assert_eq!(path, artifact.as_path());
    }

    #[test]
    fn missing_earlier_artifact_invalidates_later_stage() {
        let td = tempdir().expect("tempdir");
        let staged = td.path().join("staged");
        let built = td.path().join("out.torrent");
        std::fs::create_dir(&staged).expect("mkdir");
        std::fs::write(&built, b"x").expect("write");

        let mut release = ReleaseState::new("r1");
        release.checkpoints.insert(Stage::Staged, Utc::now());
        release.checkpoints.insert(Stage::ArtifactBuilt, Utc::now());
        release.stage_artifacts.insert(Stage::Staged, staged.clone());
        release.stage_artifacts.insert(Stage::ArtifactBuilt, built);

        std::fs::remove_dir(&staged).expect("delete staging");
        assert!(!should_skip(&release, Stage::ArtifactBuilt));
    }

    #[test]
    fn record_writes_checkpoint_and_artifact() {
        let td = tempdir().expect("tempdir");
        let store = StateStore::open(td.path()).expect("open");
        store
            .update(|doc| {
                doc.entries.insert("r1".to_string(), ReleaseState::new("r1"));
                Ok(())
            })
            .expect("seed");

        record(
            &store,
            "r1",
            Stage::Staged,
            Some(td.path().join("staged")),
            None,
        )
        .expect("record");

        let doc = store.snapshot().expect("snapshot");
        let entry = &doc.entries["r1"];
        assert!(entry.checkpoints.contains_key(&Stage::Staged));
        assert_eq!(
            entry.stage_artifacts[&Stage::Staged],
            td.path().join("staged")
        );
    }

    #[test]
    fn record_for_unknown_release_fails() {
        let td = tempdir().expect("tempdir");
        let store = StateStore::open(td.path()).expect("open");
        let err = record(&store, "ghost", Stage::Staged, None, None).expect_err("must fail");
        assert!(err.to_string().contains("unknown release"));
    }

    #[test]
    fn timestamps_are_clamped_non_decreasing() {
        let td = tempdir().expect("tempdir");
        let store = StateStore::open(td.path()).expect("open");
        let future = Utc::now() + Duration::minutes(5);
        store
            .update(|doc| {
                let mut release = ReleaseState::new("r1");
                // Simulate a wall-clock regression: the earlier stage was
                // checkpointed with a timestamp ahead of "now".
                release.checkpoints.insert(Stage::Discovered, future);
                doc.entries.insert("r1".to_string(), release);
                Ok(())
            })
            .expect("seed");

        record(&store, "r1", Stage::Staged, None, None).expect("record");

        let doc = store.snapshot().expect("snapshot");
        let entry = &doc.entries["r1"];
        assert!(entry.checkpoints[&Stage::Staged] >= entry.checkpoints[&Stage::Discovered]);
    }

    #[test]
    fn fingerprint_can_change_until_registered() {
        let td = tempdir().expect("tempdir");
        let store = StateStore::open(td.path()).expect("open");
        store
            .update(|doc| {
                doc.entries.insert("r1".to_string(), ReleaseState::new("r1"));
                Ok(())
            })
            .expect("seed");

        record(&store, "r1", Stage::ArtifactBuilt, None, Some("aaaa".to_string()))
            .expect("first record");
        // A rebuilt artifact may hash differently before registration.
        record(&store, "r1", Stage::ArtifactBuilt, None, Some("bbbb".to_string()))
            .expect("rebuild before registration");

        record(&store, "r1", Stage::Registered, None, None).expect("register");
        // Re-recording the same value is fine (stage re-ran, same bytes).
        record(&store, "r1", Stage::ArtifactBuilt, None, Some("bbbb".to_string()))
            .expect("same value again");
        let err = record(&store, "r1", Stage::ArtifactBuilt, None, Some("cccc".to_string()))
            .expect_err("registered fingerprint must be frozen");
        assert!(err.to_string().contains("refusing to overwrite"));
    }
}
