//! Filesystem implementations of the staging, metadata, and build
//! collaborators.
//!
//! A release lives under `<source_root>/<id>/` with its content in
//! `content/` and a `release.toml` sidecar for the descriptive fields.
//! Staging copies the content into `<staging_root>/<id>/`; building
//! produces `<output_root>/<id>/<id>.torrent`. Every stage writes into a
//! unique per-release location so that artifact existence checks are
//! race-free.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::StageOps;
use crate::torrent::TorrentBuilder;
use crate::types::{ReleaseMetadata, StageError, StageResult};

pub const METADATA_FILE: &str = "release.toml";
pub const CONTENT_DIR: &str = "content";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MetadataFile {
    title: String,
    author: String,
    #[serde(default)]
    extra: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct FsWorkshop {
    source_root: PathBuf,
    staging_root: PathBuf,
    output_root: PathBuf,
    torrent: TorrentBuilder,
}

impl FsWorkshop {
    pub fn new(
        source_root: PathBuf,
        staging_root: PathBuf,
        output_root: PathBuf,
        announce: impl Into<String>,
    ) -> Self {
        Self {
            source_root,
            staging_root,
            output_root,
            torrent: TorrentBuilder::new(announce),
        }
    }

    pub fn with_torrent_builder(mut self, torrent: TorrentBuilder) -> Self {
        self.torrent = torrent;
        self
    }

    fn source_dir(&self, release_id: &str) -> PathBuf {
        self.source_root.join(release_id)
    }

    pub fn staging_dir(&self, release_id: &str) -> PathBuf {
        self.staging_root.join(release_id)
    }

    pub fn artifact_path(&self, release_id: &str) -> PathBuf {
        self.output_root
            .join(release_id)
            .join(format!("{release_id}.torrent"))
    }
}

impl StageOps for FsWorkshop {
    fn stage_artifacts(&mut self, release_id: &str) -> StageResult<PathBuf> {
        let content = self.source_dir(release_id).join(CONTENT_DIR);
        if !content.is_dir() {
            return Err(StageError::permanent(format!(
                "no content directory for release {release_id} at {}",
                content.display()
            )));
        }

        let staging = self.staging_dir(release_id);
        // A half-staged directory from an interrupted run is replaced
        // wholesale; staging must end byte-identical to the source.
        if staging.exists() {
            fs::remove_dir_all(&staging).map_err(|err| {
                StageError::transient(format!(
                    "failed to clear stale staging dir {}: {err}",
                    staging.display()
                ))
            })?;
        }
        copy_dir(&content, &staging).map_err(|err| {
            StageError::transient(format!(
                "failed to stage {} into {}: {err}",
                content.display(),
                staging.display()
            ))
        })?;
        Ok(staging)
    }

    fn fetch_metadata(&mut self, release_id: &str) -> StageResult<ReleaseMetadata> {
        let path = self.source_dir(release_id).join(METADATA_FILE);
        let content = fs::read_to_string(&path).map_err(|err| {
            StageError::permanent(format!(
                "failed to read metadata sidecar {}: {err}",
                path.display()
            ))
        })?;
        let parsed: MetadataFile = toml::from_str(&content).map_err(|err| {
            StageError::permanent(format!(
                "invalid metadata sidecar {}: {err}",
                path.display()
            ))
        })?;
        Ok(ReleaseMetadata {
            title: parsed.title,
            author: parsed.author,
            extra: parsed.extra,
        })
    }

    fn build_artifact(
        &mut self,
        release_id: &str,
        _metadata: &ReleaseMetadata,
    ) -> StageResult<PathBuf> {
        let staging = self.staging_dir(release_id);
        if !staging.is_dir() {
            return Err(StageError::permanent(format!(
                "staging dir {} is missing; cannot build artifact",
                staging.display()
            )));
        }
        let out = self.artifact_path(release_id);
        self.torrent
            .build(release_id, &staging, &out)
            .map_err(|err| StageError::permanent(format!("{err:#}")))?;
        Ok(out)
    }
}

fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
