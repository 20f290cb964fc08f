//! # Slipway
//!
//! A crash-safe, resumable release pipeline for torrent trackers.
//!
//! Slipway moves a release through a fixed stage sequence — stage the
//! source files, fetch descriptive metadata, build a content-addressed
//! torrent artifact, register it with a tracker — and makes that pipeline
//! safe to kill and safe to re-run at any point.
//!
//! ## Guarantees
//!
//! - **Crash safety** — The state store is only ever replaced atomically
//!   (temp file, fsync, rename); a killed process never leaves a
//!   half-written store behind.
//! - **Resumability** — Each completed stage is checkpointed. A re-run
//!   skips checkpointed stages, but only while the artifacts those stages
//!   produced still exist on disk; a deleted staging directory re-runs its
//!   stage instead of being trusted blindly.
//! - **At-most-once registration** — Before uploading, the tracker is asked
//!   whether the artifact's fingerprint already exists. However often the
//!   pipeline is interrupted and resumed, registration happens at most once
//!   per fingerprint.
//! - **Single flight** — A non-blocking run lock rejects a second
//!   concurrent invocation immediately, before any state is touched.
//!
//! ## Pipeline
//!
//! `DISCOVERED → STAGED → METADATA_FETCHED → ARTIFACT_BUILT → REGISTERED`
//!
//! A stage failure marks the release `FAILED` with a classified failure
//! record and moves on to the next release; an operator clears the failure
//! to retry, and the retry resumes from the failed stage rather than
//! restarting.
//!
//! ## Key Types
//!
//! - [`types::ReleaseState`] — the persistent per-release record
//! - [`state::StateStore`] — locked, atomic read-modify-write persistence
//! - [`lock::RunLock`] — process-level mutual exclusion
//! - [`engine::StageOps`] / [`engine::TrackerOps`] — collaborator seams
//! - [`types::RunReceipt`] — audit receipt for a whole invocation
//!
//! ## Modules
//!
//! - [`engine`] — pipeline orchestration and resume logic
//! - [`state`] — state store persistence and schema validation
//! - [`checkpoint`] — checkpoint recording and skip policy
//! - [`lock`] — run-level advisory lock
//! - [`fingerprint`] — artifact content fingerprints
//! - [`torrent`] — torrent artifact construction
//! - [`tracker`] — tracker API client
//! - [`workshop`] — filesystem stage collaborators
//! - [`events`] — append-only JSONL event log
//! - [`config`] — `.slipway.toml` loading
//! - [`types`] — domain types shared across the crate

/// Checkpoint recording and skip policy.
pub mod checkpoint;

/// Configuration file (`.slipway.toml`) loading.
pub mod config;

/// Pipeline orchestration and resume logic.
pub mod engine;

/// Append-only JSONL event log.
pub mod events;

/// Artifact content fingerprints.
pub mod fingerprint;

/// Run-level advisory lock.
pub mod lock;

/// State store persistence and schema validation.
pub mod state;

/// Torrent artifact construction.
pub mod torrent;

/// Tracker API client.
pub mod tracker;

/// Domain types shared across the crate.
pub mod types;

/// Filesystem stage collaborators.
pub mod workshop;

/// Bencode codec.
/// Re-exported from the slipway-bencode microcrate.
pub use slipway_bencode as bencode;
