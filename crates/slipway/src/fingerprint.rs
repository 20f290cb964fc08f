//! Content fingerprints for built artifacts.
//!
//! The fingerprint is the SHA-256 of the artifact's `info` dictionary as it
//! appears in the original bytes. The input is fully validated first, then
//! the exact byte span of the `info` entry is hashed — never a re-encoded
//! copy, which could diverge from the original through incidental encoding
//! differences.

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use slipway_bencode::{self as bencode, BencodeError};
use thiserror::Error;

/// Key of the canonical sub-structure the fingerprint is derived from.
pub const INFO_KEY: &[u8] = b"info";

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("artifact is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("artifact has no top-level info dictionary")]
    MissingInfo,
}

/// Compute the fingerprint of a complete artifact byte stream.
///
/// The same bytes always yield the same fingerprint (lowercase hex).
pub fn extract_fingerprint(artifact: &[u8]) -> Result<String, FingerprintError> {
    // Full strict validation up front: truncated input, unsorted keys, and
    // trailing bytes are all rejected before anything is hashed.
    bencode::decode(artifact)?;

    let span =
        bencode::top_level_entry_span(artifact, INFO_KEY)?.ok_or(FingerprintError::MissingInfo)?;
    let digest = Sha256::digest(&artifact[span]);
    Ok(hex::encode(digest))
}

/// Fingerprint an artifact file on disk.
pub fn fingerprint_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read artifact {}", path.display()))?;
    extract_fingerprint(&bytes)
        .with_context(|| format!("failed to fingerprint artifact {}", path.display()))
}
