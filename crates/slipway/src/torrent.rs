//! Torrent artifact construction.
//!
//! Builds the content-addressed artifact the pipeline registers: files are
//! walked in sorted order, hashed in fixed-size pieces with SHA-256, and
//! assembled into a canonical bencode document. The same staged content
//! always produces byte-identical output, which is what makes the artifact
//! fingerprint a stable idempotency key.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use slipway_bencode::{self as bencode, Value};

/// Default piece size: 256 KiB.
pub const DEFAULT_PIECE_LENGTH: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct TorrentBuilder {
    announce: String,
    piece_length: usize,
}

impl TorrentBuilder {
    pub fn new(announce: impl Into<String>) -> Self {
        Self { announce: announce.into(), piece_length: DEFAULT_PIECE_LENGTH }
    }

    pub fn piece_length(mut self, piece_length: usize) -> Self {
        self.piece_length = piece_length;
        self
    }

    /// Build a torrent for `content_dir` and write it to `out_path`.
    ///
    /// The `info.name` is `name`; with exactly one file in the staging
    /// directory the single-file form (`length`) is used, otherwise the
    /// multi-file form (`files`).
    pub fn build(&self, name: &str, content_dir: &Path, out_path: &Path) -> Result<()> {
        if self.piece_length == 0 {
            bail!("piece length must be non-zero");
        }
        let files = collect_files(content_dir)?;
        if files.is_empty() {
            bail!("staging directory {} contains no files", content_dir.display());
        }

        let (pieces, total_length) = hash_pieces(content_dir, &files, self.piece_length)?;

        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), Value::bytes(name.as_bytes().to_vec()));
        info.insert(b"piece length".to_vec(), Value::Int(self.piece_length as i64));
        info.insert(b"pieces".to_vec(), Value::Bytes(pieces));
        if files.len() == 1 && files[0].components().count() == 1 {
            info.insert(b"length".to_vec(), Value::Int(total_length));
        } else {
            let entries = files
                .iter()
                .map(|rel| {
                    let mut entry = BTreeMap::new();
                    let length = fs::metadata(content_dir.join(rel))
                        .with_context(|| format!("failed to stat {}", rel.display()))?
                        .len() as i64;
                    entry.insert(b"length".to_vec(), Value::Int(length));
                    let path_parts = rel
                        .components()
                        .map(|c| Value::bytes(c.as_os_str().to_string_lossy().into_owned()))
                        .collect();
                    entry.insert(b"path".to_vec(), Value::List(path_parts));
                    Ok(Value::Dict(entry))
                })
                .collect::<Result<Vec<_>>>()?;
            info.insert(b"files".to_vec(), Value::List(entries));
        }

        let mut root = BTreeMap::new();
        root.insert(b"announce".to_vec(), Value::bytes(self.announce.as_bytes().to_vec()));
        root.insert(
            b"created by".to_vec(),
            Value::bytes(format!("slipway/{}", env!("CARGO_PKG_VERSION"))),
        );
        root.insert(b"info".to_vec(), Value::Dict(info));

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create output dir {}", parent.display()))?;
        }
        fs::write(out_path, bencode::encode(&Value::Dict(root)))
            .with_context(|| format!("failed to write artifact {}", out_path.display()))?;
        Ok(())
    }
}

/// All regular files under `root`, as paths relative to it, sorted.
fn collect_files(root: &Path) -> Result<Vec<PathBuf>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        let entries = fs::read_dir(dir)
            .with_context(|| format!("failed to read dir {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read dir {}", dir.display()))?;
            let path = entry.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .context("walked path escaped the staging root")?;
                out.push(rel.to_path_buf());
            }
        }
        Ok(())
    }

    if !root.is_dir() {
        bail!("staging path {} is not a directory", root.display());
    }
    let mut files = Vec::new();
    walk(root, root, &mut files)?;
    files.sort();
    Ok(files)
}

/// Hash the concatenated file contents in `piece_length` chunks. Pieces
/// span file boundaries; the final partial piece is hashed as-is.
fn hash_pieces(root: &Path, files: &[PathBuf], piece_length: usize) -> Result<(Vec<u8>, i64)> {
    let mut pieces = Vec::new();
    let mut buf = Vec::with_capacity(piece_length);
    let mut chunk = vec![0u8; 64 * 1024];
    let mut total: i64 = 0;

    for rel in files {
        let path = root.join(rel);
        let mut file = fs::File::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        loop {
            let n = file
                .read(&mut chunk)
                .with_context(|| format!("failed to read {}", path.display()))?;
            if n == 0 {
                break;
            }
            total += n as i64;
            let mut rest = &chunk[..n];
            while !rest.is_empty() {
                let take = (piece_length - buf.len()).min(rest.len());
                buf.extend_from_slice(&rest[..take]);
                rest = &rest[take..];
                if buf.len() == piece_length {
                    pieces.extend_from_slice(Sha256::digest(&buf).as_slice());
                    buf.clear();
                }
            }
        }
    }
    if !buf.is_empty() {
        pieces.extend_from_slice(Sha256::digest(&buf).as_slice());
    }
    Ok((pieces, total))
}
