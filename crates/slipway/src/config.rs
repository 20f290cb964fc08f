//! Configuration file support (`.slipway.toml`).
//!
//! Values resolve CLI-over-file-over-default: the file only supplies what
//! the operator wrote down, and the CLI layer overrides individual fields
//! on top of the merged result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::types::Tracker;

pub const CONFIG_FILE: &str = ".slipway.toml";

const DEFAULT_STATE_DIR: &str = ".slipway";
const DEFAULT_SOURCE_ROOT: &str = "releases";
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFileDoc {
    #[serde(default)]
    tracker: TrackerSection,
    #[serde(default)]
    paths: PathsSection,
    #[serde(default)]
    http: HttpSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrackerSection {
    name: Option<String>,
    api_base: Option<String>,
    announce: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsSection {
    state_dir: Option<PathBuf>,
    source_root: Option<PathBuf>,
    staging_root: Option<PathBuf>,
    output_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpSection {
    /// Humantime duration string, e.g. `30s` or `2m`.
    timeout: Option<String>,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct SlipwayConfig {
    pub tracker: Tracker,
    /// Announce URL embedded in built artifacts. Defaults to
    /// `<api_base>/announce`.
    pub announce: String,
    pub state_dir: PathBuf,
    pub source_root: PathBuf,
    pub staging_root: PathBuf,
    pub output_root: PathBuf,
    pub http_timeout: Duration,
}

impl Default for SlipwayConfig {
    fn default() -> Self {
        let state_dir = PathBuf::from(DEFAULT_STATE_DIR);
        Self {
            tracker: Tracker {
                name: "local".to_string(),
                api_base: "http://127.0.0.1:8080".to_string(),
            },
            announce: "http://127.0.0.1:8080/announce".to_string(),
            source_root: PathBuf::from(DEFAULT_SOURCE_ROOT),
            staging_root: state_dir.join("staging"),
            output_root: state_dir.join("torrents"),
            state_dir,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

impl SlipwayConfig {
    /// Load configuration from `path`, or from `./.slipway.toml` when no
    /// path is given and the file exists; defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                if !path.exists() {
                    bail!("config file {} does not exist", path.display());
                }
                Self::from_file(path)
            }
            None => {
                let default_path = Path::new(CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let doc: ConfigFileDoc = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Self::from_doc(doc)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    fn from_doc(doc: ConfigFileDoc) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = doc.tracker.name {
            config.tracker.name = name;
        }
        if let Some(api_base) = doc.tracker.api_base {
            config.announce = format!("{}/announce", api_base.trim_end_matches('/'));
            config.tracker.api_base = api_base;
        }
        if let Some(announce) = doc.tracker.announce {
            config.announce = announce;
        }
        if let Some(state_dir) = doc.paths.state_dir {
            config.staging_root = state_dir.join("staging");
            config.output_root = state_dir.join("torrents");
            config.state_dir = state_dir;
        }
        if let Some(source_root) = doc.paths.source_root {
            config.source_root = source_root;
        }
        if let Some(staging_root) = doc.paths.staging_root {
            config.staging_root = staging_root;
        }
        if let Some(output_root) = doc.paths.output_root {
            config.output_root = output_root;
        }
        if let Some(timeout) = doc.http.timeout {
            config.http_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("invalid http.timeout value {timeout:?}"))?;
        }
        Ok(config)
    }
}
