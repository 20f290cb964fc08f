//! Tracker API client.
//!
//! Implements the two registration collaborators the engine needs: the
//! idempotency probe (`has_fingerprint`) and the registration upload
//! (`register`). Failures are classified by status code so the persisted
//! failure record tells an operator whether retrying can help.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;

use crate::engine::TrackerOps;
use crate::types::{ReleaseMetadata, StageError, StageResult, Tracker};

#[derive(Debug, Clone)]
pub struct TrackerClient {
    tracker: Tracker,
    http: Client,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    title: &'a str,
    author: &'a str,
    /// Artifact bytes, base64-encoded.
    torrent: String,
}

impl TrackerClient {
    pub fn new(tracker: Tracker, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("slipway/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { tracker, http })
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    fn torrent_url(&self, fingerprint: &str) -> String {
        format!(
            "{}/api/v1/torrents/{}",
            self.tracker.api_base.trim_end_matches('/'),
            fingerprint
        )
    }

    fn upload_url(&self) -> String {
        format!("{}/api/v1/torrents", self.tracker.api_base.trim_end_matches('/'))
    }
}

impl TrackerOps for TrackerClient {
    fn has_fingerprint(&self, fingerprint: &str) -> StageResult<bool> {
        let resp = self
            .http
            .get(self.torrent_url(fingerprint))
            .send()
            .map_err(classify_send_error)?;
        match resp.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StageError::auth(format!(
                "tracker refused fingerprint lookup ({}); check credentials",
                resp.status()
            ))),
            status => Err(StageError::transient(format!(
                "unexpected status {status} while checking fingerprint"
            ))),
        }
    }

    fn register(&self, artifact: &Path, metadata: &ReleaseMetadata) -> StageResult<()> {
        let bytes = std::fs::read(artifact).map_err(|err| {
            StageError::permanent(format!(
                "failed to read artifact {}: {err}",
                artifact.display()
            ))
        })?;
        let body = RegisterRequest {
            title: &metadata.title,
            author: &metadata.author,
            torrent: BASE64.encode(&bytes),
        };

        let resp = self
            .http
            .post(self.upload_url())
            .json(&body)
            .send()
            .map_err(classify_send_error)?;
        match resp.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            // The tracker already has this artifact; registration is
            // satisfied, not failed.
            StatusCode::CONFLICT => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(StageError::auth(format!(
                "tracker refused registration ({}); check credentials",
                resp.status()
            ))),
            status => Err(StageError::transient(format!(
                "unexpected status {status} while registering artifact"
            ))),
        }
    }
}

fn classify_send_error(err: reqwest::Error) -> StageError {
    if err.is_timeout() {
        StageError::transient(format!("tracker request timed out: {err}"))
    } else {
        StageError::transient(format!("tracker request failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use tiny_http::{Response, Server};

    use super::*;
    use crate::types::ErrorClass;

    /// Serve `count` requests with the given status, returning the base URL
    /// and a handle that yields the request paths seen.
    fn serve(status: u16, count: usize) -> (String, thread::JoinHandle<Vec<String>>) {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let base_url = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            let mut paths = Vec::new();
            for _ in 0..count {
                let request = server.recv().expect("recv");
                paths.push(request.url().to_string());
                let _ = request.respond(Response::empty(status));
            }
            paths
        });
        (base_url, handle)
    }

    fn client_for(base_url: &str) -> TrackerClient {
        TrackerClient::new(
            Tracker { name: "test".to_string(), api_base: base_url.to_string() },
            Duration::from_secs(5),
        )
        .expect("client")
    }

    #[test]
    fn has_fingerprint_maps_ok_to_true() {
        let (base_url, handle) = serve(200, 1);
        let client = client_for(&base_url);
        assert!(client.has_fingerprint("abcd").expect("probe"));
        let paths = handle.join().expect("join");
        assert_eq!(paths, vec!["/api/v1/torrents/abcd".to_string()]);
    }

    #[test]
    fn has_fingerprint_maps_not_found_to_false() {
        let (base_url, handle) = serve(404, 1);
        let client = client_for(&base_url);
        assert!(!client.has_fingerprint("abcd").expect("probe"));
        handle.join().expect("join");
    }

    #[test]
    fn has_fingerprint_classifies_auth_failures() {
        let (base_url, handle) = serve(403, 1);
        let client = client_for(&base_url);
        let err = client.has_fingerprint("abcd").expect_err("must fail");
        assert_eq!(err.class, ErrorClass::Auth);
        handle.join().expect("join");
    }

    #[test]
    fn has_fingerprint_classifies_server_errors_as_transient() {
        let (base_url, handle) = serve(503, 1);
        let client = client_for(&base_url);
        let err = client.has_fingerprint("abcd").expect_err("must fail");
        assert_eq!(err.class, ErrorClass::Transient);
        handle.join().expect("join");
    }

    #[test]
    fn unreachable_tracker_is_transient() {
        // Nothing listens on this port (bound and immediately dropped).
        let base_url = {
            let server = Server::http("127.0.0.1:0").expect("bind");
            format!("http://{}", server.server_addr())
        };
        let client = client_for(&base_url);
        let err = client.has_fingerprint("abcd").expect_err("must fail");
        assert_eq!(err.class, ErrorClass::Transient);
    }

    #[test]
    fn register_posts_artifact_and_accepts_created() {
        let td = tempfile::tempdir().expect("tempdir");
        let artifact = td.path().join("demo.torrent");
        std::fs::write(&artifact, b"d4:infoi1ee").expect("write");

        let (base_url, handle) = serve(201, 1);
        let client = client_for(&base_url);
        let metadata = ReleaseMetadata {
            title: "Demo".to_string(),
            author: "A. Author".to_string(),
            extra: Default::default(),
        };
        client.register(&artifact, &metadata).expect("register");
        let paths = handle.join().expect("join");
        assert_eq!(paths, vec!["/api/v1/torrents".to_string()]);
    }

    #[test]
    fn register_treats_conflict_as_already_registered() {
        let td = tempfile::tempdir().expect("tempdir");
        let artifact = td.path().join("demo.torrent");
        std::fs::write(&artifact, b"d4:infoi1ee").expect("write");

        let (base_url, handle) = serve(409, 1);
        let client = client_for(&base_url);
        client
            .register(&artifact, &ReleaseMetadata::default())
            .expect("conflict is success");
        handle.join().expect("join");
    }

    #[test]
    fn register_with_missing_artifact_is_permanent() {
        let client = TrackerClient::new(
            Tracker {
                name: "test".to_string(),
                api_base: "http://127.0.0.1:9".to_string(),
            },
            Duration::from_secs(1),
        )
        .expect("client");
        let err = client
            .register(Path::new("/nonexistent/demo.torrent"), &ReleaseMetadata::default())
            .expect_err("must fail");
        assert_eq!(err.class, ErrorClass::Permanent);
    }
}
