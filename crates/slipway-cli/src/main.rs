use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use slipway::config::SlipwayConfig;
use slipway::engine::{self, Reporter};
use slipway::fingerprint;
use slipway::lock::RunLock;
use slipway::state::StateStore;
use slipway::tracker::TrackerClient;
use slipway::types::{ReleaseOutcome, ReleaseStatus};
use slipway::workshop::FsWorkshop;

#[derive(Parser, Debug)]
#[command(name = "slipway", version)]
#[command(about = "Crash-safe, resumable release publishing for torrent trackers")]
struct Cli {
    /// Path to a .slipway.toml config file (default: ./.slipway.toml if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for slipway state, events, and receipts
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Tracker API base URL
    #[arg(long)]
    api_base: Option<String>,

    /// HTTP timeout for tracker calls (e.g. 30s, 2m)
    #[arg(long)]
    http_timeout: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline for the given release ids, resuming from checkpoints.
    Run {
        /// Release ids to process, in order.
        #[arg(required = true)]
        releases: Vec<String>,

        /// Bypass the run lock. Unsafe: only for recovering a wedged environment.
        #[arg(long)]
        force: bool,
    },
    /// Show every release in the store with its status and progress.
    Status,
    /// Reset a failed release to pending, keeping its checkpoints.
    ClearFailure { release: String },
    /// Print the content fingerprint of an artifact file.
    Fingerprint { artifact: PathBuf },
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SlipwayConfig::load(cli.config.as_deref())?;
    if let Some(state_dir) = cli.state_dir {
        config.staging_root = state_dir.join("staging");
        config.output_root = state_dir.join("torrents");
        config.state_dir = state_dir;
    }
    if let Some(api_base) = cli.api_base {
        config.announce = format!("{}/announce", api_base.trim_end_matches('/'));
        config.tracker.api_base = api_base;
    }
    if let Some(timeout) = &cli.http_timeout {
        config.http_timeout = humantime::parse_duration(timeout)
            .with_context(|| format!("invalid --http-timeout value {timeout:?}"))?;
    }

    match cli.cmd {
        Commands::Run { releases, force } => run(&config, &releases, force),
        Commands::Status => status(&config),
        Commands::ClearFailure { release } => clear_failure(&config, &release),
        Commands::Fingerprint { artifact } => {
            println!("{}", fingerprint::fingerprint_file(&artifact)?);
            Ok(())
        }
    }
}

fn run(config: &SlipwayConfig, releases: &[String], force: bool) -> Result<()> {
    // Fail fast on a concurrent run before any state work begins.
    let _lock = RunLock::acquire(&config.state_dir, force)?;

    let store = StateStore::open(&config.state_dir)?;
    let mut workshop = FsWorkshop::new(
        config.source_root.clone(),
        config.staging_root.clone(),
        config.output_root.clone(),
        config.announce.clone(),
    );
    let tracker = TrackerClient::new(config.tracker.clone(), config.http_timeout)?;

    let mut reporter = CliReporter;
    let receipt = engine::run_pipeline(
        &store,
        &config.tracker,
        &mut workshop,
        &tracker,
        &mut reporter,
        releases,
    )?;

    println!(
        "{} release(s) processed: {} complete, {} not complete",
        receipt.releases.len(),
        receipt.completed(),
        receipt.failed(),
    );
    for release in &receipt.releases {
        match release.outcome {
            ReleaseOutcome::Completed => {
                println!(
                    "  {}: complete ({} stage(s) run, {} skipped)",
                    release.id,
                    release.stages_run.len(),
                    release.stages_skipped.len()
                );
            }
            ReleaseOutcome::Failed => {
                println!("  {}: failed; see `slipway status`", release.id);
            }
            ReleaseOutcome::SkippedFailed => {
                println!(
                    "  {}: untouched (failed earlier; run `slipway clear-failure {}` to retry)",
                    release.id, release.id
                );
            }
        }
    }

    if receipt.failed() > 0 {
        bail!("{} release(s) did not complete", receipt.failed());
    }
    Ok(())
}

fn status(config: &SlipwayConfig) -> Result<()> {
    let store = StateStore::open(&config.state_dir)?;
    let doc = store.snapshot()?;
    if doc.entries.is_empty() {
        println!("no releases in {}", store.state_path().display());
        return Ok(());
    }

    for (id, release) in &doc.entries {
        let progress = release
            .last_completed_stage()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string());
        let fingerprint = release
            .fingerprint
            .as_deref()
            .map(short_fingerprint)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{id}: {} (through {progress}, fingerprint {fingerprint})",
            status_label(release.status)
        );
        if let Some(failure) = &release.failure {
            println!(
                "    failed at {}: [{}] {} (attempt {})",
                failure.stage, failure.class, failure.message, failure.retry_count
            );
        }
    }
    Ok(())
}

fn clear_failure(config: &SlipwayConfig, release: &str) -> Result<()> {
    let store = StateStore::open(&config.state_dir)?;
    engine::clear_failure(&store, release)?;
    println!("{release}: failure cleared; next run resumes from its last checkpoint");
    Ok(())
}

fn status_label(status: ReleaseStatus) -> &'static str {
    match status {
        ReleaseStatus::Pending => "pending",
        ReleaseStatus::InProgress => "in progress",
        ReleaseStatus::Complete => "complete",
        ReleaseStatus::Failed => "FAILED",
    }
}

fn short_fingerprint(fingerprint: &str) -> String {
    fingerprint.chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_requires_at_least_one_release() {
        assert!(Cli::try_parse_from(["slipway", "run"]).is_err());
        let cli = Cli::try_parse_from(["slipway", "run", "r1", "r2", "--force"])
            .expect("parse");
        match cli.cmd {
            Commands::Run { releases, force } => {
                assert_eq!(releases, vec!["r1".to_string(), "r2".to_string()]);
                assert!(force);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn global_flags_parse() {
        let cli = Cli::try_parse_from([
            "slipway",
            "--state-dir",
            "/tmp/s",
            "--api-base",
            "https://t.example.net",
            "--http-timeout",
            "45s",
            "status",
        ])
        .expect("parse");
        assert_eq!(cli.state_dir, Some(PathBuf::from("/tmp/s")));
        assert_eq!(cli.api_base.as_deref(), Some("https://t.example.net"));
        assert_eq!(cli.http_timeout.as_deref(), Some("45s"));
    }

    #[test]
    fn short_fingerprint_truncates() {
        assert_eq!(short_fingerprint("abcdef0123456789"), "abcdef012345");
        assert_eq!(short_fingerprint("ab"), "ab");
    }
}
