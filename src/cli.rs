//! Command-line driver.
//!
//! Wires the git reader, HTTP LLM client, and on-disk cache into the
//! pipeline, runs it over the requested window, and writes the merged
//! artifacts back to their files. Exit codes follow the pipeline
//! contract: 0 success, 2 invalid input, 3 LLM unavailable, 4 canceled.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::Parser;
use tracing::info;

use crate::cache::ArtifactCache;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::llm::HttpLlmClient;
use crate::orchestrator::{ExistingArtifacts, Pipeline, ReleaseRequest, RunOptions};
use crate::reader::GitReader;

/// A driver failure paired with its process exit code.
#[derive(Debug)]
pub struct CliFailure {
    /// Process exit status.
    pub code: i32,
    /// Underlying error.
    pub error: anyhow::Error,
}

impl CliFailure {
    fn input(error: anyhow::Error) -> Self {
        Self { code: 2, error }
    }

    fn io(error: anyhow::Error) -> Self {
        Self { code: 1, error }
    }
}

/// Turns git history into narrative, change log, and daily artifacts.
#[derive(Debug, Parser)]
#[command(name = "git-chronicle", version, about)]
pub struct Cli {
    /// Repository to analyze.
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,

    /// Window start: YYYY-MM-DD or RFC 3339.
    #[arg(long)]
    pub since: String,

    /// Window end (exclusive): YYYY-MM-DD or RFC 3339. Defaults to now.
    #[arg(long)]
    pub until: Option<String>,

    /// JSON settings file; defaults apply for unnamed keys.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the cache directory.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Cut a release: move [Unreleased] into this version and mark the
    /// week's narrative.
    #[arg(long)]
    pub release: Option<String>,

    /// Narrative output file.
    #[arg(long, default_value = "NARRATIVE.md")]
    pub narrative: PathBuf,

    /// Change log output file.
    #[arg(long, default_value = "CHANGELOG.md")]
    pub changelog: PathBuf,

    /// Daily summaries output file.
    #[arg(long, default_value = "DAILY_UPDATES.md")]
    pub daily: PathBuf,
}

/// Parses a window boundary as RFC 3339 or a plain date at UTC midnight.
fn parse_instant(text: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    let date: NaiveDate = text
        .parse()
        .with_context(|| format!("'{text}' is neither RFC 3339 nor YYYY-MM-DD"))?;
    let midnight = date.and_hms_opt(0, 0, 0).context("invalid midnight")?;
    Ok(Utc.from_utc_datetime(&midnight))
}

/// Reads an artifact file, treating a missing file as empty.
fn read_existing(path: &Path) -> anyhow::Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
    }
}

impl Cli {
    /// Runs the pipeline per the parsed arguments.
    pub async fn execute(self) -> Result<(), CliFailure> {
        let mut config = match &self.config {
            Some(path) => Config::load(path).map_err(CliFailure::input)?,
            None => Config::default(),
        };
        if let Some(dir) = &self.cache_dir {
            config.cache_dir.clone_from(dir);
        }
        config.validate().map_err(|e| CliFailure::input(e.into()))?;

        let start = parse_instant(&self.since).map_err(CliFailure::input)?;
        let end = match &self.until {
            Some(text) => parse_instant(text).map_err(CliFailure::input)?,
            None => Utc::now(),
        };

        let (handle, cancel) = CancelToken::new();
        let run_timeout = config.run_timeout_ms;
        tokio::spawn(async move {
            if let Some(ms) = run_timeout {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    () = tokio::time::sleep(std::time::Duration::from_millis(ms)) => {}
                }
            } else if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            handle.cancel();
        });

        let reader =
            GitReader::open(&self.repo).map_err(|e| CliFailure::input(anyhow::Error::new(e)))?;
        let client =
            HttpLlmClient::from_env().map_err(|e| CliFailure::input(anyhow::Error::new(e)))?;
        let cache = ArtifactCache::open(
            &config.cache_dir,
            &config.prompt_template_version,
            cancel.clone(),
        )
        .map_err(CliFailure::input)?;

        let existing = ExistingArtifacts {
            narrative: read_existing(&self.narrative).map_err(CliFailure::io)?,
            changelog: read_existing(&self.changelog).map_err(CliFailure::io)?,
            daily: read_existing(&self.daily).map_err(CliFailure::io)?,
        };

        let release = self.release.as_ref().map(|version| ReleaseRequest {
            version: version.trim_start_matches('v').to_string(),
            date: Utc::now().date_naive(),
        });

        let pipeline = Pipeline::new(
            Arc::new(reader),
            Arc::new(client),
            Arc::new(config),
            Arc::new(cache),
        );
        let report = pipeline
            .run(RunOptions {
                start,
                end,
                existing,
                release,
                cancel,
            })
            .await
            .map_err(|failure| CliFailure {
                code: failure.source.exit_code(),
                error: anyhow::Error::new(failure),
            })?;

        for artifact in &report.artifacts {
            let path = match artifact.kind {
                crate::model::ArtifactKind::Narrative => &self.narrative,
                crate::model::ArtifactKind::Changelog => &self.changelog,
                crate::model::ArtifactKind::Daily => &self.daily,
            };
            std::fs::write(path, &artifact.text)
                .with_context(|| format!("failed to write {}", path.display()))
                .map_err(CliFailure::io)?;
        }

        info!(
            commits = report.commits,
            days = report.days,
            weeks = report.weeks,
            fast_calls = report.llm_calls.fast,
            balanced_calls = report.llm_calls.balanced,
            quality_calls = report.llm_calls.quality,
            cache_hits = report.cache_hits,
            placeholders = report.placeholders,
            "run complete"
        );
        Ok(())
    }
}
