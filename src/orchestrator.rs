//! End-to-end pipeline driver.
//!
//! Walks `INIT → EXTRACT → TIER1 → TIER2 → TIER3 → MERGE → DONE`, with
//! bounded fan-out at the three analysis stages: Tier 1 runs in parallel
//! over commits, Tier 2 over days (each day waits for its commits), and
//! Tier 3 walks weeks in order. Completion order never leaks into the
//! output: results are reassembled in chronological order before the
//! next stage consumes them. Branch-level failures degrade to
//! placeholders; structural failures stop the run and name the earliest
//! step that failed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::ArtifactCache;
use crate::cancel::CancelToken;
use crate::config::{Config, PerTier, Tier};
use crate::error::ChronicleError;
use crate::fitter::{HeuristicCounter, TokenCounter};
use crate::gateway::LlmGateway;
use crate::lens::{extract_commits, group_by_day, group_by_week, TrivialFilter};
use crate::llm::LlmClient;
use crate::merge::{
    apply_release, mark_release_in_narrative, merge_changelog, merge_daily, merge_narrative,
};
use crate::model::{
    short_id, Artifact, ArtifactKind, Category, Change, CommitAnalysis, DailySummary,
    WeeklyNarrative,
};
use crate::reader::RepositoryReader;
use crate::tiers::commit::CommitAnalyzer;
use crate::tiers::daily::DailySynthesizer;
use crate::tiers::weekly::WeeklyNarrator;
use crate::tiers::TierError;

/// Pipeline stage names, used in failure reports and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    /// Commit extraction and grouping.
    Extract,
    /// Per-commit analysis.
    Tier1,
    /// Per-day synthesis.
    Tier2,
    /// Per-week narration.
    Tier3,
    /// Artifact merging.
    Merge,
}

impl fmt::Display for RunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extract => f.write_str("EXTRACT"),
            Self::Tier1 => f.write_str("TIER1"),
            Self::Tier2 => f.write_str("TIER2"),
            Self::Tier3 => f.write_str("TIER3"),
            Self::Merge => f.write_str("MERGE"),
        }
    }
}

/// A run that stopped before producing artifacts, carrying the earliest
/// step that irrecoverably failed.
#[derive(Error, Debug)]
#[error("run failed during {step}: {source}")]
pub struct RunFailure {
    /// The stage that failed.
    pub step: RunStep,
    /// The underlying error.
    #[source]
    pub source: ChronicleError,
}

/// Pre-existing artifact contents the merge step folds new output into.
#[derive(Debug, Clone, Default)]
pub struct ExistingArtifacts {
    /// Current narrative file text.
    pub narrative: String,
    /// Current change log text.
    pub changelog: String,
    /// Current daily summaries text.
    pub daily: String,
}

/// Release request handled during the merge step.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    /// Version identifier (without the leading `v`).
    pub version: String,
    /// Release date.
    pub date: NaiveDate,
}

/// Options for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Window start (inclusive).
    pub start: DateTime<Utc>,
    /// Window end (exclusive).
    pub end: DateTime<Utc>,
    /// Existing artifact contents to merge into.
    pub existing: ExistingArtifacts,
    /// Optional pre-release flow.
    pub release: Option<ReleaseRequest>,
    /// Cancellation signal observed by every stage.
    pub cancel: CancelToken,
}

impl RunOptions {
    /// Options covering `[start, end)` with empty artifacts and no
    /// cancellation.
    #[must_use]
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            existing: ExistingArtifacts::default(),
            release: None,
            cancel: CancelToken::never(),
        }
    }
}

/// What a completed run produced.
#[derive(Debug)]
pub struct RunReport {
    /// Rendered artifacts, one per kind.
    pub artifacts: Vec<Artifact>,
    /// Commits inside the window.
    pub commits: usize,
    /// Days with at least one commit.
    pub days: usize,
    /// ISO weeks covered.
    pub weeks: usize,
    /// LLM requests that reached the client, per tier.
    pub llm_calls: PerTier<usize>,
    /// Lookups served from the cache.
    pub cache_hits: usize,
    /// Branches rendered as placeholders after permanent failures.
    pub placeholders: usize,
}

/// The assembled pipeline.
pub struct Pipeline {
    reader: Arc<dyn RepositoryReader>,
    client: Arc<dyn LlmClient>,
    config: Arc<Config>,
    cache: Arc<ArtifactCache>,
    counter: Arc<dyn TokenCounter>,
}

impl Pipeline {
    /// Builds a pipeline over the given collaborators.
    #[must_use]
    pub fn new(
        reader: Arc<dyn RepositoryReader>,
        client: Arc<dyn LlmClient>,
        config: Arc<Config>,
        cache: Arc<ArtifactCache>,
    ) -> Self {
        Self {
            reader,
            client,
            config,
            cache,
            counter: Arc::new(HeuristicCounter::default()),
        }
    }

    /// Replaces the token counter (the default is the character-ratio
    /// heuristic).
    #[must_use]
    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = counter;
        self
    }

    /// Runs the pipeline end to end.
    pub async fn run(&self, opts: RunOptions) -> Result<RunReport, RunFailure> {
        let cancel = opts.cancel.clone();
        let fail = |step: RunStep, source: ChronicleError| {
            warn!(%step, error = %source, "run failed");
            RunFailure { step, source }
        };
        let check_cancel = |step: RunStep| {
            if cancel.is_canceled() {
                Err(fail(step, ChronicleError::Canceled))
            } else {
                Ok(())
            }
        };

        // EXTRACT
        info!(start = %opts.start, end = %opts.end, "extracting commits");
        let extraction = extract_commits(self.reader.as_ref(), opts.start, opts.end)
            .map_err(|e| fail(RunStep::Extract, e))?;
        let filter = Arc::new(
            TrivialFilter::from_config(&self.config).map_err(|e| fail(RunStep::Extract, e))?,
        );
        let days = group_by_day(&extraction.commits, self.config.group_days_in_utc);
        let weeks = group_by_week(days);
        let day_count: usize = weeks.iter().map(|w| w.days.len()).sum();
        info!(
            commits = extraction.commits.len(),
            days = day_count,
            weeks = weeks.len(),
            "grouped history"
        );
        check_cancel(RunStep::Extract)?;

        let gateway = Arc::new(LlmGateway::new(
            self.client.clone(),
            self.config.clone(),
            cancel.clone(),
        ));
        let mut placeholders = 0_usize;

        // TIER1: parallel over commits, bounded.
        let analyzer = CommitAnalyzer::new(
            gateway.clone(),
            self.cache.clone(),
            self.config.clone(),
            self.counter.clone(),
            filter,
        );
        let tier1_results: Vec<(Arc<crate::model::Commit>, Result<CommitAnalysis, TierError>)> =
            stream::iter(extraction.commits.iter().cloned())
                .map(|commit| {
                    let analyzer = &analyzer;
                    let unanalyzable = extraction.unanalyzable.contains(&commit.fingerprint);
                    async move {
                        let result = if unanalyzable {
                            Ok(CommitAnalysis::synthesized_trivial(
                                &commit.fingerprint,
                                Some("commit diff unavailable".to_string()),
                            ))
                        } else {
                            analyzer.analyze(&commit).await
                        };
                        (commit, result)
                    }
                })
                .buffer_unordered(self.config.concurrency.t1)
                .collect()
                .await;

        let mut analyses: HashMap<String, CommitAnalysis> = HashMap::new();
        for (commit, result) in tier1_results {
            match result {
                Ok(analysis) => {
                    analyses.insert(commit.fingerprint.clone(), analysis);
                }
                Err(err) => {
                    if let Some(run_error) = err.as_run_error() {
                        return Err(fail(RunStep::Tier1, run_error));
                    }
                    debug!(fingerprint = %commit.fingerprint, error = %err, "tier 1 placeholder");
                    placeholders += 1;
                    analyses.insert(
                        commit.fingerprint.clone(),
                        placeholder_analysis(&commit.fingerprint, &err),
                    );
                }
            }
        }
        check_cancel(RunStep::Tier1)?;

        // TIER2: parallel over days, bounded; inputs in commit order.
        let synthesizer = DailySynthesizer::new(
            gateway.clone(),
            self.cache.clone(),
            self.config.clone(),
            self.counter.clone(),
        );
        let day_jobs: Vec<(&crate::model::DailyGroup, Vec<CommitAnalysis>)> = weeks
            .iter()
            .flat_map(|week| week.days.iter())
            .map(|day| {
                let ordered: Vec<CommitAnalysis> = day
                    .commits
                    .iter()
                    .filter_map(|c| analyses.get(&c.fingerprint).cloned())
                    .collect();
                (day, ordered)
            })
            .collect();

        async fn run_tier2_job(
            synthesizer: &DailySynthesizer,
            pair: &(&crate::model::DailyGroup, Vec<CommitAnalysis>),
        ) -> (NaiveDate, Result<DailySummary, TierError>) {
            let (day, ordered) = pair;
            let result = synthesizer.synthesize(day, ordered).await;
            (day.date, result)
        }

        let mut tier2_futures: Vec<
            std::pin::Pin<
                Box<
                    dyn std::future::Future<Output = (NaiveDate, Result<DailySummary, TierError>)>
                        + Send
                        + '_,
                >,
            >,
        > = Vec::with_capacity(day_jobs.len());
        for pair in &day_jobs {
            tier2_futures.push(Box::pin(run_tier2_job(&synthesizer, pair)));
        }
        let tier2_results: Vec<(NaiveDate, Result<DailySummary, TierError>)> =
            stream::iter(tier2_futures)
                .buffer_unordered(self.config.concurrency.t2)
                .collect()
                .await;

        let mut summaries: HashMap<NaiveDate, DailySummary> = HashMap::new();
        for (date, result) in tier2_results {
            match result {
                Ok(summary) => {
                    summaries.insert(date, summary);
                }
                Err(err) => {
                    if let Some(run_error) = err.as_run_error() {
                        return Err(fail(RunStep::Tier2, run_error));
                    }
                    debug!(%date, error = %err, "tier 2 placeholder");
                    placeholders += 1;
                    let ordered = day_jobs
                        .iter()
                        .find(|(d, _)| d.date == date)
                        .map_or(&[][..], |(_, o)| o.as_slice());
                    summaries.insert(date, placeholder_summary(date, ordered));
                }
            }
        }
        check_cancel(RunStep::Tier2)?;

        // TIER3: weeks in ascending order, serial by default.
        let narrator = WeeklyNarrator::new(
            gateway.clone(),
            self.cache.clone(),
            self.config.clone(),
            self.counter.clone(),
        );
        async fn run_tier3_job(
            narrator: &WeeklyNarrator,
            index: usize,
            week: &crate::model::WeekGroup,
            ordered: Vec<DailySummary>,
        ) -> (usize, Result<WeeklyNarrative, TierError>) {
            let result = narrator.narrate(week, &ordered).await;
            (index, result)
        }

        let mut tier3_futures: Vec<
            std::pin::Pin<
                Box<
                    dyn std::future::Future<Output = (usize, Result<WeeklyNarrative, TierError>)>
                        + Send
                        + '_,
                >,
            >,
        > = Vec::with_capacity(weeks.len());
        for (index, week) in weeks.iter().enumerate() {
            let ordered: Vec<DailySummary> = week
                .days
                .iter()
                .filter_map(|d| summaries.get(&d.date).cloned())
                .collect();
            tier3_futures.push(Box::pin(run_tier3_job(&narrator, index, week, ordered)));
        }
        let tier3_results: Vec<(usize, Result<WeeklyNarrative, TierError>)> =
            stream::iter(tier3_futures)
                .buffered(self.config.concurrency.t3)
                .collect()
                .await;

        let mut narratives: Vec<WeeklyNarrative> = Vec::with_capacity(weeks.len());
        for (index, result) in tier3_results {
            match result {
                Ok(narrative) => narratives.push(narrative),
                Err(err) => {
                    if let Some(run_error) = err.as_run_error() {
                        return Err(fail(RunStep::Tier3, run_error));
                    }
                    debug!(week = %weeks[index].id, error = %err, "tier 3 placeholder");
                    placeholders += 1;
                    narratives.push(placeholder_narrative(&weeks[index]));
                }
            }
        }
        check_cancel(RunStep::Tier3)?;

        // MERGE
        info!("merging artifacts");
        let ordered_summaries: Vec<DailySummary> = weeks
            .iter()
            .flat_map(|week| week.days.iter())
            .filter_map(|day| summaries.get(&day.date).cloned())
            .collect();
        let changes: Vec<Change> = weeks
            .iter()
            .flat_map(|week| week.days.iter())
            .flat_map(|day| day.commits.iter())
            .filter_map(|commit| analyses.get(&commit.fingerprint))
            .filter(|analysis| !analysis.trivial)
            .flat_map(|analysis| analysis.changes.iter().cloned())
            .collect();

        let mut narrative_text = merge_narrative(&opts.existing.narrative, &narratives);
        let mut changelog_text = merge_changelog(&opts.existing.changelog, &changes);
        let daily_text = merge_daily(&opts.existing.daily, &ordered_summaries);

        if let Some(release) = &opts.release {
            changelog_text = apply_release(&changelog_text, &release.version, release.date);
            narrative_text = mark_release_in_narrative(
                &narrative_text,
                &release.version,
                monday_of(release.date),
            );
        }

        if let Err(e) = self.cache.flush_manifest().await {
            warn!(error = %e, "failed to write cache manifest");
        }

        Ok(RunReport {
            artifacts: vec![
                Artifact {
                    kind: ArtifactKind::Narrative,
                    text: narrative_text,
                },
                Artifact {
                    kind: ArtifactKind::Changelog,
                    text: changelog_text,
                },
                Artifact {
                    kind: ArtifactKind::Daily,
                    text: daily_text,
                },
            ],
            commits: extraction.commits.len(),
            days: day_count,
            weeks: weeks.len(),
            llm_calls: PerTier {
                fast: gateway.calls_made(Tier::Fast),
                balanced: gateway.calls_made(Tier::Balanced),
                quality: gateway.calls_made(Tier::Quality),
            },
            cache_hits: self.cache.hits(),
            placeholders,
        })
    }
}

/// Monday of the ISO week containing `date`.
fn monday_of(date: NaiveDate) -> NaiveDate {
    let iso = date.iso_week();
    NaiveDate::from_isoywd_opt(iso.year(), iso.week(), Weekday::Mon).unwrap_or(date)
}

/// Analysis standing in for a commit whose branch failed permanently.
/// Non-trivial so the commit still appears in every artifact.
fn placeholder_analysis(fingerprint: &str, err: &TierError) -> CommitAnalysis {
    CommitAnalysis {
        fingerprint: fingerprint.to_string(),
        category: Category::Other,
        trivial: false,
        changes: vec![Change {
            description: format!("analysis unavailable for {}", short_id(fingerprint)),
            category: Category::Other,
            impact: None,
        }],
        note: Some(err.to_string()),
    }
}

/// Summary standing in for a day whose synthesis failed permanently.
/// Achievements still reference every non-trivial commit by short id.
fn placeholder_summary(date: NaiveDate, analyses: &[CommitAnalysis]) -> DailySummary {
    let achievements = analyses
        .iter()
        .filter(|a| !a.trivial)
        .map(|a| {
            let description = a
                .changes
                .first()
                .map_or("change landed", |c| c.description.as_str());
            format!("{}: {description}", short_id(&a.fingerprint))
        })
        .collect();
    DailySummary {
        date,
        summary: "Analysis unavailable for this day.".to_string(),
        achievements,
    }
}

/// Narrative standing in for a week whose narration failed permanently.
fn placeholder_narrative(week: &crate::model::WeekGroup) -> WeeklyNarrative {
    WeeklyNarrative {
        week: week.id,
        monday: week.monday,
        title: format!("Week {}", week.id),
        body: "Analysis unavailable for this week.".to_string(),
        notable: Vec::new(),
    }
}
