//! Tier 2: per-day synthesis.
//!
//! Input is the day's Tier-1 analyses in commit order plus the day's
//! union diff for context. A day whose commits are all trivial gets a
//! fixed maintenance summary without consulting the LLM. The cache key
//! covers the ordered `(fingerprint, trivial)` pairs only; the union
//! diff is a deterministic function of the fingerprints and would add
//! nothing.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::cache::{cache_key, ArtifactCache};
use crate::config::{Config, Tier};
use crate::decode::{FieldKind, Schema};
use crate::fitter::{
    stitch_prose, stitch_structured, FitRecord, PromptFitter, TokenCounter, Variable,
};
use crate::gateway::LlmGateway;
use crate::lens::{hunk_start, split_files, split_hunks};
use crate::model::{short_id, CommitAnalysis, DailyGroup, DailySummary};
use crate::prompts::{analysis_line, TIER2_TEMPLATE};
use crate::tiers::{classify_cache_error, run_chunks, ChunksOutcome, TierError};

/// Summary used for days with nothing but trivial commits.
const MAINTENANCE_SUMMARY: &str =
    "A quiet day of minor maintenance; no notable changes landed.";

/// One chunk's decoded Tier-2 response.
#[derive(Debug, Deserialize)]
struct Tier2Payload {
    summary: String,
    #[serde(default)]
    achievements: Vec<String>,
}

/// Per-day synthesizer.
pub struct DailySynthesizer {
    gateway: Arc<LlmGateway>,
    cache: Arc<ArtifactCache>,
    config: Arc<Config>,
    counter: Arc<dyn TokenCounter>,
}

impl DailySynthesizer {
    /// Creates the synthesizer over the shared pipeline components.
    #[must_use]
    pub fn new(
        gateway: Arc<LlmGateway>,
        cache: Arc<ArtifactCache>,
        config: Arc<Config>,
        counter: Arc<dyn TokenCounter>,
    ) -> Self {
        Self {
            gateway,
            cache,
            config,
            counter,
        }
    }

    fn schema() -> Schema {
        Schema::object()
            .required("summary", FieldKind::String)
            .optional("achievements", FieldKind::Array)
    }

    /// Synthesizes one day from its ordered Tier-1 analyses.
    pub async fn synthesize(
        &self,
        day: &DailyGroup,
        analyses: &[CommitAnalysis],
    ) -> Result<DailySummary, TierError> {
        if analyses.iter().all(|a| a.trivial) {
            debug!(date = %day.date, "all commits trivial; skipping the LLM");
            return Ok(DailySummary {
                date: day.date,
                summary: MAINTENANCE_SUMMARY.to_string(),
                achievements: Vec::new(),
            });
        }

        let parts: Vec<String> = analyses
            .iter()
            .map(|a| format!("{}:{}", a.fingerprint, a.trivial))
            .collect();
        let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let key = cache_key("T2", &self.config.prompt_template_version, &part_refs);

        let payload = self
            .cache
            .get_or_compute(&key, || async {
                let summary = self
                    .compute(day, analyses)
                    .await
                    .map_err(anyhow::Error::new)?;
                Ok(serde_json::to_string(&summary)?)
            })
            .await;

        match payload {
            Ok(json) => {
                let mut summary: DailySummary = serde_json::from_str(&json)
                    .map_err(|e| TierError::Permanent(format!("corrupt cached summary: {e}")))?;
                // The cache key ignores the date on purpose; restore it.
                summary.date = day.date;
                Ok(summary)
            }
            Err(err) => Err(classify_cache_error(&err)),
        }
    }

    async fn compute(
        &self,
        day: &DailyGroup,
        analyses: &[CommitAnalysis],
    ) -> Result<DailySummary, TierError> {
        let analysis_records: Vec<FitRecord> = analyses
            .iter()
            .map(|a| FitRecord {
                id: a.fingerprint.clone(),
                text: analysis_line(
                    short_id(&a.fingerprint),
                    &a.category.to_string(),
                    a.trivial,
                    &a.changes
                        .iter()
                        .map(|c| c.description.clone())
                        .collect::<Vec<_>>(),
                ),
            })
            .collect();

        let fitter = PromptFitter::new(
            self.counter.as_ref(),
            self.config.input_token_budget,
            self.config.chunk_overlap,
        );
        let variables = [
            Variable::text("date", day.date.to_string()),
            Variable::records("analyses", analysis_records),
            Variable::records("union_diff", union_diff_records(&day.union_diff)),
        ];
        let plan = fitter
            .fit(TIER2_TEMPLATE, &variables)
            .map_err(TierError::from_fit)?;
        debug!(date = %day.date, chunks = plan.chunk_count(), "tier 2 prompt fitted");

        let outcome = run_chunks(&self.gateway, Tier::Balanced, &plan, &Self::schema()).await?;
        let values = match outcome {
            ChunksOutcome::Decoded(values) => values,
            ChunksOutcome::DecodeFailed(err) => {
                return Err(TierError::Permanent(format!(
                    "daily synthesis output undecodable: {err}"
                )))
            }
        };

        let mut payloads = Vec::with_capacity(values.len());
        for value in values {
            payloads.push(
                serde_json::from_value::<Tier2Payload>(value).map_err(|e| {
                    TierError::Permanent(format!("daily synthesis payload malformed: {e}"))
                })?,
            );
        }

        let summaries: Vec<String> = payloads.iter().map(|p| p.summary.clone()).collect();
        let summary = stitch_prose(&summaries, self.counter.as_ref(), plan.overlap_tokens);
        let mut achievements = stitch_structured(
            payloads.into_iter().map(|p| p.achievements).collect(),
            Clone::clone,
        );

        // Property: every non-trivial commit is referenced by short id.
        for analysis in analyses.iter().filter(|a| !a.trivial) {
            let sid = short_id(&analysis.fingerprint);
            if !achievements.iter().any(|a| a.contains(sid)) {
                let description = analysis
                    .changes
                    .first()
                    .map_or_else(|| "change landed".to_string(), |c| c.description.clone());
                achievements.push(format!("{sid}: {description}"));
            }
        }

        Ok(DailySummary {
            date: day.date,
            summary,
            achievements,
        })
    }
}

/// Per-hunk records over a day's union diff, for chunking context.
fn union_diff_records(union_diff: &str) -> Vec<FitRecord> {
    let mut records = Vec::new();
    for (path, section) in split_files(union_diff) {
        let (header, hunks) = split_hunks(&section);
        if hunks.is_empty() {
            records.push(FitRecord {
                id: path,
                text: section,
            });
        } else {
            for hunk in hunks {
                records.push(FitRecord {
                    id: format!("{path}:{}", hunk_start(&hunk).unwrap_or(0)),
                    text: format!("{header}{hunk}"),
                });
            }
        }
    }
    records
}
