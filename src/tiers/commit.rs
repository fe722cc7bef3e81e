//! Tier 1: per-commit classification.
//!
//! Candidate-trivial commits (conventional prefix or all-trivial paths)
//! bypass the LLM entirely with a synthesized analysis. Everything else
//! goes through the prompt fitter at FAST tier and is cached under
//! `H("T1" | template version | fingerprint)`; commit content is
//! immutable, so the key never needs the diff itself.

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::cache::{cache_key, ArtifactCache};
use crate::config::{Config, Tier};
use crate::decode::{FieldKind, Schema};
use crate::fitter::{stitch_structured, FitRecord, PromptFitter, TokenCounter, Variable};
use crate::gateway::LlmGateway;
use crate::lens::{conventional_type, hunk_start, split_hunks, TrivialFilter};
use crate::model::{Category, Change, Commit, CommitAnalysis, Impact};
use crate::prompts::TIER1_TEMPLATE;
use crate::tiers::{classify_cache_error, run_chunks, ChunksOutcome, TierError};

/// Raw change record as the model reports it.
#[derive(Debug, Clone, Deserialize)]
struct RawChange {
    description: String,
    category: Category,
    #[serde(default)]
    impact: Option<Impact>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: Option<u32>,
}

/// One chunk's decoded Tier-1 response.
#[derive(Debug, Deserialize)]
struct Tier1Payload {
    category: Category,
    #[serde(default)]
    changes: Vec<RawChange>,
}

/// Per-commit analyzer.
pub struct CommitAnalyzer {
    gateway: Arc<LlmGateway>,
    cache: Arc<ArtifactCache>,
    config: Arc<Config>,
    counter: Arc<dyn TokenCounter>,
    filter: Arc<TrivialFilter>,
}

impl CommitAnalyzer {
    /// Creates the analyzer over the shared pipeline components.
    #[must_use]
    pub fn new(
        gateway: Arc<LlmGateway>,
        cache: Arc<ArtifactCache>,
        config: Arc<Config>,
        counter: Arc<dyn TokenCounter>,
        filter: Arc<TrivialFilter>,
    ) -> Self {
        Self {
            gateway,
            cache,
            config,
            counter,
            filter,
        }
    }

    fn schema() -> Schema {
        Schema::object()
            .required("category", FieldKind::String)
            .optional("changes", FieldKind::Array)
    }

    /// Analyzes one commit, consulting the cache first.
    pub async fn analyze(&self, commit: &Commit) -> Result<CommitAnalysis, TierError> {
        if self.filter.is_candidate_trivial(commit) {
            debug!(fingerprint = %commit.fingerprint, "candidate-trivial; bypassing tier 1");
            return Ok(CommitAnalysis::synthesized_trivial(
                &commit.fingerprint,
                None,
            ));
        }

        let key = cache_key(
            "T1",
            &self.config.prompt_template_version,
            &[&commit.fingerprint],
        );
        let payload = self
            .cache
            .get_or_compute(&key, || async {
                let analysis = self.compute(commit).await.map_err(anyhow::Error::new)?;
                Ok(serde_json::to_string(&analysis)?)
            })
            .await;

        match payload {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| TierError::Permanent(format!("corrupt cached analysis: {e}"))),
            Err(err) => Err(classify_cache_error(&err)),
        }
    }

    async fn compute(&self, commit: &Commit) -> Result<CommitAnalysis, TierError> {
        let fitter = PromptFitter::new(
            self.counter.as_ref(),
            self.config.input_token_budget,
            self.config.chunk_overlap,
        );
        let variables = [
            Variable::text("commit_message", commit.message.clone()),
            Variable::records("diffs", diff_records(commit)),
        ];
        let plan = fitter
            .fit(TIER1_TEMPLATE, &variables)
            .map_err(TierError::from_fit)?;
        debug!(
            fingerprint = %commit.fingerprint,
            chunks = plan.chunk_count(),
            "tier 1 prompt fitted"
        );

        let outcome = run_chunks(&self.gateway, Tier::Fast, &plan, &Self::schema()).await?;
        let values = match outcome {
            ChunksOutcome::Decoded(values) => values,
            ChunksOutcome::DecodeFailed(err) => {
                debug!(
                    fingerprint = %commit.fingerprint,
                    error = %err,
                    "tier 1 decode failed; degrading to header analysis"
                );
                return header_analysis(commit);
            }
        };

        let mut payloads = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<Tier1Payload>(value) {
                Ok(payload) => payloads.push(payload),
                Err(err) => {
                    debug!(
                        fingerprint = %commit.fingerprint,
                        error = %err,
                        "tier 1 payload malformed; degrading to header analysis"
                    );
                    return header_analysis(commit);
                }
            }
        }

        // Ambiguity across chunks resolves by category precedence.
        let category = payloads
            .iter()
            .map(|p| p.category)
            .max_by_key(|c| c.precedence())
            .unwrap_or(Category::Other);

        let raw_changes = stitch_structured(
            payloads.into_iter().map(|p| p.changes).collect(),
            |change: &RawChange| match (&change.file, change.line) {
                (Some(file), line) => (file.clone(), line.unwrap_or(0), String::new()),
                (None, _) => (String::new(), 0, change.description.clone()),
            },
        );

        let changes: Vec<Change> = raw_changes
            .into_iter()
            .map(|raw| Change {
                description: raw.description,
                category: raw.category,
                impact: raw.impact,
            })
            .collect();

        let trivial = CommitAnalysis::compute_trivial(category, &changes);
        Ok(CommitAnalysis {
            fingerprint: commit.fingerprint.clone(),
            category,
            trivial,
            changes,
            note: None,
        })
    }
}

/// Per-hunk prompt records for a commit's diffs. Each record carries its
/// file header so a chunk is self-contained.
fn diff_records(commit: &Commit) -> Vec<FitRecord> {
    let mut records = Vec::new();
    for file in &commit.files {
        if file.is_binary {
            records.push(FitRecord {
                id: file.path.clone(),
                text: format!("Binary file {} changed.", file.path),
            });
            continue;
        }
        if file.unreadable {
            records.push(FitRecord {
                id: file.path.clone(),
                text: format!("(diff unavailable for {})", file.path),
            });
            continue;
        }
        if file.diff.is_empty() {
            continue;
        }
        let (header, hunks) = split_hunks(&file.diff);
        if hunks.is_empty() {
            records.push(FitRecord {
                id: file.path.clone(),
                text: file.diff.clone(),
            });
        } else {
            for hunk in hunks {
                records.push(FitRecord {
                    id: format!("{}:{}", file.path, hunk_start(&hunk).unwrap_or(0)),
                    text: format!("{header}{hunk}"),
                });
            }
        }
    }
    records
}

/// Fallback analysis built from the commit headline alone, used when the
/// model's output never decodes.
fn header_analysis(commit: &Commit) -> Result<CommitAnalysis, TierError> {
    let headline = commit.headline().trim();
    if headline.is_empty() {
        return Err(TierError::Permanent(
            "model output undecodable and the commit has no headline".to_string(),
        ));
    }

    let (category, description) = match conventional_type(headline) {
        Some(token) => {
            let category = Category::from_conventional(token);
            let after_colon = headline
                .split_once(':')
                .map_or(headline, |(_, rest)| rest.trim());
            let description = if after_colon.is_empty() {
                headline
            } else {
                after_colon
            };
            (category, description)
        }
        None => (Category::Other, headline),
    };

    let changes = vec![Change {
        description: description.to_string(),
        category,
        impact: None,
    }];
    let trivial = CommitAnalysis::compute_trivial(category, &changes);
    Ok(CommitAnalysis {
        fingerprint: commit.fingerprint.clone(),
        category,
        trivial,
        changes,
        note: Some("analysis degraded to commit headline after decode failures".to_string()),
    })
}
