//! Tier 3: weekly narration.
//!
//! Input is the week's daily summaries in date order; output is a titled
//! narrative with a notable-changes list. Runs at QUALITY tier. The
//! cache key hashes the ordered Tier-2 outputs, so any upstream change
//! re-narrates the week.

use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::cache::{cache_key, ArtifactCache};
use crate::config::{Config, Tier};
use crate::decode::{FieldKind, Schema};
use crate::fitter::{
    stitch_prose, stitch_structured, FitRecord, PromptFitter, TokenCounter, Variable,
};
use crate::gateway::LlmGateway;
use crate::model::{DailySummary, WeekGroup, WeeklyNarrative};
use crate::prompts::TIER3_TEMPLATE;
use crate::tiers::{classify_cache_error, run_chunks, ChunksOutcome, TierError};

/// One chunk's decoded Tier-3 response.
#[derive(Debug, Deserialize)]
struct Tier3Payload {
    title: String,
    body: String,
    #[serde(default)]
    notable: Vec<String>,
}

/// Per-week narrator.
pub struct WeeklyNarrator {
    gateway: Arc<LlmGateway>,
    cache: Arc<ArtifactCache>,
    config: Arc<Config>,
    counter: Arc<dyn TokenCounter>,
}

impl WeeklyNarrator {
    /// Creates the narrator over the shared pipeline components.
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
            .required("title", FieldKind::String)
            .required("body", FieldKind::String)
            .optional("notable", FieldKind::Array)
    }

    /// Narrates one week from its ordered daily summaries.
    pub async fn narrate(
        &self,
        week: &WeekGroup,
        summaries: &[DailySummary],
    ) -> Result<WeeklyNarrative, TierError> {
        let parts: Vec<String> = summaries.iter().map(summary_digest).collect();
        let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let key = cache_key("T3", &self.config.prompt_template_version, &part_refs);

        let payload = self
            .cache
            .get_or_compute(&key, || async {
                let narrative = self
                    .compute(week, summaries)
                    .await
                    .map_err(anyhow::Error::new)?;
                Ok(serde_json::to_string(&narrative)?)
            })
            .await;

        match payload {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| TierError::Permanent(format!("corrupt cached narrative: {e}"))),
            Err(err) => Err(classify_cache_error(&err)),
        }
    }

    async fn compute(
        &self,
        week: &WeekGroup,
        summaries: &[DailySummary],
    ) -> Result<WeeklyNarrative, TierError> {
        let records: Vec<FitRecord> = summaries
            .iter()
            .map(|s| {
                let achievements = if s.achievements.is_empty() {
                    String::new()
                } else {
                    format!("\nAchievements:\n- {}", s.achievements.join("\n- "))
                };
                FitRecord {
                    id: s.date.to_string(),
                    text: format!("### {}\n{}{achievements}", s.date, s.summary),
                }
            })
            .collect();

        let fitter = PromptFitter::new(
            self.counter.as_ref(),
            self.config.input_token_budget,
            self.config.chunk_overlap,
        );
        let variables = [
            Variable::text(
                "week_range",
                format!("{} to {}", week.monday, week.sunday),
            ),
            Variable::records("daily_summaries", records),
        ];
        let plan = fitter
            .fit(TIER3_TEMPLATE, &variables)
            .map_err(TierError::from_fit)?;
        debug!(week = %week.id, chunks = plan.chunk_count(), "tier 3 prompt fitted");

        let outcome = run_chunks(&self.gateway, Tier::Quality, &plan, &Self::schema()).await?;
        let values = match outcome {
            ChunksOutcome::Decoded(values) => values,
            ChunksOutcome::DecodeFailed(err) => {
                return Err(TierError::Permanent(format!(
                    "weekly narration output undecodable: {err}"
                )))
            }
        };

        let mut payloads = Vec::with_capacity(values.len());
        for value in values {
            payloads.push(
                serde_json::from_value::<Tier3Payload>(value).map_err(|e| {
                    TierError::Permanent(format!("weekly narration payload malformed: {e}"))
                })?,
            );
        }

        let title = payloads
            .first()
            .map_or_else(String::new, |p| p.title.clone());
        let bodies: Vec<String> = payloads.iter().map(|p| p.body.clone()).collect();
        let body = stitch_prose(&bodies, self.counter.as_ref(), plan.overlap_tokens);
        let notable = stitch_structured(
            payloads.into_iter().map(|p| p.notable).collect(),
            Clone::clone,
        );

        Ok(WeeklyNarrative {
            week: week.id,
            monday: week.monday,
            title,
            body,
            notable,
        })
    }
}

/// Stable digest of one daily summary for key derivation.
fn summary_digest(summary: &DailySummary) -> String {
    let mut hasher = Sha256::new();
    hasher.update(summary.summary.as_bytes());
    for achievement in &summary.achievements {
        hasher.update([0x1f]);
        hasher.update(achievement.as_bytes());
    }
    format!("{}:{}", summary.date, hex::encode(hasher.finalize()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::NaiveDate;

    use super::*;
    use crate::cancel::CancelToken;
    use crate::fitter::HeuristicCounter;
    use crate::llm::LlmError;
    use crate::model::WeekId;
    use crate::test_utils::ScriptedLlm;

    fn week() -> WeekGroup {
        WeekGroup {
            id: WeekId { year: 2025, week: 4 },
            monday: NaiveDate::from_ymd_opt(2025, 1, 20).unwrap(),
            sunday: NaiveDate::from_ymd_opt(2025, 1, 26).unwrap(),
            days: Vec::new(),
        }
    }

    fn summary(date: (i32, u32, u32), text: &str) -> DailySummary {
        DailySummary {
            date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
            summary: text.to_string(),
            achievements: vec!["bbbbbbbb: shipped login".to_string()],
        }
    }

    fn narrator_with(
        responses: Vec<Result<String, LlmError>>,
    ) -> (WeeklyNarrator, std::sync::Arc<std::sync::atomic::AtomicUsize>) {
        let config = Arc::new(Config::default());
        let client = ScriptedLlm::new(responses);
        let calls = client.call_counter();
        let gateway = Arc::new(LlmGateway::new(
            Arc::new(client),
            config.clone(),
            CancelToken::never(),
        ));
        let cache = Arc::new(ArtifactCache::in_memory(&config.prompt_template_version, CancelToken::never()));
        let narrator = WeeklyNarrator::new(
            gateway,
            cache,
            config,
            Arc::new(HeuristicCounter::default()),
        );
        (narrator, calls)
    }

    const RESPONSE: &str = r#"{
        "title": "Login week",
        "body": "The week centered on authentication. The login flow landed early and stabilized by Friday.",
        "notable": ["New login flow", "Crash fix in login"]
    }"#;

    #[tokio::test]
    async fn narrates_week_from_summaries() {
        let (narrator, calls) = narrator_with(vec![Ok(RESPONSE.to_string())]);
        let summaries = vec![
            summary((2025, 1, 20), "Login flow landed."),
            summary((2025, 1, 21), "Crash fixes."),
        ];

        let narrative = narrator.narrate(&week(), &summaries).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(narrative.week, WeekId { year: 2025, week: 4 });
        assert_eq!(narrative.title, "Login week");
        assert_eq!(narrative.notable.len(), 2);
        assert!(narrative.body.contains("authentication"));
    }

    #[tokio::test]
    async fn identical_inputs_hit_the_cache() {
        let (narrator, calls) = narrator_with(vec![Ok(RESPONSE.to_string())]);
        let summaries = vec![summary((2025, 1, 20), "Login flow landed.")];

        let first = narrator.narrate(&week(), &summaries).await.unwrap();
        let second = narrator.narrate(&week(), &summaries).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn changed_daily_summary_re_narrates() {
        let (narrator, calls) = narrator_with(vec![
            Ok(RESPONSE.to_string()),
            Ok(RESPONSE.replace("Login week", "Revised week")),
        ]);

        let original = vec![summary((2025, 1, 20), "Login flow landed.")];
        let revised = vec![summary((2025, 1, 20), "Login flow landed, then reverted.")];

        narrator.narrate(&week(), &original).await.unwrap();
        let second = narrator.narrate(&week(), &revised).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(second.title, "Revised week");
    }

    #[test]
    fn summary_digest_is_sensitive_to_content_and_date() {
        let base = summary((2025, 1, 20), "work");
        let other_text = summary((2025, 1, 20), "different work");
        let other_date = summary((2025, 1, 21), "work");
        assert_ne!(summary_digest(&base), summary_digest(&other_text));
        assert_ne!(summary_digest(&base), summary_digest(&other_date));
        assert_eq!(summary_digest(&base), summary_digest(&summary((2025, 1, 20), "work")));
    }
}
