//! The three analysis tiers.
//!
//! Tier 1 classifies commits, Tier 2 synthesizes days, Tier 3 narrates
//! weeks. All three share the same shape: fit the prompt, run each chunk
//! through the gateway, decode tolerantly, stitch the partial results,
//! and cache the final value under a content-derived key.

pub mod commit;
pub mod daily;
pub mod weekly;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::Tier;
use crate::decode::{decode, DecodeError, Schema};
use crate::error::ChronicleError;
use crate::fitter::FitPlan;
use crate::gateway::{GatewayError, LlmGateway};
use crate::prompts::STRICT_SUFFIX;

/// Failure classes a tier operation can produce. `Permanent` terminates
/// only the affected branch; the orchestrator renders a placeholder for
/// it. The others stop the run.
#[derive(Error, Debug, Clone)]
pub enum TierError {
    /// The run was canceled.
    #[error("tier call canceled")]
    Canceled,

    /// The LLM stayed unavailable through every retry.
    #[error("LLM unavailable after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts the gateway made.
        attempts: u32,
        /// Final failure description.
        last: String,
    },

    /// This branch cannot be analyzed; the run continues around it.
    #[error("analysis unavailable: {0}")]
    Permanent(String),

    /// A single atomic record exceeds the prompt budget.
    #[error("record '{record_id}' needs {tokens} tokens but the budget allows {budget}")]
    Oversized {
        /// Offending record id.
        record_id: String,
        /// Measured record size.
        tokens: usize,
        /// Available per-chunk budget.
        budget: usize,
    },

    /// Malformed input or configuration.
    #[error("invalid input: {0}")]
    Input(String),
}

impl TierError {
    pub(crate) fn from_fit(err: ChronicleError) -> Self {
        match err {
            ChronicleError::OversizedRecord {
                record_id,
                tokens,
                budget,
            } => Self::Oversized {
                record_id,
                tokens,
                budget,
            },
            other => Self::Input(other.to_string()),
        }
    }

    pub(crate) fn from_gateway(err: GatewayError) -> Self {
        match err {
            GatewayError::Canceled => Self::Canceled,
            GatewayError::Exhausted { attempts, last } => Self::Exhausted {
                attempts,
                last: last.to_string(),
            },
            GatewayError::Permanent(err) => Self::Permanent(err.to_string()),
        }
    }

    /// Converts run-stopping variants into the crate error; `None` for
    /// branch-level failures.
    #[must_use]
    pub fn as_run_error(&self) -> Option<ChronicleError> {
        match self {
            Self::Canceled => Some(ChronicleError::Canceled),
            Self::Exhausted { attempts, last } => Some(ChronicleError::LlmExhausted {
                attempts: *attempts,
                last_error: last.clone(),
            }),
            Self::Oversized {
                record_id,
                tokens,
                budget,
            } => Some(ChronicleError::OversizedRecord {
                record_id: record_id.clone(),
                tokens: *tokens,
                budget: *budget,
            }),
            Self::Input(message) => Some(ChronicleError::Input(message.clone())),
            Self::Permanent(_) => None,
        }
    }
}

/// Outcome of running a fit plan through the gateway.
pub(crate) enum ChunksOutcome {
    /// Every chunk decoded; values are in chunk order.
    Decoded(Vec<Value>),
    /// A chunk kept failing to decode even after the strict retry; the
    /// tier decides how to degrade.
    DecodeFailed(DecodeError),
}

/// Runs every chunk of `plan` at `tier`, decoding each response against
/// `schema`. A chunk of a multi-chunk plan that fails to decode is
/// retried once with a stricter prompt; single-chunk decode failures are
/// surfaced without another LLM call.
pub(crate) async fn run_chunks(
    gateway: &LlmGateway,
    tier: Tier,
    plan: &FitPlan,
    schema: &Schema,
) -> Result<ChunksOutcome, TierError> {
    let multi = plan.chunk_count() > 1;
    let mut values = Vec::with_capacity(plan.chunk_count());

    for chunk in &plan.chunks {
        let text = gateway
            .call(tier, &chunk.prompt)
            .await
            .map_err(TierError::from_gateway)?;

        let value = match decode(&text, schema) {
            Ok(value) => value,
            Err(first_err) if multi => {
                debug!(
                    chunk = chunk.index,
                    error = %first_err,
                    "chunk decode failed; retrying with strict prompt"
                );
                let strict = format!("{}{STRICT_SUFFIX}", chunk.prompt);
                let retry_text = gateway
                    .call(tier, &strict)
                    .await
                    .map_err(TierError::from_gateway)?;
                match decode(&retry_text, schema) {
                    Ok(value) => value,
                    Err(second_err) => return Ok(ChunksOutcome::DecodeFailed(second_err)),
                }
            }
            Err(err) => return Ok(ChunksOutcome::DecodeFailed(err)),
        };
        values.push(value);
    }

    Ok(ChunksOutcome::Decoded(values))
}

/// Classifies an error coming back out of the cache layer, recovering
/// the typed tier error the leading computation produced.
pub(crate) fn classify_cache_error(err: &anyhow::Error) -> TierError {
    if let Some(tier_err) = err.downcast_ref::<TierError>() {
        return tier_err.clone();
    }
    // A follower that observed the leader's failure only sees its
    // message; recover the variants that must not be mistaken for
    // branch-level failures.
    let message = err.to_string();
    if message.contains("canceled") {
        TierError::Canceled
    } else if message.contains("LLM unavailable") {
        TierError::Exhausted {
            attempts: 0,
            last: message,
        }
    } else {
        TierError::Permanent(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_mapping_covers_stopping_variants() {
        assert!(matches!(
            TierError::Canceled.as_run_error(),
            Some(ChronicleError::Canceled)
        ));
        assert!(matches!(
            TierError::Exhausted {
                attempts: 5,
                last: "503".to_string()
            }
            .as_run_error(),
            Some(ChronicleError::LlmExhausted { attempts: 5, .. })
        ));
        assert!(TierError::Permanent("nope".to_string())
            .as_run_error()
            .is_none());
    }

    #[test]
    fn cache_error_classification_recovers_typed_errors() {
        let err = anyhow::Error::new(TierError::Canceled);
        assert!(matches!(classify_cache_error(&err), TierError::Canceled));

        let stringly = anyhow::anyhow!("LLM unavailable after 5 attempts: 503");
        assert!(matches!(
            classify_cache_error(&stringly),
            TierError::Exhausted { .. }
        ));

        let other = anyhow::anyhow!("schema mismatch");
        assert!(matches!(
            classify_cache_error(&other),
            TierError::Permanent(_)
        ));
    }
}
