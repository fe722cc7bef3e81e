//! Gateway between the pipeline tiers and the raw LLM client.
//!
//! Adds, in order: tier-to-model resolution, a per-tier token bucket,
//! a per-call deadline, and exponential backoff with jitter for the
//! retryable failure classes. Cancellation is observed inside both the
//! bucket wait and the in-flight call, so waiters wake within the
//! 100 ms window the orchestrator promises.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::{Config, PerTier, Tier};
use crate::llm::{LlmClient, LlmError, LlmRequest};

/// Outcome classes a gateway call can fail with.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Every attempt failed with a retryable error.
    #[error("LLM call failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made, including the first.
        attempts: u32,
        /// The final retryable failure.
        last: LlmError,
    },

    /// A non-retryable failure; surfaced immediately.
    #[error("permanent LLM failure: {0}")]
    Permanent(LlmError),

    /// The run was canceled while this call was queued or in flight.
    #[error("LLM call canceled")]
    Canceled,
}

/// Token bucket guarding one tier's call rate.
///
/// The mutex only covers the debit arithmetic; waits happen outside it.
struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate_per_min: u32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            rate_per_sec: f64::from(rate_per_min) / 60.0,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Debits one token, returning how long to wait first when the bucket
    /// is empty.
    fn try_debit(&self) -> Result<(), Duration> {
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate_per_sec))
        }
    }

    /// Blocks cooperatively until a token is available or the run is
    /// canceled.
    async fn acquire(&self, cancel: &CancelToken) -> Result<(), GatewayError> {
        loop {
            match self.try_debit() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    tokio::select! {
                        () = cancel.canceled() => return Err(GatewayError::Canceled),
                        () = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

/// Rate-limited, retrying front door to the LLM service.
pub struct LlmGateway {
    client: Arc<dyn LlmClient>,
    config: Arc<Config>,
    buckets: PerTier<TokenBucket>,
    calls: PerTier<AtomicUsize>,
    cancel: CancelToken,
}

impl LlmGateway {
    /// Creates a gateway over `client` with the run's configuration.
    #[must_use]
    pub fn new(client: Arc<dyn LlmClient>, config: Arc<Config>, cancel: CancelToken) -> Self {
        let buckets = PerTier {
            fast: TokenBucket::new(config.rate_per_min.fast, config.burst.fast),
            balanced: TokenBucket::new(config.rate_per_min.balanced, config.burst.balanced),
            quality: TokenBucket::new(config.rate_per_min.quality, config.burst.quality),
        };
        Self {
            client,
            config,
            buckets,
            calls: PerTier {
                fast: AtomicUsize::new(0),
                balanced: AtomicUsize::new(0),
                quality: AtomicUsize::new(0),
            },
            cancel,
        }
    }

    /// Number of requests that actually reached the client for `tier`.
    #[must_use]
    pub fn calls_made(&self, tier: Tier) -> usize {
        self.calls.get(tier).load(Ordering::SeqCst)
    }

    /// Sends `prompt` at `tier`, retrying transient failures with
    /// exponential backoff and ±25% jitter.
    pub async fn call(&self, tier: Tier, prompt: &str) -> Result<String, GatewayError> {
        let model = self.config.tier_models.get(tier);
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let max_attempts = self.config.retries.max.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.buckets.get(tier).acquire(&self.cancel).await?;
            if self.cancel.is_canceled() {
                return Err(GatewayError::Canceled);
            }

            self.calls.get(tier).fetch_add(1, Ordering::SeqCst);
            let request = LlmRequest {
                model,
                prompt,
                max_output_tokens: *self.config.max_tokens.get(tier),
                temperature: self.config.temperature,
                timeout,
            };

            let outcome = tokio::select! {
                () = self.cancel.canceled() => Err(LlmError::Canceled),
                result = tokio::time::timeout(timeout, self.client.generate(request)) => {
                    result.unwrap_or(Err(LlmError::Timeout))
                }
            };

            match outcome {
                Ok(text) => return Ok(text),
                Err(LlmError::Canceled) => return Err(GatewayError::Canceled),
                Err(err) if err.is_retryable() => {
                    if attempt >= max_attempts {
                        warn!(tier = ?tier, attempts = attempt, error = %err, "retries exhausted");
                        return Err(GatewayError::Exhausted {
                            attempts: attempt,
                            last: err,
                        });
                    }
                    let delay = self.backoff_delay(attempt, &err);
                    debug!(
                        tier = ?tier,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying LLM call"
                    );
                    tokio::select! {
                        () = self.cancel.canceled() => return Err(GatewayError::Canceled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(GatewayError::Permanent(err)),
            }
        }
    }

    /// Delay before retry number `attempt + 1`: `base * 2^(attempt-1)`
    /// with ±25% jitter, clamped to `max_ms`, and never shorter than a
    /// server-provided `retry_after`.
    fn backoff_delay(&self, attempt: u32, err: &LlmError) -> Duration {
        let base = self.config.retries.base_ms as f64;
        let exp = base * 2_f64.powi(attempt.saturating_sub(1) as i32);
        let jittered = exp * jitter_factor();
        let capped = jittered.min(self.config.retries.max_ms as f64);
        let mut delay = Duration::from_millis(capped as u64);

        if let LlmError::RateLimited {
            retry_after: Some(server_wait),
        } = err
        {
            delay = delay.max(*server_wait);
        }
        delay
    }
}

/// Multiplier in [0.75, 1.25] derived from the wall clock's subsecond
/// nanos. Deterministic inputs are not required here, only spread.
fn jitter_factor() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos());
    0.75 + 0.5 * (f64::from(nanos) / f64::from(u32::MAX))
}
