//! Pipeline error taxonomy.
//!
//! Per-item failures (one file's diff, one LLM call) are contained where
//! they occur; the variants here are the structural errors that bubble up
//! to the driver, which maps them to process exit codes.

use thiserror::Error;

/// Structural errors surfaced by the pipeline.
#[derive(Error, Debug)]
pub enum ChronicleError {
    /// Malformed configuration, invalid date range, or unreadable
    /// repository path.
    #[error("invalid input: {0}")]
    Input(String),

    /// Failure reading version-control data that cannot be contained to a
    /// single commit or file.
    #[error("repository read failed: {0}")]
    Reader(String),

    /// The LLM service stayed unavailable after exhausting retries.
    #[error("LLM unavailable after {attempts} attempts: {last_error}")]
    LlmExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Description of the final failure.
        last_error: String,
    },

    /// A single atomic record exceeded the prompt token budget and cannot
    /// be chunked further.
    #[error("record '{record_id}' needs {tokens} tokens but the budget allows {budget}")]
    OversizedRecord {
        /// Identifier of the offending record.
        record_id: String,
        /// Measured size of the record.
        tokens: usize,
        /// Per-chunk capacity it had to fit in.
        budget: usize,
    },

    /// The run was canceled by an external signal.
    #[error("run canceled")]
    Canceled,
}

impl ChronicleError {
    /// Process exit status for this error: 2 invalid input, 3 LLM
    /// unavailable, 4 canceled.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Input(_) | Self::Reader(_) | Self::OversizedRecord { .. } => 2,
            Self::LlmExhausted { .. } => 3,
            Self::Canceled => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_driver_contract() {
        assert_eq!(ChronicleError::Input("bad range".to_string()).exit_code(), 2);
        assert_eq!(
            ChronicleError::LlmExhausted {
                attempts: 5,
                last_error: "503".to_string()
            }
            .exit_code(),
            3
        );
        assert_eq!(ChronicleError::Canceled.exit_code(), 4);
    }

    #[test]
    fn oversized_record_names_the_record() {
        let err = ChronicleError::OversizedRecord {
            record_id: "src/huge.rs".to_string(),
            tokens: 120_000,
            budget: 90_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("src/huge.rs"));
        assert!(msg.contains("120000"));
    }
}
