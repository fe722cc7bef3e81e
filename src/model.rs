//! Core data model for the analysis pipeline.
//!
//! Commits and their diffs are immutable once extracted and are shared by
//! reference (`Arc<Commit>`) between the grouping, analysis, and merge
//! stages. Everything the LLM produces is represented as a typed value
//! with serde support so it can round-trip through the artifact cache.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

/// Length of the fingerprint-derived short id used in rendered artifacts.
const SHORT_ID_LEN: usize = 8;

/// A single commit extracted from the repository.
#[derive(Debug, Clone)]
pub struct Commit {
    /// Stable content hash identifying the commit.
    pub fingerprint: String,
    /// Author timestamp, preserving the author's UTC offset.
    pub author_ts: DateTime<FixedOffset>,
    /// Full commit message.
    pub message: String,
    /// Per-file changes in the order the repository reported them.
    pub files: Vec<FileChange>,
    /// Net inserted lines across all files.
    pub insertions: usize,
    /// Net deleted lines across all files.
    pub deletions: usize,
}

impl Commit {
    /// Returns the first line of the commit message.
    #[must_use]
    pub fn headline(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    /// Returns the fingerprint-derived short id used in rendered output.
    #[must_use]
    pub fn short_id(&self) -> &str {
        short_id(&self.fingerprint)
    }
}

/// Returns the leading eight characters of a fingerprint.
#[must_use]
pub fn short_id(fingerprint: &str) -> &str {
    let end = fingerprint
        .char_indices()
        .nth(SHORT_ID_LEN)
        .map_or(fingerprint.len(), |(i, _)| i);
    &fingerprint[..end]
}

/// How a file changed within a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// File did not exist before this commit.
    Added,
    /// File content changed.
    Modified,
    /// File was removed.
    Deleted,
    /// File moved to a new path.
    Renamed,
}

/// A per-file slice of a commit's diff.
#[derive(Debug, Clone)]
pub struct FileChange {
    /// Repository-relative path (the post-change path for renames).
    pub path: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Unified diff body for this file. Empty for binary files.
    pub diff: String,
    /// Whether the file is binary (no textual diff available).
    pub is_binary: bool,
    /// Set when diff computation failed for this file; the body is empty.
    pub unreadable: bool,
}

/// Fixed category set assigned to commits and change records.
///
/// Ordering of the variants is not meaningful; ambiguity between
/// categories is resolved by [`Category::precedence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// New user-facing functionality.
    NewFeature,
    /// Corrects defective behavior.
    BugFix,
    /// Behavior-preserving restructuring.
    Refactor,
    /// Performance improvement.
    Performance,
    /// Security-relevant change.
    Security,
    /// Documentation only.
    Documentation,
    /// Test-only change.
    Tests,
    /// Formatting or stylistic change.
    Styling,
    /// Build system or dependency change.
    Build,
    /// Routine maintenance.
    Chore,
    /// Anything that fits no other category.
    Other,
}

impl Category {
    /// Tie-break precedence; higher wins when a commit's records disagree.
    #[must_use]
    pub fn precedence(self) -> u8 {
        match self {
            Self::Security => 10,
            Self::BugFix => 9,
            Self::NewFeature => 8,
            Self::Performance => 7,
            Self::Refactor => 6,
            Self::Build => 5,
            Self::Tests => 4,
            Self::Documentation => 3,
            Self::Styling => 2,
            Self::Chore => 1,
            Self::Other => 0,
        }
    }

    /// Categories that keep a commit eligible for the trivial flag.
    #[must_use]
    pub fn is_low_risk(self) -> bool {
        matches!(
            self,
            Self::Documentation | Self::Tests | Self::Styling | Self::Chore
        )
    }

    /// Maps a conventional-commit type token (`feat`, `fix`, ...) to a
    /// category. Unknown tokens map to [`Category::Other`].
    #[must_use]
    pub fn from_conventional(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "feat" | "feature" => Self::NewFeature,
            "fix" | "bugfix" | "hotfix" => Self::BugFix,
            "refactor" => Self::Refactor,
            "perf" => Self::Performance,
            "security" => Self::Security,
            "docs" | "doc" => Self::Documentation,
            "test" | "tests" => Self::Tests,
            "style" => Self::Styling,
            "build" | "ci" => Self::Build,
            "chore" | "deps" => Self::Chore,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NewFeature => "NEW_FEATURE",
            Self::BugFix => "BUG_FIX",
            Self::Refactor => "REFACTOR",
            Self::Performance => "PERFORMANCE",
            Self::Security => "SECURITY",
            Self::Documentation => "DOCUMENTATION",
            Self::Tests => "TESTS",
            Self::Styling => "STYLING",
            Self::Build => "BUILD",
            Self::Chore => "CHORE",
            Self::Other => "OTHER",
        };
        f.write_str(name)
    }
}

/// Impact level an individual change record may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    /// Routine change.
    Low,
    /// Noticeable but contained change.
    Medium,
    /// Change with broad effect.
    High,
    /// Change that must not be buried (data loss, security, ...).
    Critical,
}

impl Impact {
    /// High and critical impacts elevate a commit above trivial.
    #[must_use]
    pub fn elevates(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

/// One discrete change described by the Tier-1 analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Short human-readable description.
    pub description: String,
    /// Category of this individual change.
    pub category: Category,
    /// Optional impact level.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<Impact>,
}

/// Tier-1 output for one commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitAnalysis {
    /// Fingerprint of the analyzed commit.
    pub fingerprint: String,
    /// Overall category, tie-broken by [`Category::precedence`].
    pub category: Category,
    /// Whether the commit is excluded from narrative-level output.
    pub trivial: bool,
    /// Discrete changes found in the commit, in diff order.
    pub changes: Vec<Change>,
    /// Diagnostic note for synthesized or degraded analyses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl CommitAnalysis {
    /// Builds the synthesized analysis used for candidate-trivial and
    /// unanalyzable commits.
    #[must_use]
    pub fn synthesized_trivial(fingerprint: &str, note: Option<String>) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
            category: Category::Chore,
            trivial: true,
            changes: Vec::new(),
            note,
        }
    }

    /// Applies the authoritative triviality rule: low-risk category and no
    /// change record carrying an elevating impact. An empty change list is
    /// always trivial.
    #[must_use]
    pub fn compute_trivial(category: Category, changes: &[Change]) -> bool {
        if changes.is_empty() {
            return true;
        }
        category.is_low_risk()
            && !changes
                .iter()
                .any(|c| c.impact.is_some_and(Impact::elevates))
    }
}

/// Commits that share a calendar date, with the day's union diff.
#[derive(Debug, Clone)]
pub struct DailyGroup {
    /// Calendar date in the grouping timezone.
    pub date: NaiveDate,
    /// Commits in ascending author-time order.
    pub commits: Vec<Arc<Commit>>,
    /// Concatenated per-file diffs with duplicate hunks removed.
    pub union_diff: String,
}

/// Tier-2 output for one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailySummary {
    /// Date the summary covers.
    pub date: NaiveDate,
    /// Prose paragraph describing the day.
    pub summary: String,
    /// Bullet list of achievements; each non-trivial commit is referenced
    /// by its short id.
    pub achievements: Vec<String>,
}

/// ISO week identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WeekId {
    /// ISO week-based year.
    pub year: i32,
    /// ISO week number (1-53).
    pub week: u32,
}

impl fmt::Display for WeekId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

/// Days grouped into one ISO week.
#[derive(Debug, Clone)]
pub struct WeekGroup {
    /// ISO week identifier.
    pub id: WeekId,
    /// Monday of the week.
    pub monday: NaiveDate,
    /// Sunday of the week.
    pub sunday: NaiveDate,
    /// Days in chronological order; between one and seven entries.
    pub days: Vec<DailyGroup>,
}

/// Tier-3 output for one week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyNarrative {
    /// Week the narrative covers.
    pub week: WeekId,
    /// Monday of the week (section anchor in the narrative file).
    pub monday: NaiveDate,
    /// Narrative title.
    pub title: String,
    /// Prose body, targeted at 300-700 words.
    pub body: String,
    /// Notable-changes bullet list.
    pub notable: Vec<String>,
}

/// Kind of rendered artifact a run emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Weekly narrative file.
    Narrative,
    /// Keep-a-Changelog change log file.
    Changelog,
    /// Per-day development summaries.
    Daily,
}

/// A rendered artifact ready for the writer collaborator.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Which file this text belongs to.
    pub kind: ArtifactKind,
    /// Full rendered text.
    pub text: String,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn short_id_truncates_to_eight() {
        assert_eq!(short_id("abcdef0123456789"), "abcdef01");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn category_precedence_orders_security_first() {
        assert!(Category::Security.precedence() > Category::BugFix.precedence());
        assert!(Category::BugFix.precedence() > Category::NewFeature.precedence());
        assert!(Category::Chore.precedence() > Category::Other.precedence());
    }

    #[test]
    fn category_serializes_screaming_snake() {
        let json = serde_json::to_string(&Category::NewFeature).unwrap();
        assert_eq!(json, "\"NEW_FEATURE\"");
        let back: Category = serde_json::from_str("\"BUG_FIX\"").unwrap();
        assert_eq!(back, Category::BugFix);
    }

    #[test]
    fn conventional_token_mapping() {
        assert_eq!(Category::from_conventional("feat"), Category::NewFeature);
        assert_eq!(Category::from_conventional("FIX"), Category::BugFix);
        assert_eq!(Category::from_conventional("mystery"), Category::Other);
    }

    #[test]
    fn trivial_rule_requires_low_risk_category() {
        let changes = vec![Change {
            description: "tidy docs".to_string(),
            category: Category::Documentation,
            impact: Some(Impact::Low),
        }];
        assert!(CommitAnalysis::compute_trivial(
            Category::Documentation,
            &changes
        ));
        assert!(!CommitAnalysis::compute_trivial(
            Category::BugFix,
            &changes
        ));
    }

    #[test]
    fn trivial_rule_elevated_by_high_impact_record() {
        let changes = vec![Change {
            description: "rewrote the test harness".to_string(),
            category: Category::Tests,
            impact: Some(Impact::High),
        }];
        assert!(!CommitAnalysis::compute_trivial(Category::Tests, &changes));
    }

    #[test]
    fn empty_change_list_is_trivial() {
        assert!(CommitAnalysis::compute_trivial(Category::BugFix, &[]));
    }

    #[test]
    fn week_id_display() {
        let id = WeekId { year: 2025, week: 4 };
        assert_eq!(id.to_string(), "2025-W04");
    }
}
