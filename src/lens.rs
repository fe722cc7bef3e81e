//! Views over the commit stream: extraction, day and week grouping,
//! union diffs, and the candidate-trivial pre-filter.
//!
//! Days are keyed by the commit author's local date by default (UTC when
//! configured), weeks by ISO week. The union diff of a day concatenates
//! per-file diffs of the day's commits with duplicate hunks removed,
//! keeping the earliest occurrence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use regex::Regex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ChronicleError;
use crate::model::{Commit, DailyGroup, WeekGroup, WeekId};
use crate::reader::RepositoryReader;

/// Marker that begins a hunk within a file diff.
const HUNK_MARKER: &str = "@@ ";

/// Extraction result: the commit stream plus the commits whose diffs
/// could not be computed at all.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Commits in ascending author-time order, diffs attached.
    pub commits: Vec<Arc<Commit>>,
    /// Fingerprints whose diff computation failed; these are treated as
    /// unanalyzable and synthesized as trivial downstream.
    pub unanalyzable: HashSet<String>,
}

/// Pulls the commit stream for `[start, end)` and attaches per-commit
/// diffs. A per-commit diff failure marks the commit unanalyzable but
/// never fails the run.
pub fn extract_commits(
    reader: &dyn RepositoryReader,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Extraction, ChronicleError> {
    if start >= end {
        return Err(ChronicleError::Input(format!(
            "empty date range: {start} >= {end}"
        )));
    }

    let mut commits = reader
        .list_commits(start, end)
        .map_err(|e| ChronicleError::Reader(e.to_string()))?;

    // Defensive re-sort; the ordering contract is cheap to enforce here.
    commits.sort_by(|a, b| {
        a.author_ts
            .with_timezone(&Utc)
            .cmp(&b.author_ts.with_timezone(&Utc))
            .then_with(|| a.fingerprint.cmp(&b.fingerprint))
    });

    let mut extraction = Extraction::default();
    for mut commit in commits {
        match reader.diff_of(&commit.fingerprint) {
            Ok(diff) => {
                commit.files = diff.files;
                commit.insertions = diff.insertions;
                commit.deletions = diff.deletions;
            }
            Err(e) => {
                warn!(
                    fingerprint = %commit.fingerprint,
                    error = %e,
                    "commit diff unavailable; marking unanalyzable"
                );
                extraction.unanalyzable.insert(commit.fingerprint.clone());
            }
        }
        extraction.commits.push(Arc::new(commit));
    }
    debug!(
        commits = extraction.commits.len(),
        unanalyzable = extraction.unanalyzable.len(),
        "extraction complete"
    );
    Ok(extraction)
}

/// Groups commits into days. The date is the author-local calendar date
/// unless `in_utc` is set.
#[must_use]
pub fn group_by_day(commits: &[Arc<Commit>], in_utc: bool) -> Vec<DailyGroup> {
    let mut by_date: HashMap<NaiveDate, Vec<Arc<Commit>>> = HashMap::new();
    for commit in commits {
        let date = if in_utc {
            commit.author_ts.with_timezone(&Utc).date_naive()
        } else {
            commit.author_ts.date_naive()
        };
        by_date.entry(date).or_default().push(commit.clone());
    }

    let mut days: Vec<DailyGroup> = by_date
        .into_iter()
        .map(|(date, commits)| {
            let union_diff = union_diff(&commits);
            DailyGroup {
                date,
                commits,
                union_diff,
            }
        })
        .collect();
    days.sort_by_key(|d| d.date);
    days
}

/// Groups days into ISO weeks, ascending.
#[must_use]
pub fn group_by_week(days: Vec<DailyGroup>) -> Vec<WeekGroup> {
    let mut weeks: Vec<WeekGroup> = Vec::new();
    for day in days {
        let iso = day.date.iso_week();
        let id = WeekId {
            year: iso.year(),
            week: iso.week(),
        };
        match weeks.last_mut() {
            Some(week) if week.id == id => week.days.push(day),
            _ => {
                let monday = NaiveDate::from_isoywd_opt(iso.year(), iso.week(), Weekday::Mon)
                    .unwrap_or(day.date);
                weeks.push(WeekGroup {
                    id,
                    monday,
                    sunday: monday + chrono::Days::new(6),
                    days: vec![day],
                });
            }
        }
    }
    weeks
}

/// Concatenates the per-file diffs of `commits`, de-duplicating identical
/// hunks within the same file (earliest occurrence wins). Files appear in
/// first-touched order; binary and unreadable files are skipped.
#[must_use]
pub fn union_diff(commits: &[Arc<Commit>]) -> String {
    let mut file_order: Vec<String> = Vec::new();
    let mut headers: HashMap<String, String> = HashMap::new();
    let mut hunks: HashMap<String, Vec<String>> = HashMap::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for commit in commits {
        for file in &commit.files {
            if file.is_binary || file.unreadable || file.diff.is_empty() {
                continue;
            }
            let (header, file_hunks) = split_hunks(&file.diff);
            if !headers.contains_key(&file.path) {
                file_order.push(file.path.clone());
                headers.insert(file.path.clone(), header);
            }
            for hunk in file_hunks {
                let key = (file.path.clone(), hunk.clone());
                if seen.insert(key) {
                    hunks.entry(file.path.clone()).or_default().push(hunk);
                }
            }
        }
    }

    let mut out = String::new();
    for path in file_order {
        if let Some(header) = headers.get(&path) {
            out.push_str(header);
        }
        if let Some(file_hunks) = hunks.get(&path) {
            for hunk in file_hunks {
                out.push_str(hunk);
            }
        }
    }
    out
}

/// Marker that begins a per-file section in unified diff output.
const FILE_DIFF_MARKER: &str = "diff --git a/";

/// Splits a combined unified diff at `diff --git a/` boundaries,
/// returning `(path, section)` pairs. The path comes from the `b/` side
/// of the header.
#[must_use]
pub fn split_files(diff: &str) -> Vec<(String, String)> {
    let mut positions = Vec::new();
    if diff.starts_with(FILE_DIFF_MARKER) {
        positions.push(0);
    }
    let search = format!("\n{FILE_DIFF_MARKER}");
    let mut start = 0;
    while let Some(pos) = diff[start..].find(&search) {
        positions.push(start + pos + 1);
        start = start + pos + 1;
    }

    positions
        .iter()
        .enumerate()
        .map(|(i, &pos)| {
            let end = positions.get(i + 1).copied().unwrap_or(diff.len());
            let content = &diff[pos..end];
            let first_line = content.lines().next().unwrap_or("");
            let path = first_line
                .rfind(" b/")
                .map_or_else(String::new, |b| first_line[b + 3..].to_string());
            (path, content.to_string())
        })
        .collect()
}

/// Splits one file's unified diff into its header and per-hunk segments.
/// A file with no hunks (mode-only changes) yields an empty hunk list.
#[must_use]
pub fn split_hunks(file_diff: &str) -> (String, Vec<String>) {
    let mut positions = Vec::new();
    if file_diff.starts_with(HUNK_MARKER) {
        positions.push(0);
    }
    let search = format!("\n{HUNK_MARKER}");
    let mut start = 0;
    while let Some(pos) = file_diff[start..].find(&search) {
        positions.push(start + pos + 1);
        start = start + pos + 1;
    }

    if positions.is_empty() {
        return (file_diff.to_string(), Vec::new());
    }

    let header = file_diff[..positions[0]].to_string();
    let hunks = positions
        .iter()
        .enumerate()
        .map(|(i, &pos)| {
            let end = positions.get(i + 1).copied().unwrap_or(file_diff.len());
            file_diff[pos..end].to_string()
        })
        .collect();
    (header, hunks)
}

/// Extracts the new-file start line from a hunk's `@@ -a,b +c,d @@` line.
#[must_use]
pub fn hunk_start(hunk: &str) -> Option<u32> {
    let line = hunk.lines().next()?;
    let plus = line.find('+')?;
    let rest = &line[plus + 1..];
    let end = rest.find([',', ' '])?;
    rest[..end].parse().ok()
}

/// Extracts the conventional-commit type token from a message headline
/// (`feat(scope)!: ...` yields `feat`). `None` when the headline is not
/// in conventional form.
#[must_use]
pub fn conventional_type(headline: &str) -> Option<&str> {
    let head = headline.trim_start();
    let colon = head.find(':')?;
    let mut token = &head[..colon];
    if let Some(paren) = token.find('(') {
        token = &token[..paren];
    }
    let token = token.trim_end_matches('!').trim();
    if token.is_empty() || !token.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(token)
}

/// Pre-filter deciding which commits bypass Tier 1 entirely.
pub struct TrivialFilter {
    prefixes: Vec<String>,
    patterns: Vec<Regex>,
}

impl TrivialFilter {
    /// Builds the filter from configuration. Patterns were validated by
    /// [`Config::validate`], but compilation errors are still surfaced.
    pub fn from_config(config: &Config) -> Result<Self, ChronicleError> {
        let patterns = config
            .trivial_path_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    ChronicleError::Input(format!("invalid trivial_path_pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            prefixes: config
                .trivial_prefixes
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            patterns,
        })
    }

    /// A commit is candidate-trivial when its message carries a configured
    /// conventional prefix, or every file it touches matches a trivial
    /// path pattern. Commits with no file changes (merges) are always
    /// candidate-trivial.
    #[must_use]
    pub fn is_candidate_trivial(&self, commit: &Commit) -> bool {
        if let Some(token) = conventional_type(commit.headline()) {
            if self.prefixes.iter().any(|p| p == &token.to_ascii_lowercase()) {
                return true;
            }
        }

        if commit.files.is_empty() {
            return true;
        }

        !self.patterns.is_empty()
            && commit.files.iter().all(|file| {
                self.patterns.iter().any(|pattern| pattern.is_match(&file.path))
            })
    }
}
