//! Prompt templates for the three analysis tiers.
//!
//! Placeholders in `{braces}` are substituted by the prompt fitter, which
//! also owns chunking when the rendered prompt exceeds the token budget.
//! Literal JSON braces in the examples below are left alone because the
//! fitter only replaces known placeholder names.

/// Tier-1 template: per-commit classification.
pub const TIER1_TEMPLATE: &str = r#"You are analyzing a single git commit.

Commit message:
{commit_message}

File diffs:
{diffs}

Classify the commit and list every discrete change you find in the diffs.
Categories: NEW_FEATURE, BUG_FIX, REFACTOR, PERFORMANCE, SECURITY,
DOCUMENTATION, TESTS, STYLING, BUILD, CHORE, OTHER.
Impact levels: low, medium, high, critical.

Respond with a JSON object:
{"category": "...", "changes": [{"description": "...", "category": "...", "impact": "...", "file": "...", "line": 0}]}

Each change's "file" is the path it touches and "line" is the first
affected line in the new file. Keep descriptions under 20 words."#;

/// Tier-2 template: per-day synthesis.
pub const TIER2_TEMPLATE: &str = r#"You are summarizing one day of development work, {date}.

Commit analyses, in chronological order:
{analyses}

Combined diff of the day (context only):
{union_diff}

Write a JSON object:
{"summary": "...", "achievements": ["..."]}

"summary" is one prose paragraph covering the day's commits in the order
given. "achievements" is a bullet list; reference each commit by the short
id given in its analysis."#;

/// Tier-3 template: weekly narrative.
pub const TIER3_TEMPLATE: &str = r#"You are narrating one week of development, {week_range}.

Daily summaries, in date order:
{daily_summaries}

Write a JSON object:
{"title": "...", "body": "...", "notable": ["..."]}

"title" is a short headline for the week. "body" is a narrative of 300 to
700 words in plain prose. "notable" lists the changes worth calling out;
omit days that were only minor maintenance."#;

/// Appended to a prompt when the first decode attempt failed; asks for
/// machine-readable output only.
pub const STRICT_SUFFIX: &str = "\n\nYour previous reply could not be parsed. \
Respond with the JSON object only: no prose, no code fences, double-quoted \
keys, no trailing commas.";

/// Renders one Tier-2 analysis line the model can reference by short id.
#[must_use]
pub fn analysis_line(short_id: &str, category: &str, trivial: bool, descriptions: &[String]) -> String {
    let marker = if trivial { " (trivial)" } else { "" };
    if descriptions.is_empty() {
        format!("- {short_id} [{category}]{marker}")
    } else {
        format!("- {short_id} [{category}]{marker}: {}", descriptions.join("; "))
    }
}
