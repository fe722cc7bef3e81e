//! Idempotent merging of pipeline output into existing artifacts.
//!
//! All three merges are pure text transformations: narrative week
//! sections are replaced or inserted in reverse-chronological order,
//! change log entries land under their category heading in the
//! `[Unreleased]` section with `(category, description)` dedup, and
//! daily sections are upserted by date. Running any merge twice over its
//! own output yields the same bytes.

use chrono::NaiveDate;

use crate::model::{Category, Change, DailySummary, WeeklyNarrative};

/// Week-section header prefix in the narrative file.
const WEEK_HEADER: &str = "## Week of ";

/// Unreleased-section header in the change log.
const UNRELEASED_HEADER: &str = "## [Unreleased]";

/// Scaffold for a change log created from scratch.
const CHANGELOG_PREAMBLE: &str =
    "# Changelog\n\nAll notable changes to this project will be documented in this file.\n";

/// Change log subsections in render order, with their bullet emoji.
const SUBSECTIONS: [(&str, &str); 6] = [
    ("Added", "\u{2728}"),        // ✨
    ("Changed", "\u{267b}\u{fe0f}"), // ♻️
    ("Fixed", "\u{1f41b}"),       // 🐛
    ("Removed", "\u{1f5d1}\u{fe0f}"), // 🗑️
    ("Security", "\u{1f512}"),    // 🔒
    ("Performance", "\u{26a1}"),  // ⚡
];

/// Maps a change category to its change log subsection.
fn subsection_for(category: Category) -> &'static str {
    match category {
        Category::NewFeature => "Added",
        Category::BugFix => "Fixed",
        Category::Security => "Security",
        Category::Performance => "Performance",
        _ => "Changed",
    }
}

fn emoji_for(subsection: &str) -> &'static str {
    SUBSECTIONS
        .iter()
        .find(|(name, _)| *name == subsection)
        .map_or("\u{2728}", |(_, emoji)| emoji)
}

/// Strips the bullet prefix and any leading emoji from a change log
/// bullet, leaving the bare description for dedup comparison.
fn bullet_description(line: &str) -> String {
    let text = line.trim_start().trim_start_matches('-').trim_start();
    let stripped = SUBSECTIONS
        .iter()
        .find_map(|(_, emoji)| text.strip_prefix(emoji))
        .unwrap_or(text);
    stripped.trim().to_string()
}

// ── narrative ───────────────────────────────────────────────────────

#[derive(Debug)]
struct WeekSection {
    monday: Option<NaiveDate>,
    header: String,
    body: String,
}

/// Splits narrative text into its preamble and week sections. A section
/// runs from its `## Week of` line to the next one or end of input.
fn split_week_sections(text: &str) -> (String, Vec<WeekSection>) {
    let mut preamble = String::new();
    let mut sections: Vec<WeekSection> = Vec::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix(WEEK_HEADER) {
            let date_part = rest.split_whitespace().next().unwrap_or("");
            sections.push(WeekSection {
                monday: date_part.parse().ok(),
                header: line.to_string(),
                body: String::new(),
            });
        } else if let Some(section) = sections.last_mut() {
            section.body.push_str(line);
            section.body.push('\n');
        } else {
            preamble.push_str(line);
            preamble.push('\n');
        }
    }
    (preamble, sections)
}

/// Renders one week narrative as a section body (header excluded).
fn render_week_body(narrative: &WeeklyNarrative) -> String {
    let mut out = String::new();
    if !narrative.title.is_empty() {
        out.push_str(&format!("**{}**\n\n", narrative.title));
    }
    out.push_str(narrative.body.trim_end());
    out.push('\n');
    if !narrative.notable.is_empty() {
        out.push_str("\n**Notable Changes**\n\n");
        for item in &narrative.notable {
            out.push_str(&format!("- {item}\n"));
        }
    }
    out
}

fn assemble_narrative(preamble: &str, sections: &[WeekSection]) -> String {
    let mut out = String::new();
    if !preamble.trim().is_empty() {
        out.push_str(preamble.trim_end());
        out.push_str("\n\n");
    }
    for section in sections {
        out.push_str(&section.header);
        out.push('\n');
        let body = section.body.trim_matches('\n');
        if !body.is_empty() {
            out.push('\n');
            out.push_str(body);
            out.push('\n');
        }
        out.push('\n');
    }
    out.trim_end().to_string() + "\n"
}

/// Merges week narratives into the narrative file: existing sections
/// with differing content are replaced (their header, including any
/// release marker, is kept), new ones are inserted so that sections run
/// in reverse-chronological order.
#[must_use]
pub fn merge_narrative(existing: &str, narratives: &[WeeklyNarrative]) -> String {
    let (preamble, mut sections) = split_week_sections(existing);

    for narrative in narratives {
        let body = render_week_body(narrative);
        if let Some(section) = sections
            .iter_mut()
            .find(|s| s.monday == Some(narrative.monday))
        {
            if section.body.trim_matches('\n') != body.trim_matches('\n') {
                section.body = body;
            }
        } else {
            sections.push(WeekSection {
                monday: Some(narrative.monday),
                header: format!("{WEEK_HEADER}{}", narrative.monday),
                body,
            });
        }
    }

    // reverse-chronological; undated sections sink to the bottom in
    // their original relative order
    sections.sort_by(|a, b| b.monday.cmp(&a.monday));
    assemble_narrative(&preamble, &sections)
}

/// Appends the release marker to the narrative section for the week of
/// `monday`. Already-marked sections are left alone.
#[must_use]
pub fn mark_release_in_narrative(existing: &str, version: &str, monday: NaiveDate) -> String {
    let (preamble, mut sections) = split_week_sections(existing);
    let marker = format!(" \u{2014} Released v{version} \u{1f680}");
    for section in &mut sections {
        if section.monday == Some(monday) && !section.header.contains(&marker) {
            section.header.push_str(&marker);
        }
    }
    assemble_narrative(&preamble, &sections)
}

// ── change log ──────────────────────────────────────────────────────

/// Parsed `[Unreleased]` section: subsection name to bullet descriptions.
#[derive(Debug, Default)]
struct Unreleased {
    bullets: Vec<(String, String)>,
}

impl Unreleased {
    fn contains(&self, subsection: &str, description: &str) -> bool {
        self.bullets
            .iter()
            .any(|(s, d)| s == subsection && d == description)
    }
}

/// Splits a change log into (preamble, unreleased, tail-after-unreleased).
fn split_changelog(existing: &str) -> (String, Unreleased, String) {
    let Some(start) = existing.find(UNRELEASED_HEADER) else {
        let preamble = if existing.trim().is_empty() {
            CHANGELOG_PREAMBLE.to_string()
        } else {
            existing.trim_end().to_string() + "\n"
        };
        return (preamble, Unreleased::default(), String::new());
    };

    let preamble = existing[..start].to_string();
    let after_header = &existing[start + UNRELEASED_HEADER.len()..];
    let (section_text, tail) = match after_header.find("\n## ") {
        Some(end) => (&after_header[..end], &after_header[end + 1..]),
        None => (after_header, ""),
    };

    let mut unreleased = Unreleased::default();
    let mut current = String::new();
    for line in section_text.lines() {
        if let Some(name) = line.trim().strip_prefix("### ") {
            current = name.trim().to_string();
        } else if line.trim_start().starts_with('-') && !current.is_empty() {
            unreleased
                .bullets
                .push((current.clone(), bullet_description(line)));
        }
    }
    (preamble, unreleased, tail.to_string())
}

fn render_unreleased(unreleased: &Unreleased) -> String {
    let mut out = String::from(UNRELEASED_HEADER);
    out.push('\n');
    for (name, emoji) in SUBSECTIONS {
        let bullets: Vec<&(String, String)> = unreleased
            .bullets
            .iter()
            .filter(|(s, _)| s == name)
            .collect();
        if bullets.is_empty() {
            continue;
        }
        out.push_str(&format!("\n### {name}\n\n"));
        for (_, description) in bullets {
            out.push_str(&format!("- {emoji} {description}\n"));
        }
    }
    out
}

/// Merges change records into the `[Unreleased]` section, deduplicating
/// by `(category, description)`. Prior version sections are preserved
/// byte-for-byte.
#[must_use]
pub fn merge_changelog(existing: &str, changes: &[Change]) -> String {
    let (preamble, mut unreleased, tail) = split_changelog(existing);

    for change in changes {
        let subsection = subsection_for(change.category);
        let description = change.description.trim();
        if description.is_empty() || unreleased.contains(subsection, description) {
            continue;
        }
        unreleased
            .bullets
            .push((subsection.to_string(), description.to_string()));
    }

    assemble_changelog(&preamble, &unreleased, &tail)
}

fn assemble_changelog(preamble: &str, unreleased: &Unreleased, tail: &str) -> String {
    let mut out = String::new();
    if !preamble.trim().is_empty() {
        out.push_str(preamble.trim_end());
        out.push_str("\n\n");
    }
    out.push_str(&render_unreleased(unreleased));
    if !tail.trim().is_empty() {
        out.push('\n');
        out.push_str(tail.trim_end());
        out.push('\n');
    }
    out.trim_end().to_string() + "\n"
}

/// Pre-release flow: moves the `[Unreleased]` contents into a new
/// `[vVERSION] - DATE` section and leaves a fresh empty `[Unreleased]`.
#[must_use]
pub fn apply_release(existing: &str, version: &str, date: NaiveDate) -> String {
    let (preamble, unreleased, tail) = split_changelog(existing);

    let mut released = String::new();
    released.push_str(&format!("## [v{version}] - {date}\n"));
    for (name, emoji) in SUBSECTIONS {
        let bullets: Vec<&(String, String)> = unreleased
            .bullets
            .iter()
            .filter(|(s, _)| s == name)
            .collect();
        if bullets.is_empty() {
            continue;
        }
        released.push_str(&format!("\n### {name}\n\n"));
        for (_, description) in bullets {
            released.push_str(&format!("- {emoji} {description}\n"));
        }
    }

    let mut out = String::new();
    if !preamble.trim().is_empty() {
        out.push_str(preamble.trim_end());
        out.push_str("\n\n");
    }
    out.push_str(UNRELEASED_HEADER);
    out.push_str("\n\n");
    out.push_str(&released);
    if !tail.trim().is_empty() {
        out.push('\n');
        out.push_str(tail.trim_end());
        out.push('\n');
    }
    out.trim_end().to_string() + "\n"
}

// ── daily ───────────────────────────────────────────────────────────

#[derive(Debug)]
struct DaySection {
    date: Option<NaiveDate>,
    header: String,
    body: String,
}

fn split_day_sections(text: &str) -> (String, Vec<DaySection>) {
    let mut preamble = String::new();
    let mut sections: Vec<DaySection> = Vec::new();

    for line in text.lines() {
        let date = line
            .strip_prefix("## ")
            .and_then(|rest| rest.trim().parse::<NaiveDate>().ok());
        if let Some(date) = date {
            sections.push(DaySection {
                date: Some(date),
                header: line.to_string(),
                body: String::new(),
            });
        } else if let Some(section) = sections.last_mut() {
            section.body.push_str(line);
            section.body.push('\n');
        } else {
            preamble.push_str(line);
            preamble.push('\n');
        }
    }
    (preamble, sections)
}

fn render_day_body(summary: &DailySummary) -> String {
    let mut out = String::new();
    out.push_str(summary.summary.trim_end());
    out.push('\n');
    if !summary.achievements.is_empty() {
        out.push('\n');
        for achievement in &summary.achievements {
            out.push_str(&format!("- {achievement}\n"));
        }
    }
    out
}

/// Upserts daily summaries by date, keeping sections in descending date
/// order.
#[must_use]
pub fn merge_daily(existing: &str, summaries: &[DailySummary]) -> String {
    let (preamble, mut sections) = split_day_sections(existing);

    for summary in summaries {
        let body = render_day_body(summary);
        if let Some(section) = sections.iter_mut().find(|s| s.date == Some(summary.date)) {
            if section.body.trim_matches('\n') != body.trim_matches('\n') {
                section.body = body;
            }
        } else {
            sections.push(DaySection {
                date: Some(summary.date),
                header: format!("## {}", summary.date),
                body,
            });
        }
    }

    sections.sort_by(|a, b| b.date.cmp(&a.date));

    let mut out = String::new();
    if !preamble.trim().is_empty() {
        out.push_str(preamble.trim_end());
        out.push_str("\n\n");
    }
    for section in &sections {
        out.push_str(&section.header);
        out.push('\n');
        let body = section.body.trim_matches('\n');
        if !body.is_empty() {
            out.push('\n');
            out.push_str(body);
            out.push('\n');
        }
        out.push('\n');
    }
    out.trim_end().to_string() + "\n"
}
