//! Prompt fitting: lossless decomposition of over-budget prompts.
//!
//! A prompt is a template plus variable parts. When the rendered prompt
//! exceeds the token budget, the largest splittable variable is
//! partitioned into contiguous chunks at record boundaries (paragraph
//! boundaries for prose), with a configurable token overlap repeated
//! between adjacent chunks. Every input byte lands in exactly one chunk's
//! non-overlap region, so stitching the partial results back together
//! loses nothing.

use std::collections::HashSet;
use std::hash::Hash;

use sha2::{Digest, Sha256};

use crate::error::ChronicleError;

/// Overlap floor in tokens.
const MIN_OVERLAP_TOKENS: usize = 64;

/// Overlap ceiling in tokens.
const MAX_OVERLAP_TOKENS: usize = 1024;

/// Length of the deterministic seed embedded in chunk annotations.
const SEED_HEX_LEN: usize = 16;

/// Counts tokens in a piece of text. Correctness of the fitter only
/// relies on monotonicity: more text never counts fewer tokens.
pub trait TokenCounter: Send + Sync {
    /// Estimated token count of `text`.
    fn count(&self, text: &str) -> usize;
}

/// Character-ratio token estimate with a safety margin.
///
/// Roughly 3.5 characters per token for English text with code mixed in;
/// the 10% margin makes the estimate conservative, which is the safe
/// direction for budget checks.
#[derive(Debug, Clone)]
pub struct HeuristicCounter {
    chars_per_token: f64,
    safety_margin: f64,
}

impl Default for HeuristicCounter {
    fn default() -> Self {
        Self {
            chars_per_token: 3.5,
            safety_margin: 1.10,
        }
    }
}

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        let raw = text.len() as f64 / self.chars_per_token;
        (raw * self.safety_margin).ceil() as usize
    }
}

/// One indivisible unit of a splittable variable.
#[derive(Debug, Clone)]
pub struct FitRecord {
    /// Stable identifier (file path, hunk anchor, paragraph index).
    pub id: String,
    /// Exact text of the unit.
    pub text: String,
}

/// Content of one template variable.
#[derive(Debug, Clone)]
pub enum VarContent {
    /// Atomic text; never split.
    Text(String),
    /// Structured records; split only at record boundaries.
    Records(Vec<FitRecord>),
    /// Prose; split only at paragraph boundaries.
    Prose(String),
}

/// A named template variable.
#[derive(Debug, Clone)]
pub struct Variable {
    /// Placeholder name; `{name}` in the template.
    pub name: String,
    /// The variable's content.
    pub content: VarContent,
}

impl Variable {
    /// Convenience constructor for atomic text.
    #[must_use]
    pub fn text(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            content: VarContent::Text(value.into()),
        }
    }

    /// Convenience constructor for structured records.
    #[must_use]
    pub fn records(name: &str, records: Vec<FitRecord>) -> Self {
        Self {
            name: name.to_string(),
            content: VarContent::Records(records),
        }
    }

    /// Convenience constructor for prose.
    #[must_use]
    pub fn prose(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            content: VarContent::Prose(value.into()),
        }
    }
}

/// One rendered prompt plus the bookkeeping needed to stitch results.
#[derive(Debug, Clone)]
pub struct PromptChunk {
    /// Fully rendered prompt text.
    pub prompt: String,
    /// Zero-based chunk index.
    pub index: usize,
    /// Deterministic seed shared by all chunks of one fit.
    pub seed: String,
    /// Ids of the units rendered into this chunk, in order.
    pub unit_ids: Vec<String>,
    /// How many leading units are overlap repeated from the previous
    /// chunk. Always zero for the first chunk.
    pub overlap_len: usize,
}

/// Result of fitting one prompt.
#[derive(Debug, Clone)]
pub struct FitPlan {
    /// Chunks in order; a within-budget prompt yields exactly one.
    pub chunks: Vec<PromptChunk>,
    /// Overlap size in tokens used between adjacent chunks.
    pub overlap_tokens: usize,
}

impl FitPlan {
    /// Number of chunks.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Fits prompts into a token budget without dropping content.
pub struct PromptFitter<'a> {
    counter: &'a dyn TokenCounter,
    budget: usize,
    overlap_fraction: f64,
}

impl<'a> PromptFitter<'a> {
    /// Creates a fitter for `budget` tokens with the configured overlap
    /// fraction.
    #[must_use]
    pub fn new(counter: &'a dyn TokenCounter, budget: usize, overlap_fraction: f64) -> Self {
        Self {
            counter,
            budget,
            overlap_fraction,
        }
    }

    /// Fits `template` with `variables` into the budget.
    pub fn fit(
        &self,
        template: &str,
        variables: &[Variable],
    ) -> Result<FitPlan, ChronicleError> {
        let full = render(template, variables, None);
        let seed = derive_seed(&full);

        if self.counter.count(&full) <= self.budget {
            return Ok(FitPlan {
                chunks: vec![PromptChunk {
                    prompt: full,
                    index: 0,
                    seed,
                    unit_ids: Vec::new(),
                    overlap_len: 0,
                }],
                overlap_tokens: 0,
            });
        }

        let large = self.largest_splittable(variables)?;
        let units = to_units(&large.content);

        // Cost of everything that repeats in every chunk.
        let skeleton = render(template, variables, Some((&large.name, "")));
        let overhead = self.counter.count(&skeleton);
        if overhead >= self.budget {
            return Err(ChronicleError::Input(format!(
                "prompt overhead ({overhead} tokens) leaves no room in a {} token budget",
                self.budget
            )));
        }

        let capacity = self.budget - overhead;
        let overlap = ((capacity as f64 * self.overlap_fraction) as usize)
            .clamp(MIN_OVERLAP_TOKENS, MAX_OVERLAP_TOKENS)
            .min(capacity / 2);

        // Every chunk reserves `overlap` tokens for restated context, so a
        // record must fit in what remains.
        let unit_budget = capacity - overlap;
        for unit in &units {
            let tokens = self.counter.count(&unit.text);
            if tokens > unit_budget {
                return Err(ChronicleError::OversizedRecord {
                    record_id: unit.id.clone(),
                    tokens,
                    budget: unit_budget,
                });
            }
        }

        let partitions = self.partition(&units, capacity, overlap);
        let count = partitions.len();

        let chunks = partitions
            .into_iter()
            .enumerate()
            .map(|(index, part)| {
                let joined = join_units(&units, &part.unit_indices, &large.content);
                let annotated = format!(
                    "{}\n\n[segment {} of {} | seed {}]",
                    render(template, variables, Some((&large.name, &joined))),
                    index + 1,
                    count,
                    seed,
                );
                PromptChunk {
                    prompt: annotated,
                    index,
                    seed: seed.clone(),
                    unit_ids: part
                        .unit_indices
                        .iter()
                        .map(|&i| units[i].id.clone())
                        .collect(),
                    overlap_len: part.overlap_len,
                }
            })
            .collect();

        Ok(FitPlan {
            chunks,
            overlap_tokens: overlap,
        })
    }

    /// Picks the splittable variable contributing the most tokens.
    fn largest_splittable<'v>(
        &self,
        variables: &'v [Variable],
    ) -> Result<&'v Variable, ChronicleError> {
        let splittable = variables
            .iter()
            .filter(|v| !matches!(v.content, VarContent::Text(_)))
            .max_by_key(|v| self.counter.count(&content_text(&v.content)));

        if let Some(var) = splittable {
            return Ok(var);
        }

        // Nothing can be partitioned; report the largest atomic part.
        let largest = variables
            .iter()
            .max_by_key(|v| self.counter.count(&content_text(&v.content)));
        match largest {
            Some(var) => Err(ChronicleError::OversizedRecord {
                record_id: var.name.clone(),
                tokens: self.counter.count(&content_text(&var.content)),
                budget: self.budget,
            }),
            None => Err(ChronicleError::Input(
                "prompt template alone exceeds the token budget".to_string(),
            )),
        }
    }

    /// Greedy contiguous partition of `units` into chunks. Every chunk
    /// carries at most `capacity - overlap` tokens of new content (the
    /// remainder is reserved for restated context), so the chunk count
    /// never falls below `ceil(raw / (capacity - overlap))`. Non-initial
    /// chunks are prefixed with trailing units of their predecessor, as
    /// many as fit in the overlap allowance.
    fn partition(&self, units: &[FitRecord], capacity: usize, overlap: usize) -> Vec<Partition> {
        let sizes: Vec<usize> = units.iter().map(|u| self.counter.count(&u.text)).collect();
        let unit_budget = capacity - overlap;
        let mut partitions: Vec<Partition> = Vec::new();
        let mut next = 0;

        while next < units.len() {
            let mut indices: Vec<usize> = Vec::new();
            let mut overlap_len = 0;

            // Restated context: trailing units of the previous chunk,
            // newest first, while they fit in the overlap allowance.
            if let Some(prev) = partitions.last() {
                let mut overlap_units: Vec<usize> = Vec::new();
                let mut overlap_used = 0;
                for &i in prev.unit_indices.iter().rev() {
                    if overlap_used + sizes[i] > overlap {
                        break;
                    }
                    overlap_used += sizes[i];
                    overlap_units.push(i);
                }
                overlap_units.reverse();
                overlap_len = overlap_units.len();
                indices = overlap_units;
            }

            // New units until the reserved budget is spent; always at
            // least one so the partition advances.
            let mut new_used = 0;
            while next < units.len() {
                let cost = sizes[next];
                if new_used > 0 && new_used + cost > unit_budget {
                    break;
                }
                new_used += cost;
                indices.push(next);
                next += 1;
            }

            partitions.push(Partition {
                unit_indices: indices,
                overlap_len,
            });
        }

        partitions
    }
}

struct Partition {
    unit_indices: Vec<usize>,
    overlap_len: usize,
}

/// Concatenates results of a structured multi-chunk prompt in chunk
/// order, dropping records whose key was already produced by an earlier
/// chunk (overlap regions yield duplicates by construction).
pub fn stitch_structured<R, K, F>(parts: Vec<Vec<R>>, mut key_of: F) -> Vec<R>
where
    K: Eq + Hash,
    F: FnMut(&R) -> K,
{
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for part in parts {
        for record in part {
            if seen.insert(key_of(&record)) {
                merged.push(record);
            }
        }
    }
    merged
}

/// Joins prose segments with a blank line, discarding roughly the first
/// `overlap_tokens / 2` tokens of each non-initial segment (the region
/// restating the previous chunk's tail).
#[must_use]
pub fn stitch_prose(parts: &[String], counter: &dyn TokenCounter, overlap_tokens: usize) -> String {
    let discard_budget = overlap_tokens / 2;
    let mut joined: Vec<String> = Vec::new();

    for (i, part) in parts.iter().enumerate() {
        if i == 0 || discard_budget == 0 {
            joined.push(part.clone());
            continue;
        }
        let mut skipped = String::new();
        let mut rest = part.as_str();
        for word in part.split_inclusive(char::is_whitespace) {
            if counter.count(&skipped) >= discard_budget {
                break;
            }
            skipped.push_str(word);
            rest = &part[skipped.len()..];
        }
        joined.push(rest.trim_start().to_string());
    }

    joined
        .iter()
        .filter(|p| !p.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Renders `template`, replacing `{name}` placeholders. When `override_var`
/// is given, that variable renders as the supplied text instead.
fn render(template: &str, variables: &[Variable], override_var: Option<(&str, &str)>) -> String {
    let mut out = template.to_string();
    for var in variables {
        let placeholder = format!("{{{}}}", var.name);
        let value = match override_var {
            Some((name, text)) if name == var.name => text.to_string(),
            _ => content_text(&var.content),
        };
        out = out.replace(&placeholder, &value);
    }
    out
}

fn content_text(content: &VarContent) -> String {
    match content {
        VarContent::Text(text) | VarContent::Prose(text) => text.clone(),
        VarContent::Records(records) => records
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Splits variable content into indivisible units.
fn to_units(content: &VarContent) -> Vec<FitRecord> {
    match content {
        VarContent::Records(records) => records.clone(),
        VarContent::Prose(text) => split_paragraphs(text),
        VarContent::Text(text) => vec![FitRecord {
            id: "atomic".to_string(),
            text: text.clone(),
        }],
    }
}

/// Splits prose into paragraph units whose concatenation reproduces the
/// input exactly (separators stay attached to the preceding paragraph).
fn split_paragraphs(text: &str) -> Vec<FitRecord> {
    let mut units = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'\n' && bytes[i + 1] == b'\n' {
            let mut end = i + 2;
            while end < bytes.len() && bytes[end] == b'\n' {
                end += 1;
            }
            units.push(FitRecord {
                id: format!("para-{}", units.len()),
                text: text[start..end].to_string(),
            });
            start = end;
            i = end;
        } else {
            i += 1;
        }
    }
    if start < text.len() {
        units.push(FitRecord {
            id: format!("para-{}", units.len()),
            text: text[start..].to_string(),
        });
    }
    units
}

fn join_units(units: &[FitRecord], indices: &[usize], content: &VarContent) -> String {
    let parts: Vec<&str> = indices.iter().map(|&i| units[i].text.as_str()).collect();
    match content {
        VarContent::Prose(_) => parts.concat(),
        _ => parts.join("\n"),
    }
}

fn derive_seed(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..SEED_HEX_LEN].to_string()
}
