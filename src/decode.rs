//! Tolerant decoding of LLM output into schema-checked JSON values.
//!
//! Model text rarely arrives as clean JSON: it gets wrapped in code
//! fences, prefixed with commentary, or sprinkled with trailing commas
//! and unquoted keys. The decoder "airlocks" the first balanced `{...}`
//! or `[...]` region whose content parses (after mechanical repairs) and
//! validates the result against a caller-supplied schema descriptor.
//! Anything beyond that is the caller's decision to retry or degrade.

use std::fmt;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Longest excerpt carried inside a [`DecodeError`].
const EXCERPT_LEN: usize = 160;

/// Why decoding failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeErrorKind {
    /// No balanced JSON-looking region found at all.
    NoValue,
    /// A region was found but never parsed, even after repairs.
    Syntax,
    /// Parsed fine but does not satisfy the schema.
    SchemaMismatch,
}

impl fmt::Display for DecodeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoValue => f.write_str("no value"),
            Self::Syntax => f.write_str("syntax"),
            Self::SchemaMismatch => f.write_str("schema mismatch"),
        }
    }
}

/// Decoding failure with a short excerpt of the offending text.
#[derive(Error, Debug, Clone)]
#[error("decode failed ({kind}): {excerpt}")]
pub struct DecodeError {
    /// Failure class.
    pub kind: DecodeErrorKind,
    /// Up to [`EXCERPT_LEN`] characters of the text that failed.
    pub excerpt: String,
}

impl DecodeError {
    fn new(kind: DecodeErrorKind, text: &str) -> Self {
        let end = text
            .char_indices()
            .nth(EXCERPT_LEN)
            .map_or(text.len(), |(i, _)| i);
        Self {
            kind,
            excerpt: text[..end].to_string(),
        }
    }
}

/// Expected JSON type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// JSON string.
    String,
    /// JSON number.
    Number,
    /// JSON boolean.
    Bool,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// One expected field of the decoded object.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    name: String,
    kind: FieldKind,
    required: bool,
}

/// Set of expected fields for the decoded top-level object.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Empty schema; accepts any object.
    #[must_use]
    pub fn object() -> Self {
        Self::default()
    }

    /// Adds a required field.
    #[must_use]
    pub fn required(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: true,
        });
        self
    }

    /// Adds an optional field; its type is still checked when present.
    #[must_use]
    pub fn optional(mut self, name: &str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: false,
        });
        self
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        let Some(object) = value.as_object() else {
            return Err("top-level value is not an object".to_string());
        };
        for field in &self.fields {
            match object.get(&field.name) {
                Some(v) if v.is_null() && !field.required => {}
                Some(v) => {
                    if !field.kind.matches(v) {
                        return Err(format!(
                            "field '{}' has wrong type (expected {:?})",
                            field.name, field.kind
                        ));
                    }
                }
                None if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                None => {}
            }
        }
        Ok(())
    }
}

/// Parses model output into a schema-conforming JSON object.
pub fn decode(text: &str, schema: &Schema) -> Result<Value, DecodeError> {
    let cleaned = strip_code_fences(text);

    let mut saw_candidate = false;
    let mut search_from = 0;
    while let Some(open) = find_opener(&cleaned, search_from) {
        saw_candidate = true;
        let Some(end) = balanced_end(&cleaned, open) else {
            search_from = open + 1;
            continue;
        };
        let candidate = &cleaned[open..=end];
        let parsed = serde_json::from_str::<Value>(candidate)
            .ok()
            .or_else(|| serde_json::from_str::<Value>(&repair(candidate)).ok());
        if let Some(value) = parsed {
            return match schema.check(&value) {
                Ok(()) => Ok(value),
                Err(_) => Err(DecodeError::new(DecodeErrorKind::SchemaMismatch, candidate)),
            };
        }
        search_from = open + 1;
    }

    if saw_candidate {
        Err(DecodeError::new(DecodeErrorKind::Syntax, &cleaned))
    } else {
        Err(DecodeError::new(DecodeErrorKind::NoValue, &cleaned))
    }
}

/// Unwraps ```...``` fences, preferring a ```json fence when present.
fn strip_code_fences(text: &str) -> String {
    let fenced = if let Some(rest) = text.split("```json").nth(1) {
        rest.split("```").next()
    } else if text.contains("```") {
        text.split("```").nth(1)
    } else {
        None
    };
    fenced.map_or_else(|| text.trim().to_string(), |inner| inner.trim().to_string())
}

fn find_opener(text: &str, from: usize) -> Option<usize> {
    text[from..]
        .find(['{', '['])
        .map(|i| from + i)
}

/// Index of the close matching the opener at `open`, respecting strings
/// and escapes. `None` when the text ends unbalanced.
fn balanced_end(text: &str, open: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Mechanical repairs for the two most common model defects: trailing
/// commas and unquoted keys. Both rewrites are conservative enough to
/// leave valid JSON unchanged.
fn repair(text: &str) -> String {
    // remove trailing commas before a closing brace/bracket
    let without_trailing = remove_trailing_commas(text);

    // quote bare keys: `{foo:` / `, bar_2:` -> `{"foo":` / `, "bar_2":`
    #[allow(clippy::unwrap_used)]
    let bare_key = Regex::new(r#"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)\s*:"#).unwrap();
    bare_key
        .replace_all(&without_trailing, "$1\"$2\":")
        .into_owned()
}

/// Removes `,` characters directly preceding `}` or `]`, outside strings.
fn remove_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for c in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            out.push(c);
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '}' | ']' => {
                // drop a comma that (ignoring whitespace) precedes this close
                let trimmed_len = out.trim_end().len();
                if out[..trimmed_len].ends_with(',') {
                    let tail = out.split_off(trimmed_len - 1);
                    out.push_str(tail.trim_start_matches(','));
                }
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
