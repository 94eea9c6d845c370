//! Layered recovery of a JSON object from model output.
//!
//! Models asked for bare JSON still wrap it in fences, preface it with prose,
//! or leave a trailing comma. Each layer here is cheap and deterministic; the
//! first one that yields a parseable object wins:
//!
//! 1. A fenced ```json block anywhere in the text.
//! 2. Fences stripped from the edges, then a direct parse.
//! 3. A string-aware, brace-balanced extraction of the first `{...}`.
//! 4. Trailing-comma repair, applied to whichever candidate got this far.
//!
//! Valid input passes through every layer unchanged, so repairing already
//! clean JSON is a no-op.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(.*?)```").unwrap());

static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());

/// Recover a JSON object from raw model output.
///
/// Returns `None` when no layer can produce valid JSON.
pub fn repair_json(raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(caps) = RE_FENCED_BLOCK.captures(raw) {
        if let Some(v) = parse_or_fix(caps[1].trim()) {
            return Some(v);
        }
    }
    let stripped = strip_edge_fences(raw);
    if let Ok(v) = serde_json::from_str(stripped) {
        return Some(v);
    }
    if let Some(obj) = balanced_object(stripped) {
        if let Some(v) = parse_or_fix(obj) {
            return Some(v);
        }
    }
    parse_or_fix(stripped)
}

fn parse_or_fix(s: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(s) {
        return Some(v);
    }
    serde_json::from_str(&fix_trailing_commas(s)).ok()
}

/// Remove `,` immediately before a closing brace or bracket.
pub fn fix_trailing_commas(s: &str) -> String {
    RE_TRAILING_COMMA.replace_all(s, "$1").into_owned()
}

/// Drop a fence line at the very start and/or very end of the text.
fn strip_edge_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if s.starts_with("```") {
        s = s.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    }
    if let Some(stripped) = s.trim_end().strip_suffix("```") {
        s = stripped.trim_end().trim_end_matches(|c| c == '`');
    }
    s.trim()
}

/// The first brace-balanced `{...}` in the text, honoring JSON string
/// escapes so braces inside string values don't end the object early.
pub fn balanced_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
