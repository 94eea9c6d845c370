//! Candidate validation and phrase selection.
//!
//! The model returns a loose JSON object; [`validate`] normalises it into an
//! [`AiResult`] or rejects it with a [`ModelError`]. Selection
//! ([`pick_intent_phrase`]) then reduces the result to the single phrase the
//! naming engine will render, with a local sentence heuristic standing in
//! whenever no usable model answer exists.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Strategy;
use crate::error::ModelError;
use crate::pipeline::context::{RefContext, Side};
use crate::pipeline::naming::sanitize_file_stem;

/// One naming suggestion from the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub strategy: String,
    /// Sanitized, ready for template rendering.
    pub title: String,
    pub reason: String,
    pub confidence: f64,
}

/// Validated model answer for one reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResult {
    pub candidates: Vec<Candidate>,
    /// Strategy tag of the strongest candidate.
    pub best: String,
    /// Single best phrase, sanitized.
    pub normalized_title: String,
}

/// Wrapper keys models like to nest their answer under.
const WRAPPER_KEYS: &[&str] = &["result", "data", "output"];

/// Normalise a parsed model answer into an [`AiResult`].
///
/// Unwraps `result`/`data`/`output` nesting, requires a non-empty
/// `candidates` array whose entries carry `strategy` and `title`, defaults
/// `reason` to empty, clamps `confidence` into \[0, 1\] (default 0.5), and
/// fills `best`/`normalized_title` from the first candidate when absent.
pub fn validate(value: &Value) -> Result<AiResult, ModelError> {
    let obj = unwrap_nesting(value);

    let raw_candidates = obj
        .get("candidates")
        .and_then(Value::as_array)
        .filter(|a| !a.is_empty())
        .ok_or_else(|| ModelError::ValidateFailed {
            snippet: snippet(value),
        })?;

    let mut candidates = Vec::with_capacity(raw_candidates.len());
    for entry in raw_candidates {
        let strategy = entry
            .get("strategy")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty());
        let title = entry
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(sanitize_file_stem);
        let (Some(strategy), Some(title)) = (strategy, title) else {
            return Err(ModelError::ValidateFailed {
                snippet: snippet(entry),
            });
        };
        let reason = entry
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let confidence = entry
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.5)
            .clamp(0.0, 1.0);
        candidates.push(Candidate {
            strategy,
            title,
            reason,
            confidence,
        });
    }

    let best = obj
        .get("best")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| candidates[0].strategy.clone());
    let normalized_title = obj
        .get("normalized_title")
        .and_then(Value::as_str)
        .map(sanitize_file_stem)
        .filter(|s| s != "image")
        .unwrap_or_else(|| candidates[0].title.clone());

    Ok(AiResult {
        candidates,
        best,
        normalized_title,
    })
}

/// Validate a batch answer: `{"items": [{"index": N, ...}, ...]}`.
///
/// A malformed entry degrades only itself; the outer call fails only when no
/// `items` array exists at all. Entries without a usable index are dropped.
pub fn validate_batch(value: &Value) -> Result<Vec<(usize, Result<AiResult, ModelError>)>, ModelError> {
    let obj = unwrap_nesting(value);
    let items = obj
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| ModelError::ValidateFailed {
            snippet: snippet(value),
        })?;
    let mut out = Vec::with_capacity(items.len());
    for entry in items {
        let Some(index) = entry.get("index").and_then(Value::as_u64) else {
            continue;
        };
        out.push((index as usize, validate(entry)));
    }
    Ok(out)
}

fn unwrap_nesting(value: &Value) -> &Value {
    let mut v = value;
    loop {
        let mut advanced = false;
        for key in WRAPPER_KEYS {
            if let Some(inner) = v.get(key) {
                if inner.is_object() {
                    v = inner;
                    advanced = true;
                    break;
                }
            }
        }
        if !advanced {
            return v;
        }
    }
}

fn snippet(value: &Value) -> String {
    let mut s = value.to_string();
    if s.chars().count() > 160 {
        s = s.chars().take(160).collect::<String>() + "…";
    }
    s
}

// ── Selection ────────────────────────────────────────────────────────────

/// Phrase length cap for the local fallback heuristic.
const FALLBACK_MAX_CHARS: usize = 60;

/// Choose the phrase for one reference.
///
/// Returns the phrase and a short tag naming where it came from (used in
/// reports). `Seq` never consults the model; the other strategies prefer an
/// on-strategy candidate, then the normalized title, then the local
/// heuristic.
pub fn pick_intent_phrase(
    strategy: Strategy,
    ctx: &RefContext,
    ai: Option<&AiResult>,
) -> (String, &'static str) {
    if strategy == Strategy::Seq {
        return ("figure".to_string(), "seq");
    }
    if let Some(ai) = ai {
        let wanted: &[&str] = match strategy {
            Strategy::Above => &["above"],
            Strategy::Below => &["below"],
            Strategy::Between => &["between", "intent"],
            _ => &[],
        };
        if wanted.is_empty() {
            // Intent / Hybrid: trust the model's own pick.
            if let Some(c) = ai.candidates.iter().find(|c| c.strategy == ai.best) {
                return (c.title.clone(), "model_best");
            }
        } else if let Some(c) = ai
            .candidates
            .iter()
            .find(|c| wanted.contains(&c.strategy.as_str()))
        {
            return (c.title.clone(), "model_candidate");
        }
        return (ai.normalized_title.clone(), "model_normalized");
    }
    (fallback_phrase(ctx), "heuristic")
}

/// Local phrase when the model is unavailable or failed: the focus sentence
/// if an explicit reference narrowed one down, otherwise the sentence
/// nearest the image on the authoritative side.
pub fn fallback_phrase(ctx: &RefContext) -> String {
    let (focus, side_text) = match ctx.effective_side {
        Side::Above => (&ctx.above_focus, &ctx.above),
        Side::Below => (&ctx.below_focus, &ctx.below),
    };
    let raw = match focus {
        Some(f) => f.clone(),
        None => nearest_sentence(side_text, ctx.effective_side),
    };
    let clipped: String = raw.chars().take(FALLBACK_MAX_CHARS).collect();
    let stem = sanitize_file_stem(&clipped);
    if stem == "image" {
        "figure".to_string()
    } else {
        stem
    }
}

fn nearest_sentence(side_text: &str, side: Side) -> String {
    let sentences = crate::pipeline::context::split_sentences(side_text);
    match side {
        Side::Above => sentences.last().cloned().unwrap_or_default(),
        Side::Below => sentences.first().cloned().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NamerConfig;
    use crate::pipeline::context::build_contexts;
    use crate::pipeline::scan::collect_images;
    use serde_json::json;

    fn ctx_for(text: &str) -> RefContext {
        let config = NamerConfig::default();
        let refs = collect_images(text);
        build_contexts(text, &refs, &config).remove(0)
    }

    #[test]
    fn validate_fills_defaults() {
        let v = json!({
            "candidates": [
                {"strategy": "intent", "title": "db schema overview"}
            ]
        });
        let r = validate(&v).unwrap();
        assert_eq!(r.candidates.len(), 1);
        assert_eq!(r.candidates[0].title, "db_schema_overview");
        assert_eq!(r.candidates[0].reason, "");
        assert_eq!(r.candidates[0].confidence, 0.5);
        assert_eq!(r.best, "intent");
        assert_eq!(r.normalized_title, "db_schema_overview");
    }

    #[test]
    fn validate_unwraps_nested_result() {
        let v = json!({
            "result": {
                "candidates": [{"strategy": "above", "title": "topology", "confidence": 3.5}],
                "best": "above"
            }
        });
        let r = validate(&v).unwrap();
        assert_eq!(r.best, "above");
        assert_eq!(r.candidates[0].confidence, 1.0);
    }

    #[test]
    fn validate_rejects_empty_or_missing_candidates() {
        assert!(validate(&json!({})).is_err());
        assert!(validate(&json!({"candidates": []})).is_err());
        assert!(validate(&json!({"candidates": [{"strategy": "x"}]})).is_err());
    }

    #[test]
    fn batch_degrades_per_entry() {
        let v = json!({
            "items": [
                {"index": 1, "candidates": [{"strategy": "intent", "title": "good one"}]},
                {"index": 2, "candidates": []},
                {"no_index": true}
            ]
        });
        let items = validate_batch(&v).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items[0].1.is_ok());
        assert_eq!(items[0].0, 1);
        assert!(items[1].1.is_err());
    }

    #[test]
    fn batch_without_items_is_an_error() {
        let err = validate_batch(&json!({"candidates": []})).unwrap_err();
        assert_eq!(err.tag(), "llm_validate_failed");
    }

    #[test]
    fn seq_strategy_skips_the_model() {
        let ctx = ctx_for("text above\n\n![a](a.png)\n");
        let (phrase, tag) = pick_intent_phrase(Strategy::Seq, &ctx, None);
        assert_eq!(phrase, "figure");
        assert_eq!(tag, "seq");
    }

    #[test]
    fn on_strategy_candidate_wins() {
        let ctx = ctx_for("![a](a.png)\n");
        let ai = AiResult {
            candidates: vec![
                Candidate {
                    strategy: "intent".into(),
                    title: "purpose".into(),
                    reason: String::new(),
                    confidence: 0.9,
                },
                Candidate {
                    strategy: "above".into(),
                    title: "setup_steps".into(),
                    reason: String::new(),
                    confidence: 0.7,
                },
            ],
            best: "intent".into(),
            normalized_title: "purpose".into(),
        };
        let (phrase, tag) = pick_intent_phrase(Strategy::Above, &ctx, Some(&ai));
        assert_eq!(phrase, "setup_steps");
        assert_eq!(tag, "model_candidate");
        let (phrase, _) = pick_intent_phrase(Strategy::Intent, &ctx, Some(&ai));
        assert_eq!(phrase, "purpose");
    }

    #[test]
    fn missing_candidate_falls_back_to_normalized_title() {
        let ctx = ctx_for("![a](a.png)\n");
        let ai = AiResult {
            candidates: vec![Candidate {
                strategy: "intent".into(),
                title: "x".into(),
                reason: String::new(),
                confidence: 0.5,
            }],
            best: "hybrid".into(),
            normalized_title: "normalized_pick".into(),
        };
        let (phrase, tag) = pick_intent_phrase(Strategy::Below, &ctx, Some(&ai));
        assert_eq!(phrase, "normalized_pick");
        assert_eq!(tag, "model_normalized");
    }

    #[test]
    fn heuristic_uses_nearest_sentence_on_authoritative_side() {
        let ctx = ctx_for("Top matter. The cache layout is described next.\n\n![a](a.png)\n\nThe diagram lists every cache tier. More prose.\n");
        let (phrase, tag) = pick_intent_phrase(Strategy::Intent, &ctx, None);
        assert_eq!(tag, "heuristic");
        assert!(phrase.starts_with("The_diagram_lists"), "got: {phrase}");
    }

    #[test]
    fn heuristic_on_empty_context_is_figure() {
        let ctx = ctx_for("![a](a.png)");
        assert_eq!(fallback_phrase(&ctx), "figure");
    }
}
