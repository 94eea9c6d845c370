//! System prompts for model-assisted intent naming.
//!
//! Centralising every prompt here serves two purposes:
//!
//! 1. **Single source of truth** — tightening the JSON contract or the phrase
//!    length rule requires editing exactly one place.
//!
//! 2. **Testability** — unit tests can inspect the prompt text and the
//!    instruction builders directly without a live endpoint.

use crate::config::Strategy;

/// System prompt for naming a single image reference.
///
/// The model receives a JSON payload describing the image's surroundings and
/// must answer with exactly one JSON object. The repair layer tolerates fenced
/// or slightly malformed output, but the prompt still asks for bare JSON so
/// the common case needs no repair.
pub const SYSTEM_PROMPT: &str = r#"You name images embedded in Markdown documents. You receive a JSON payload describing one image: the document title, ranked sentences above and below the image (priority 1 is closest to the image), any explicit references such as "as shown below", and the image's alt text.

Respond with EXACTLY one JSON object, no prose, no code fences:

{
  "candidates": [
    {"strategy": "<tag>", "title": "<short noun phrase>", "reason": "<one sentence>", "confidence": 0.0-1.0}
  ],
  "best": "<tag of the strongest candidate>",
  "normalized_title": "<single best phrase, filesystem-safe>"
}

Rules:
- Each title is a 2-8 word noun phrase naming what the image is FOR, suitable as a file name. No articles, no punctuation, no file extensions.
- Produce one candidate per requested strategy tag. "above" candidates summarise the text above the image, "below" the text below, "between" bridges both passages, "intent" states the image's purpose, "hybrid" combines intent with the explicit references.
- If one side of the context is empty, base that candidate on the other side and lower its confidence.
- normalized_title must be usable verbatim as a file stem."#;

/// System prompt for a batch request covering several images at once.
///
/// Input carries `{"images": [{"index": N, ...}, ...]}`; the answer must carry
/// one entry per input index. Entries the model drops or malforms degrade only
/// that image, so the contract spells out the index echo explicitly.
pub const BATCH_SYSTEM_PROMPT: &str = r#"You name images embedded in Markdown documents. You receive a JSON payload with an "images" array; each entry describes one image (document title, ranked context sentences above/below, explicit references, alt text) and carries an "index".

Respond with EXACTLY one JSON object, no prose, no code fences:

{
  "items": [
    {
      "index": <echo the input index>,
      "candidates": [
        {"strategy": "<tag>", "title": "<short noun phrase>", "reason": "<one sentence>", "confidence": 0.0-1.0}
      ],
      "best": "<tag>",
      "normalized_title": "<single best phrase, filesystem-safe>"
    }
  ]
}

Rules:
- One item per input image, index echoed unchanged. Never merge or drop entries.
- Each title is a 2-8 word noun phrase naming what the image is FOR, suitable as a file name. No articles, no punctuation, no file extensions.
- Produce one candidate per requested strategy tag.
- normalized_title must be usable verbatim as a file stem."#;

/// Extra instruction appended to the user payload when the image itself is
/// attached to the request.
pub const VISION_SUFFIX: &str = "The image itself is attached. Weight what you see in the image at least as heavily as the surrounding text.";

/// Strategy tags the model must produce candidates for, given the run's
/// configured strategy.
///
/// `Seq` never reaches the model; callers short-circuit before building a
/// prompt, so it maps to an empty list here.
pub fn required_strategies(strategy: Strategy) -> &'static [&'static str] {
    match strategy {
        Strategy::Seq => &[],
        Strategy::Above => &["above", "intent"],
        Strategy::Below => &["below", "intent"],
        Strategy::Between => &["between", "intent"],
        Strategy::Intent => &["intent", "above", "below"],
        Strategy::Hybrid => &["intent", "hybrid", "above", "below"],
    }
}

/// One-line instruction naming the required strategy tags, embedded in the
/// user payload of every request.
pub fn strategy_instruction(strategy: Strategy) -> String {
    let tags = required_strategies(strategy);
    format!(
        "Produce one candidate for each of these strategy tags: {}. Preferred strategy: {}.",
        tags.join(", "),
        strategy.as_str()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_demand_bare_json() {
        assert!(SYSTEM_PROMPT.contains("EXACTLY one JSON object"));
        assert!(BATCH_SYSTEM_PROMPT.contains("EXACTLY one JSON object"));
        assert!(BATCH_SYSTEM_PROMPT.contains("\"items\""));
    }

    #[test]
    fn seq_requires_no_model_candidates() {
        assert!(required_strategies(Strategy::Seq).is_empty());
    }

    #[test]
    fn hybrid_requires_both_sides() {
        let tags = required_strategies(Strategy::Hybrid);
        assert!(tags.contains(&"above"));
        assert!(tags.contains(&"below"));
        assert!(tags.contains(&"hybrid"));
    }

    #[test]
    fn instruction_names_preferred_strategy() {
        let line = strategy_instruction(Strategy::Between);
        assert!(line.contains("between"));
        assert!(line.contains("Preferred strategy: between"));
    }
}
