//! Context extraction: turn the text around each image reference into clean
//! prose the naming stage can reason about.
//!
//! Three concerns live here:
//!
//! - [`clean_context`] strips Markdown/HTML machinery from a slice of the
//!   document until only prose remains. Everything downstream (prompts,
//!   heuristic fallbacks, boundary decisions) sees cleaned text. The function
//!   is idempotent.
//! - Explicit-reference detection: phrases like "as shown below" pin an image
//!   to one side of its surroundings and narrow the context to the sentence
//!   containing the phrase.
//! - Block grouping: consecutive references separated by no substantive prose
//!   belong to one logical block and later share one intent phrase.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::{BoundaryConfig, NamerConfig, Strategy};
use crate::pipeline::scan::{self, ImageRef};

// ── Types ────────────────────────────────────────────────────────────────

/// Which side of the image a piece of context (or an explicit reference)
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Above,
    Below,
}

/// An explicit textual reference to the image, e.g. "as shown below".
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExplicitRef {
    /// Side of the image the phrase was found on.
    pub side: Side,
    pub phrase: String,
}

/// Everything the naming stage needs to know about one reference's
/// surroundings.
#[derive(Debug, Clone)]
pub struct RefContext {
    /// 1-indexed position among the document's references.
    pub index: usize,
    /// 1-indexed logical block this reference belongs to.
    pub block_index: usize,
    /// 1-indexed position within the block; 1 marks a block opener.
    pub image_index: usize,
    /// Cleaned prose between the previous reference (or the document start)
    /// and this image, clipped to the configured length.
    pub above: String,
    /// Cleaned prose between this image and the next reference (or the
    /// document end), clipped to the configured length.
    pub below: String,
    /// Bridge context for the `between` strategy.
    pub between: String,
    /// Sentence containing the first explicit reference above, if any.
    pub above_focus: Option<String>,
    /// Sentence containing the first explicit reference below, if any.
    pub below_focus: Option<String>,
    pub explicit_refs: Vec<ExplicitRef>,
    /// Side whose text is authoritative for this reference.
    pub effective_side: Side,
    /// Strategy after explicit references are taken into account.
    pub effective_strategy: Strategy,
}

// ── Cleaning ─────────────────────────────────────────────────────────────

static RE_CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)(```.*?```|~~~.*?~~~|```.*$)").unwrap());

static RE_INLINE_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"!\[[^\]]*\]\((?:[^()\\]|\\.|\([^()]*\))+\)"#).unwrap());

static RE_WIKI_EMBED: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[\[.*?\]\]").unwrap());

static RE_MD_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());

static RE_HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^<>\n]+>").unwrap());

static RE_BARE_IMAGE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b\S+\.(png|jpe?g|gif|webp|bmp|svg|tiff?|ico|heic)\b").unwrap());

static RE_META_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^[ \t]*(tags|parent|collections|\$version|\$libraryID|\$itemKey)[ \t]*:.*$")
        .unwrap()
});

static RE_HR_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]*(?:[-*_][ \t]*){3,}$").unwrap());

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

static RE_FRONT_MATTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A---\r?\n.*?\r?\n---[ \t]*(\r?\n|\z)").unwrap());

/// Reduce a slice of the document to plain prose.
///
/// Removes, in order: a leading front-matter block, code fences, wiki embeds,
/// inline images, Markdown links (label kept), HTML tags, bare image file
/// names, metadata lines, horizontal rules; then collapses all whitespace to
/// single spaces. `clean_context(clean_context(x)) == clean_context(x)`.
pub fn clean_context(text: &str) -> String {
    let text = RE_FRONT_MATTER.replace(text, "");
    let s = RE_CODE_FENCE.replace_all(&text, " ");
    let s = RE_WIKI_EMBED.replace_all(&s, " ");
    let s = RE_INLINE_IMAGE.replace_all(&s, " ");
    let s = RE_MD_LINK.replace_all(&s, "$1");
    let s = RE_HTML_TAG.replace_all(&s, " ");
    let s = RE_BARE_IMAGE_FILE.replace_all(&s, " ");
    let s = RE_META_LINE.replace_all(&s, " ");
    let s = RE_HR_LINE.replace_all(&s, " ");
    let s = s.replace(['#', '>', '*', '`'], " ");
    RE_WHITESPACE.replace_all(&s, " ").trim().to_string()
}

/// Split cleaned prose into sentences. Boundaries are `.`, `!`, `?`, `;`
/// and newlines; empty fragments are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', ';', '\n'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Priority-ranked sentences for one side of an image.
///
/// The above side is reversed so priority 1 is the sentence nearest the
/// image; the below side is already in nearest-first order.
pub fn ranked_sentences(side_text: &str, side: Side, limit: usize) -> Vec<String> {
    let mut sentences = split_sentences(side_text);
    if side == Side::Above {
        sentences.reverse();
    }
    sentences.truncate(limit);
    sentences
}

// ── Explicit references ──────────────────────────────────────────────────

// Phrases in the text ABOVE an image that point down at it.
static RE_REF_DOWN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(as shown below|as illustrated below|the following (?:figure|image|diagram|chart|screenshot)|the (?:figure|image|diagram|chart|screenshot) below|see figure \d+|shown in figure \d+|figure \d+ below)\b",
    )
    .unwrap()
});

// Phrases in the text BELOW an image that point up at it.
static RE_REF_UP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(as shown above|as illustrated above|the preceding (?:figure|image|diagram|chart|screenshot)|the (?:figure|image|diagram|chart|screenshot) above|see figure \d+|shown in figure \d+|figure \d+ above)\b",
    )
    .unwrap()
});

/// Find explicit references on both sides of an image.
///
/// `above` and `below` must already be cleaned.
pub fn find_explicit_refs(above: &str, below: &str) -> Vec<ExplicitRef> {
    let mut refs = Vec::new();
    for m in RE_REF_DOWN.find_iter(above) {
        refs.push(ExplicitRef {
            side: Side::Above,
            phrase: m.as_str().to_string(),
        });
    }
    for m in RE_REF_UP.find_iter(below) {
        refs.push(ExplicitRef {
            side: Side::Below,
            phrase: m.as_str().to_string(),
        });
    }
    refs
}

/// Pick the authoritative side given the explicit references and the
/// configured strategy. More references win; a tie falls back to the
/// strategy's own side, and `Below` is the final default.
pub fn decide_side(refs: &[ExplicitRef], strategy: Strategy) -> Side {
    let above = refs.iter().filter(|r| r.side == Side::Above).count();
    let below = refs.iter().filter(|r| r.side == Side::Below).count();
    if above > below {
        return Side::Above;
    }
    if below > above {
        return Side::Below;
    }
    match strategy {
        Strategy::Above => Side::Above,
        Strategy::Below => Side::Below,
        _ => Side::Below,
    }
}

/// The sentence containing the first explicit reference on `side`, if one
/// exists in `side_text`.
fn focus_sentence(side_text: &str, side: Side) -> Option<String> {
    let re = match side {
        Side::Above => &*RE_REF_DOWN,
        Side::Below => &*RE_REF_UP,
    };
    let m = re.find(side_text)?;
    let start = side_text[..m.start()]
        .rfind(['.', '!', '?', ';', '\n'])
        .map(|i| i + 1)
        .unwrap_or(0);
    let end = side_text[m.end()..]
        .find(['.', '!', '?', ';', '\n'])
        .map(|i| m.end() + i)
        .unwrap_or(side_text.len());
    let sentence = side_text[start..end].trim();
    (!sentence.is_empty()).then(|| sentence.to_string())
}

// ── Block grouping ───────────────────────────────────────────────────────

static RE_FIGURE_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*(?:figure|fig\.?|table|chart)[ \t]*\d+[:.\- \t]*.*$").unwrap());

/// Whether the raw text between two references separates them into distinct
/// blocks.
///
/// A boundary needs substantive prose: enough visible characters overall,
/// and enough letters once reference phrases, headings, list markers, and
/// figure labels are discounted. A near-zero literal gap or an explicit
/// reference in the gap always keeps the pair together.
pub fn is_block_boundary(gap: &str, b: &BoundaryConfig) -> bool {
    if gap.chars().count() <= b.max_adjacent_gap {
        return false;
    }
    if RE_REF_DOWN.is_match(gap) || RE_REF_UP.is_match(gap) {
        return false;
    }
    let visible = gap.chars().filter(|c| c.is_alphanumeric()).count();
    if visible < b.min_visible_chars {
        return false;
    }
    let mut kept = String::with_capacity(gap.len());
    for line in gap.lines() {
        let t = line.trim();
        if scan::is_atx_heading(t) || scan::is_list_marker(t) {
            continue;
        }
        kept.push_str(line);
        kept.push('\n');
    }
    let kept = RE_FIGURE_LABEL.replace_all(&kept, " ");
    let letters = kept.chars().filter(|c| c.is_alphabetic()).count();
    letters >= b.min_substantive_letters
}

/// Block and image indices for each reference, in document order.
///
/// The first reference opens block 1 at image 1; each later reference either
/// opens a new block (image index reset to 1) or continues the current one.
pub fn assign_indices(text: &str, refs: &[ImageRef], b: &BoundaryConfig) -> Vec<(usize, usize)> {
    let mut out = Vec::with_capacity(refs.len());
    let mut block = 0usize;
    let mut image = 0usize;
    for (i, r) in refs.iter().enumerate() {
        let new_block = if i == 0 {
            true
        } else {
            let gap = &text[refs[i - 1].span.end..r.span.start];
            is_block_boundary(gap, b)
        };
        if new_block {
            block += 1;
            image = 1;
        } else {
            image += 1;
        }
        out.push((block, image));
    }
    out
}

// ── Assembly ─────────────────────────────────────────────────────────────

/// Build the full context record for every reference in the document.
pub fn build_contexts(text: &str, refs: &[ImageRef], config: &NamerConfig) -> Vec<RefContext> {
    let indices = assign_indices(text, refs, &config.boundary);
    refs.iter()
        .enumerate()
        .map(|(i, r)| {
            // Each window stops at the neighbouring reference, so one image's
            // prose never bleeds into another's.
            let prev_end = if i == 0 { 0 } else { refs[i - 1].span.end };
            let next_start = refs.get(i + 1).map_or(text.len(), |n| n.span.start);
            let raw_above = &text[prev_end..r.span.start];
            let raw_below = &text[r.span.end..next_start];
            let above_full = clean_context(raw_above);
            let below_full = clean_context(raw_below);
            let above = clip_tail(&above_full, config.context_clip_chars);
            let below = clip_head(&below_full, config.context_clip_chars);
            let explicit_refs = find_explicit_refs(&above, &below);
            let effective_side = decide_side(&explicit_refs, config.strategy);
            let above_focus = focus_sentence(&above, Side::Above);
            let below_focus = focus_sentence(&below, Side::Below);
            let effective_strategy = match config.strategy {
                s @ (Strategy::Seq | Strategy::Above | Strategy::Below) => s,
                s => {
                    if explicit_refs.is_empty() {
                        s
                    } else {
                        match effective_side {
                            Side::Above => Strategy::Above,
                            Side::Below => Strategy::Below,
                        }
                    }
                }
            };
            let (block_index, image_index) = indices[i];
            RefContext {
                index: i + 1,
                block_index,
                image_index,
                between: above.clone(),
                above,
                below,
                above_focus,
                below_focus,
                explicit_refs,
                effective_side,
                effective_strategy,
            }
        })
        .collect()
}

/// Last `max_chars` characters of `s`, cut at a char boundary.
fn clip_tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}

/// First `max_chars` characters of `s`, cut at a char boundary.
fn clip_head(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}
