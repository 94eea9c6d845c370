//! Naming engine: render a chosen intent phrase into a filesystem-safe stem.
//!
//! Everything here is pure string work. The same inputs always produce the
//! same stem, [`sanitize_file_stem`] and [`render_name`] are idempotent, and
//! no output exceeds the configured length cap.

use once_cell::sync::Lazy;
use regex::Regex;

/// Extensions treated as image files throughout the pipeline.
pub const IMAGE_EXTS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "bmp", "svg", "tiff", "tif", "ico", "heic",
];

static RE_IMAGE_EXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\.(png|jpe?g|gif|webp|bmp|svg|tiff?|ico|heic)\b").unwrap());

static RE_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{(title|intent|block|idx|index|dup)(?::([.0-9]+d?))?\}").unwrap());

static RE_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Whether `ext` (without the dot) names an image format.
pub fn is_image_ext(ext: &str) -> bool {
    IMAGE_EXTS.iter().any(|e| ext.eq_ignore_ascii_case(e))
}

/// Remove image extensions wherever they appear in a phrase.
pub fn strip_image_exts(s: &str) -> String {
    RE_IMAGE_EXT.replace_all(s, "").into_owned()
}

/// Reduce arbitrary text to a safe file stem.
///
/// Drops control characters, brackets and quote marks (ASCII and fullwidth),
/// and the characters Windows forbids in file names; trims stray dots and
/// spaces; collapses whitespace runs to one `_`. Empty results become
/// "image". Idempotent.
pub fn sanitize_file_stem(input: &str) -> String {
    const DROPPED: &[char] = &[
        '（', '）', '(', ')', '【', '】', '「', '」', '『', '』', '“', '”', '‘', '’', '"', '\'',
        '\\', '/', ':', '*', '?', '<', '>', '|',
    ];
    let cleaned: String = input
        .chars()
        .filter(|c| !c.is_control() && !DROPPED.contains(c))
        .collect();
    let trimmed = cleaned.trim_matches([' ', '.', '\t']);
    let joined = RE_WHITESPACE
        .replace_all(trimmed, "_")
        .trim_matches('_')
        .to_string();
    if joined.is_empty() {
        "image".to_string()
    } else {
        joined
    }
}

/// Values available to [`render_name`] templates.
#[derive(Debug, Clone, Copy)]
pub struct NameParts<'a> {
    /// Document title, already sanitized.
    pub title: &'a str,
    /// Chosen intent phrase for this reference.
    pub intent: &'a str,
    /// 1-indexed logical block.
    pub block: usize,
    /// 1-indexed image position within the block.
    pub idx: usize,
    /// 1-indexed position in the whole document.
    pub index: usize,
    /// Per-document duplicate counter; 0 means first occurrence.
    pub dup: usize,
}

/// Render a template into a file stem.
///
/// Placeholders: `{title}`, `{intent}` (optionally `{intent:.N}` truncated to
/// N characters), `{block}`, `{idx}`, `{index}`, `{dup}`. Numeric
/// placeholders accept `{block:02}` / `{block:02d}` widths; the bare form
/// zero-pads to `seq_width`. Image extensions are stripped, the result is
/// sanitized, hard-capped at `max_len` characters, and right-trimmed of
/// ` `, `.`, `_`.
pub fn render_name(template: &str, parts: &NameParts<'_>, seq_width: usize, max_len: usize) -> String {
    let rendered = RE_PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        let spec = caps.get(2).map(|m| m.as_str());
        match &caps[1] {
            "title" => parts.title.to_string(),
            "intent" => {
                let phrase = strip_image_exts(parts.intent);
                match spec.and_then(|s| s.strip_prefix('.')) {
                    Some(n) => {
                        let n: usize = n.trim_end_matches('d').parse().unwrap_or(usize::MAX);
                        phrase.chars().take(n).collect()
                    }
                    None => phrase,
                }
            }
            numeric => {
                let value = match numeric {
                    "block" => parts.block,
                    "idx" => parts.idx,
                    "index" => parts.index,
                    _ => parts.dup,
                };
                let width = spec
                    .and_then(|s| s.trim_end_matches('d').parse::<usize>().ok())
                    .unwrap_or(seq_width);
                format!("{value:0width$}")
            }
        }
    });
    finalize_stem(&rendered, max_len)
}

/// Default stem when no template is configured:
/// `<doc>_<index>_<phrase>` with an optional 2-digit duplicate suffix.
///
/// The index is zero-padded to whichever is wider, `seq_width` or the digit
/// count of `total`.
pub fn preview_name(
    doc_base: &str,
    index: usize,
    total: usize,
    phrase: &str,
    dup: usize,
    seq_width: usize,
    max_len: usize,
) -> String {
    let width = seq_width.max(digits(total));
    let mut stem = format!("{doc_base}_{index:0width$}_{}", strip_image_exts(phrase));
    if dup > 0 {
        stem.push_str(&format!("_{dup:02}"));
    }
    finalize_stem(&stem, max_len)
}

fn digits(n: usize) -> usize {
    let mut n = n.max(1);
    let mut d = 0;
    while n > 0 {
        d += 1;
        n /= 10;
    }
    d
}

fn finalize_stem(raw: &str, max_len: usize) -> String {
    let stripped = strip_image_exts(raw);
    let sanitized = sanitize_file_stem(&stripped);
    let capped: String = sanitized.chars().take(max_len).collect();
    let trimmed = capped.trim_end_matches([' ', '.', '_']);
    if trimmed.is_empty() {
        "image".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_handles_forbidden_and_fullwidth_chars() {
        assert_eq!(sanitize_file_stem("a/b\\c:d*e?f\"g<h>i|j"), "abcdefghij");
        assert_eq!(sanitize_file_stem("（draft） \"final\" report"), "draft_final_report");
        assert_eq!(sanitize_file_stem("  spaced   out  "), "spaced_out");
        assert_eq!(sanitize_file_stem("trailing dots..."), "trailing_dots");
    }

    #[test]
    fn sanitize_is_idempotent_and_never_empty() {
        for input in ["", "???", "normal name", "a.b.c", " . . "] {
            let once = sanitize_file_stem(input);
            assert_eq!(sanitize_file_stem(&once), once, "input: {input:?}");
            assert!(!once.is_empty());
        }
        assert_eq!(sanitize_file_stem(""), "image");
        assert_eq!(sanitize_file_stem("???"), "image");
    }

    #[test]
    fn render_substitutes_all_placeholders() {
        let parts = NameParts {
            title: "Guide",
            intent: "cluster topology",
            block: 2,
            idx: 1,
            index: 7,
            dup: 0,
        };
        let stem = render_name("{title}_{block}_{idx}_{intent}", &parts, 3, 64);
        assert_eq!(stem, "Guide_002_001_cluster_topology");
    }

    #[test]
    fn render_honors_explicit_widths_and_truncation() {
        let parts = NameParts {
            title: "Doc",
            intent: "very long phrase here",
            block: 3,
            idx: 12,
            index: 1,
            dup: 4,
        };
        assert_eq!(
            render_name("{block:02}_{idx:04d}_{dup:02}", &parts, 3, 64),
            "03_0012_04"
        );
        assert_eq!(render_name("{intent:.9}", &parts, 3, 64), "very_long");
    }

    #[test]
    fn render_strips_image_extensions() {
        let parts = NameParts {
            title: "Doc",
            intent: "screenshot.png of setup",
            block: 1,
            idx: 1,
            index: 1,
            dup: 0,
        };
        let stem = render_name("{title}_{intent}", &parts, 2, 64);
        assert!(!stem.to_lowercase().contains("png"));
        assert_eq!(stem, "Doc_screenshot_of_setup");
    }

    #[test]
    fn render_caps_length_and_trims_tail() {
        let parts = NameParts {
            title: "T",
            intent: &"x".repeat(200),
            block: 1,
            idx: 1,
            index: 1,
            dup: 0,
        };
        let stem = render_name("{title}_{intent}", &parts, 2, 16);
        assert!(stem.chars().count() <= 16);
        assert!(!stem.ends_with(['_', '.', ' ']));
    }

    #[test]
    fn render_is_deterministic_and_idempotent_for_plain_output() {
        let parts = NameParts {
            title: "Doc",
            intent: "flow chart",
            block: 1,
            idx: 2,
            index: 2,
            dup: 0,
        };
        let a = render_name("{title}_{block}_{intent}", &parts, 3, 64);
        let b = render_name("{title}_{block}_{intent}", &parts, 3, 64);
        assert_eq!(a, b);
        assert_eq!(sanitize_file_stem(&a), a);
    }

    #[test]
    fn preview_name_pads_to_document_width() {
        let n = preview_name("notes", 3, 120, "deploy steps", 0, 3, 64);
        assert_eq!(n, "notes_003_deploy_steps");
        let wide = preview_name("notes", 3, 1200, "deploy steps", 0, 3, 64);
        assert_eq!(wide, "notes_0003_deploy_steps");
    }

    #[test]
    fn preview_name_appends_duplicate_counter() {
        let n = preview_name("notes", 4, 9, "overview", 2, 3, 64);
        assert_eq!(n, "notes_004_overview_02");
    }

    #[test]
    fn image_ext_detection() {
        assert!(is_image_ext("PNG"));
        assert!(is_image_ext("jpeg"));
        assert!(!is_image_ext("pdf"));
        assert_eq!(strip_image_exts("shot.png caption.JPG"), "shot caption");
    }
}
