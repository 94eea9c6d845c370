//! Reference scanner: structural pass over the raw Markdown text.
//!
//! Two views of the document come out of this module:
//!
//! - [`parse_blocks`] — a flat list of structural blocks (headings,
//!   paragraphs, lists, code fences, ...) covering the whole text, produced by
//!   one fence-aware linear scan. Block spans are byte ranges into the
//!   original text and never overlap.
//! - [`collect_images`] — every image reference in document order, with its
//!   exact byte span so the rewriter can splice replacements without
//!   disturbing any other byte.
//!
//! Three reference syntaxes are recognised: inline Markdown images, raw
//! `<img>` tags, and wiki-style embeds. An `<img>` tag that is itself the alt
//! text of an inline image (a common export artefact) is reported once, as
//! the inline reference.

use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;
use std::path::Path;

use crate::pipeline::naming::sanitize_file_stem;

// ── Types ────────────────────────────────────────────────────────────────

/// Structural class of a block of Markdown source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Heading,
    Paragraph,
    List,
    Table,
    Code,
    Quote,
    Html,
    Blank,
}

/// One structural block of the document.
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockKind,
    /// Byte range into the original text.
    pub span: Range<usize>,
    /// 1-indexed first line of the block.
    pub line_start: usize,
    /// 1-indexed last line of the block.
    pub line_end: usize,
    pub text: String,
}

/// Syntax a reference was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    /// `![alt](target "title")`
    Inline,
    /// `<img src="target" ...>`
    RawHtml,
    /// `![[target|alias]]`
    Embed,
}

/// One image reference, in document order.
#[derive(Debug, Clone)]
pub struct ImageRef {
    pub kind: RefKind,
    /// Link target exactly as written (quotes and titles already split off).
    pub src: String,
    /// Byte range of the full reference in the original text.
    pub span: Range<usize>,
    /// 1-indexed line the reference starts on.
    pub line: usize,
    /// Alt text (inline), alias (embed), or empty (raw HTML).
    pub alt: String,
    /// Optional link title from `![alt](target "title")`.
    pub title: Option<String>,
}

// ── Regexes ──────────────────────────────────────────────────────────────

static RE_INLINE_IMAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"!\[([^\]]*)\]\(((?:[^()\\]|\\.|\([^()]*\))+)\)"#).unwrap());

static RE_HTML_IMG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)<img\b[^>]*\bsrc=["']([^"']+)["'][^>]*>"#).unwrap());

static RE_WIKI_EMBED: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[\[(.*?)\]\]").unwrap());

static RE_ATX_HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+(.+?)\s*$").unwrap());

static RE_ATTACHMENT_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"data-attachment-key=["']([^"']+)["']"#).unwrap());

static RE_EMBEDDED_IMG_ALT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[(<img\b[^\]]*?>)(\|[^\]]*)?\]\(").unwrap());

// ── Block parsing ────────────────────────────────────────────────────────

fn classify_line(line: &str) -> BlockKind {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        BlockKind::Blank
    } else if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
        BlockKind::Code
    } else if is_atx_heading(trimmed) {
        BlockKind::Heading
    } else if trimmed.starts_with('>') {
        BlockKind::Quote
    } else if is_list_marker(trimmed) {
        BlockKind::List
    } else if trimmed.starts_with('|') {
        BlockKind::Table
    } else if trimmed.starts_with('<') && !trimmed.starts_with("<http") {
        BlockKind::Html
    } else {
        BlockKind::Paragraph
    }
}

pub(crate) fn is_atx_heading(trimmed: &str) -> bool {
    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    (1..=6).contains(&hashes)
        && trimmed[hashes..]
            .chars()
            .next()
            .map(|c| c == ' ' || c == '\t')
            .unwrap_or(false)
}

pub(crate) fn is_list_marker(trimmed: &str) -> bool {
    if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("+ ") {
        return true;
    }
    // Ordered markers: "1. " or "1) "
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return false;
    }
    matches!(trimmed.as_bytes().get(digits), Some(b'.') | Some(b')'))
        && matches!(trimmed.as_bytes().get(digits + 1), Some(b' ') | None)
}

/// Split the text into structural blocks with one fence-aware linear scan.
///
/// Consecutive lines of the same class merge into one block; an open code
/// fence swallows every line (including blanks) until its closing fence.
/// Heading lines are always single-line blocks.
pub fn parse_blocks(text: &str) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();
    let mut offset = 0usize;
    let mut line_no = 0usize;
    let mut in_fence = false;

    let mut current: Option<(BlockKind, usize, usize)> = None; // (kind, start_offset, start_line)

    let flush = |blocks: &mut Vec<Block>,
                 current: &mut Option<(BlockKind, usize, usize)>,
                 end: usize,
                 end_line: usize,
                 text: &str| {
        if let Some((kind, start, start_line)) = current.take() {
            blocks.push(Block {
                kind,
                span: start..end,
                line_start: start_line,
                line_end: end_line,
                text: text[start..end].to_string(),
            });
        }
    };

    for line in text.split_inclusive('\n') {
        line_no += 1;
        let content = line.strip_suffix('\n').unwrap_or(line);
        let is_fence_line = {
            let t = content.trim_start();
            t.starts_with("```") || t.starts_with("~~~")
        };

        let kind = if in_fence {
            BlockKind::Code
        } else {
            classify_line(content)
        };

        let continues = match (&current, kind) {
            (Some((k, _, _)), nk) if *k == nk => {
                // Headings never merge; each line is its own block.
                nk != BlockKind::Heading
            }
            _ => false,
        };
        if !continues {
            flush(&mut blocks, &mut current, offset, line_no.saturating_sub(1), text);
            current = Some((kind, offset, line_no));
        }

        if is_fence_line {
            if in_fence {
                // Closing fence ends the code block on this line.
                in_fence = false;
                flush(&mut blocks, &mut current, offset + line.len(), line_no, text);
            } else {
                in_fence = true;
            }
        }

        offset += line.len();
    }
    flush(&mut blocks, &mut current, offset, line_no, text);
    blocks
}

// ── Image collection ─────────────────────────────────────────────────────

/// Collect every image reference in document order.
///
/// Returned spans are strictly increasing and non-overlapping. Raw `<img>`
/// matches that sit inside an inline reference (or immediately follow `![`,
/// making them the alt text of one) are dropped.
pub fn collect_images(text: &str) -> Vec<ImageRef> {
    let mut refs: Vec<ImageRef> = Vec::new();

    let mut inline_spans: Vec<Range<usize>> = Vec::new();
    for caps in RE_INLINE_IMAGE.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        // `![[embed]]` is not an inline image even if the regex could be
        // coaxed into a partial match around it.
        if caps[1].starts_with('[') {
            continue;
        }
        let (src, title) = split_link_target(&caps[2]);
        if src.is_empty() {
            continue;
        }
        inline_spans.push(whole.range());
        refs.push(ImageRef {
            kind: RefKind::Inline,
            src,
            span: whole.range(),
            line: line_of(text, whole.start()),
            alt: caps[1].to_string(),
            title,
        });
    }

    for caps in RE_HTML_IMG.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let start = whole.start();
        let prefix = &text[..start];
        if prefix.ends_with("![") || prefix.ends_with("![\\") {
            continue;
        }
        if inline_spans.iter().any(|s| s.start <= start && start < s.end) {
            continue;
        }
        refs.push(ImageRef {
            kind: RefKind::RawHtml,
            src: caps[1].to_string(),
            span: whole.range(),
            line: line_of(text, start),
            alt: String::new(),
            title: None,
        });
    }

    for caps in RE_WIKI_EMBED.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let inner = &caps[1];
        let (target, alias) = match inner.split_once('|') {
            Some((t, a)) => (t.trim(), a.trim()),
            None => (inner.trim(), ""),
        };
        if target.is_empty() {
            continue;
        }
        refs.push(ImageRef {
            kind: RefKind::Embed,
            src: target.to_string(),
            span: whole.range(),
            line: line_of(text, whole.start()),
            alt: alias.to_string(),
            title: None,
        });
    }

    refs.sort_by_key(|r| r.span.start);
    refs
}

fn line_of(text: &str, byte_pos: usize) -> usize {
    text[..byte_pos].matches('\n').count() + 1
}

/// Separate a raw link target into the URL and an optional quoted title.
///
/// Handles angle-bracketed targets (`<path with spaces>`) and both quote
/// styles for the title.
pub fn split_link_target(raw: &str) -> (String, Option<String>) {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix('<') {
        if let Some(close) = rest.find('>') {
            let url = rest[..close].trim().to_string();
            let tail = rest[close + 1..].trim();
            return (url, parse_title(tail));
        }
    }
    for quote in ['"', '\''] {
        if raw.ends_with(quote) {
            let body = &raw[..raw.len() - 1];
            if let Some(open) = body.rfind(quote) {
                let url = raw[..open].trim();
                if !url.is_empty() {
                    return (url.to_string(), Some(body[open + 1..].to_string()));
                }
            }
        }
    }
    (raw.to_string(), None)
}

fn parse_title(tail: &str) -> Option<String> {
    for quote in ['"', '\''] {
        if let Some(body) = tail
            .strip_prefix(quote)
            .and_then(|s| s.strip_suffix(quote))
        {
            return Some(body.to_string());
        }
    }
    None
}

// ── Document title ───────────────────────────────────────────────────────

/// Pick a display title for the document.
///
/// Front-matter `parent:`/`title:` keys win, then the first ATX heading,
/// then the file stem. The result is sanitized for use inside file names.
pub fn extract_doc_title(text: &str, path: &Path) -> String {
    if let Some(v) = front_matter_value(text, &["parent", "title"]) {
        let s = sanitize_file_stem(&v);
        if s != "image" {
            return s;
        }
    }
    if let Some(caps) = RE_ATX_HEADING.captures(text) {
        let s = sanitize_file_stem(&caps[1]);
        if s != "image" {
            return s;
        }
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    sanitize_file_stem(&stem)
}

/// First non-empty value among `keys` in a leading YAML front-matter block.
/// Keys match case-insensitively; surrounding quotes are stripped.
fn front_matter_value(text: &str, keys: &[&str]) -> Option<String> {
    let body = front_matter_body(text)?;
    for key in keys {
        for line in body.lines() {
            let Some((k, v)) = line.split_once(':') else {
                continue;
            };
            if !k.trim().eq_ignore_ascii_case(key) {
                continue;
            }
            let v = v.trim().trim_matches('"').trim_matches('\'').trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// Byte range of the front-matter body (between the `---` lines), if the
/// document opens with one.
pub(crate) fn front_matter_body(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
    if rest.starts_with("---") {
        return Some("");
    }
    for line in rest.match_indices('\n').map(|(i, _)| i) {
        let after = &rest[line + 1..];
        if after.starts_with("---") {
            let tail = &after[3..];
            if tail.is_empty() || tail.starts_with('\n') || tail.starts_with("\r\n") {
                return Some(&rest[..line + 1]);
            }
        }
    }
    None
}

// ── Export normalisation ─────────────────────────────────────────────────

/// Rewrite `![<img ... data-attachment-key="K" ...>|alias](target)` to
/// `![K](target)`.
///
/// Some exporters stuff the original HTML tag into the alt text of the
/// Markdown image they generate. The attachment key is the only part worth
/// keeping; references without a key are left untouched.
pub fn normalize_embedded_html_images(text: &str) -> String {
    RE_EMBEDDED_IMG_ALT
        .replace_all(text, |caps: &regex::Captures<'_>| {
            match RE_ATTACHMENT_KEY.captures(&caps[1]) {
                Some(key) => format!("![{}](", &key[1]),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const DOC: &str = "# Title\n\nIntro paragraph.\n\n![first](img/a.png)\n\nMiddle text.\n\n<img src=\"b.png\" width=\"80\">\n\n![[c.png|figure c]]\n";

    #[test]
    fn collects_all_three_syntaxes_in_order() {
        let refs = collect_images(DOC);
        assert_eq!(refs.len(), 3);
        assert_eq!(refs[0].kind, RefKind::Inline);
        assert_eq!(refs[0].src, "img/a.png");
        assert_eq!(refs[1].kind, RefKind::RawHtml);
        assert_eq!(refs[1].src, "b.png");
        assert_eq!(refs[2].kind, RefKind::Embed);
        assert_eq!(refs[2].src, "c.png");
        assert_eq!(refs[2].alt, "figure c");
        // Spans strictly increase and reproduce the source slices.
        for pair in refs.windows(2) {
            assert!(pair[0].span.end <= pair[1].span.start);
        }
        assert_eq!(&DOC[refs[0].span.clone()], "![first](img/a.png)");
    }

    #[test]
    fn img_tag_inside_inline_alt_reported_once() {
        let text = "![<img src=\"x.png\" data-attachment-key=\"K1\">|x](attachments/x.png)";
        let refs = collect_images(text);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, RefKind::Inline);
        assert_eq!(refs[0].src, "attachments/x.png");
    }

    #[test]
    fn inline_target_with_parentheses_and_title() {
        let text = "![d](assets/d%20(final).png \"Final diagram\")";
        let refs = collect_images(text);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].src, "assets/d%20(final).png");
        assert_eq!(refs[0].title.as_deref(), Some("Final diagram"));
    }

    #[test]
    fn split_link_target_variants() {
        assert_eq!(split_link_target("a.png"), ("a.png".into(), None));
        assert_eq!(
            split_link_target("a.png \"The title\""),
            ("a.png".into(), Some("The title".into()))
        );
        assert_eq!(
            split_link_target("<my dir/a.png> 'T'"),
            ("my dir/a.png".into(), Some("T".into()))
        );
        assert_eq!(split_link_target("<spaced path.png>"), ("spaced path.png".into(), None));
    }

    #[test]
    fn blocks_cover_text_without_overlap() {
        let blocks = parse_blocks(DOC);
        assert!(!blocks.is_empty());
        let mut pos = 0;
        for b in &blocks {
            assert_eq!(b.span.start, pos);
            pos = b.span.end;
        }
        assert_eq!(pos, DOC.len());
        assert_eq!(blocks[0].kind, BlockKind::Heading);
    }

    #[test]
    fn code_fence_swallows_image_syntax() {
        let text = "para\n\n```\n![not an image](x.png)\n```\n";
        let blocks = parse_blocks(text);
        let code = blocks.iter().find(|b| b.kind == BlockKind::Code).unwrap();
        assert!(code.text.contains("not an image"));
        assert_eq!(code.line_start, 3);
        assert_eq!(code.line_end, 5);
    }

    #[test]
    fn list_and_table_lines_classified() {
        let text = "- one\n- two\n\n| a | b |\n|---|---|\n| 1 | 2 |\n";
        let blocks = parse_blocks(text);
        assert_eq!(blocks[0].kind, BlockKind::List);
        assert_eq!(blocks[0].line_end, 2);
        assert_eq!(blocks[2].kind, BlockKind::Table);
        assert_eq!(blocks[2].line_end, 6);
    }

    #[test]
    fn title_prefers_front_matter_then_heading_then_stem() {
        let p = PathBuf::from("/tmp/notes file.md");
        let fm = "---\ntitle: \"Network Design\"\n---\n# Other\n";
        assert_eq!(extract_doc_title(fm, &p), "Network_Design");
        let heading_only = "intro\n\n## Setup Guide\n";
        assert_eq!(extract_doc_title(heading_only, &p), "Setup_Guide");
        assert_eq!(extract_doc_title("plain text", &p), "notes_file");
    }

    #[test]
    fn front_matter_parent_key_wins() {
        let p = PathBuf::from("/tmp/x.md");
        let fm = "---\nparent: Deploy Notes\ntitle: ignored\n---\n";
        assert_eq!(extract_doc_title(fm, &p), "Deploy_Notes");
    }

    #[test]
    fn normalize_embedded_rewrites_keyed_tags_only() {
        let text = "![<img alt=\"x\" data-attachment-key=\"ABC123\" src=\"y\">|fig](attachments/y.png) and ![<img src=\"z\">|z](z.png)";
        let out = normalize_embedded_html_images(text);
        assert!(out.starts_with("![ABC123](attachments/y.png)"));
        assert!(out.contains("![<img src=\"z\">|z](z.png)"));
    }

    #[test]
    fn wiki_embed_without_alias() {
        let refs = collect_images("![[pasted image 1.png]]");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].src, "pasted image 1.png");
        assert_eq!(refs[0].alt, "");
    }
}
