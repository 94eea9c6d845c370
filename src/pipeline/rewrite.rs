//! Document reading and link rewriting.
//!
//! Reading is tolerant: UTF-8 first, then UTF-16 behind a BOM, then lossy
//! UTF-8 so a document with a few bad bytes still round-trips. Writing is
//! strict: one `.bak` sibling with the pre-rewrite text, then a
//! newline-normalised UTF-8 write of the new content.
//!
//! Rewriting is pure span splicing. Replacements are applied with a cursor
//! over the original byte ranges the scanner reported, so every byte outside
//! a rewritten reference is preserved exactly.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::ops::Range;
use std::path::Path;
use tracing::debug;

use crate::error::NamerError;
use crate::pipeline::scan::{ImageRef, RefKind};

/// Result of writing a document back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    Written,
    /// New content equalled the old; nothing touched on disk.
    Unchanged,
}

/// Read a Markdown document, tolerating UTF-16 and stray bytes.
pub fn read_document(path: &Path) -> Result<String, NamerError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(NamerError::DocumentNotFound {
                path: path.to_path_buf(),
            })
        }
        Err(e) => {
            return Err(NamerError::DocumentRead {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    if let Ok(s) = String::from_utf8(bytes.clone()) {
        return Ok(s);
    }
    if let Some(s) = decode_utf16(&bytes) {
        return Ok(s);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn decode_utf16(bytes: &[u8]) -> Option<String> {
    let (le, body) = match bytes {
        [0xFF, 0xFE, rest @ ..] => (true, rest),
        [0xFE, 0xFF, rest @ ..] => (false, rest),
        _ => return None,
    };
    if body.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|c| {
            if le {
                u16::from_le_bytes([c[0], c[1]])
            } else {
                u16::from_be_bytes([c[0], c[1]])
            }
        })
        .collect();
    String::from_utf16(&units).ok()
}

// ── Splicing ─────────────────────────────────────────────────────────────

/// Apply span replacements to the original text.
///
/// `replacements` must be sorted by span start and non-overlapping — exactly
/// what the scanner produces.
pub fn splice(text: &str, replacements: &[(Range<usize>, String)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;
    for (span, replacement) in replacements {
        debug_assert!(span.start >= cursor && span.end <= text.len());
        out.push_str(&text[cursor..span.start]);
        out.push_str(replacement);
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

static RE_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^<>]+>").unwrap());
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Replacement text pointing a reference at `new_rel`.
///
/// Inline references are re-rendered in full, with HTML stripped out of the
/// alt text and pipes flattened. Raw HTML and embeds keep their original
/// syntax and only swap the source string.
pub fn replacement_for(r: &ImageRef, original_slice: &str, new_rel: &str) -> String {
    match r.kind {
        RefKind::Inline => render_inline(&r.alt, new_rel, r.title.as_deref()),
        RefKind::RawHtml | RefKind::Embed => original_slice.replacen(&r.src, new_rel, 1),
    }
}

/// `![alt](rel "title")` with a cleaned alt text.
pub fn render_inline(alt: &str, rel: &str, title: Option<&str>) -> String {
    let alt = RE_TAG.replace_all(alt, " ");
    let alt = alt.replace('|', " ");
    let alt = RE_WS.replace_all(alt.trim(), " ");
    match title {
        Some(t) if !t.is_empty() => format!("![{alt}]({rel} \"{t}\")"),
        _ => format!("![{alt}]({rel})"),
    }
}

// ── Write-back ───────────────────────────────────────────────────────────

/// Write the rewritten document, backing up the original first.
///
/// Line endings are normalised to `\n`. Returns
/// [`RewriteOutcome::Unchanged`] without touching the filesystem when the
/// new text equals the old.
pub fn backup_then_write(
    path: &Path,
    original: &str,
    new_text: &str,
    backup: bool,
) -> Result<RewriteOutcome, NamerError> {
    let normalized = new_text.replace("\r\n", "\n").replace('\r', "\n");
    if normalized == original {
        debug!("document unchanged: {}", path.display());
        return Ok(RewriteOutcome::Unchanged);
    }
    if backup {
        let bak = backup_path(path);
        fs::write(&bak, original).map_err(|source| NamerError::BackupFailed {
            path: bak.clone(),
            source,
        })?;
    }
    fs::write(path, normalized).map_err(|source| NamerError::DocumentWriteFailed {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(RewriteOutcome::Written)
}

fn backup_path(path: &Path) -> std::path::PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".bak");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::scan::collect_images;
    use tempfile::tempdir;

    #[test]
    fn splice_preserves_surrounding_bytes() {
        let text = "a ![x](old.png) b ![y](two.png) c";
        let refs = collect_images(text);
        let replacements = vec![
            (refs[0].span.clone(), "NEW1".to_string()),
            (refs[1].span.clone(), "NEW2".to_string()),
        ];
        assert_eq!(splice(text, &replacements), "a NEW1 b NEW2 c");
    }

    #[test]
    fn inline_rerender_cleans_alt() {
        let out = render_inline("<img src=\"x\">|fig one", "attachments/a.png", Some("Cap"));
        assert_eq!(out, "![fig one](attachments/a.png \"Cap\")");
        let plain = render_inline("diagram", "a.png", None);
        assert_eq!(plain, "![diagram](a.png)");
    }

    #[test]
    fn html_and_embed_swap_source_only() {
        let text = "<img src=\"old.png\" width=\"80\"> and ![[old.png|alias]]";
        let refs = collect_images(text);
        let html = replacement_for(&refs[0], &text[refs[0].span.clone()], "new.png");
        assert_eq!(html, "<img src=\"new.png\" width=\"80\">");
        let embed = replacement_for(&refs[1], &text[refs[1].span.clone()], "new.png");
        assert_eq!(embed, "![[new.png|alias]]");
    }

    #[test]
    fn unchanged_content_touches_nothing() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("d.md");
        fs::write(&doc, "same\n").unwrap();
        let out = backup_then_write(&doc, "same\n", "same\n", true).unwrap();
        assert_eq!(out, RewriteOutcome::Unchanged);
        assert!(!dir.path().join("d.md.bak").exists());
    }

    #[test]
    fn write_creates_backup_and_normalises_newlines() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("d.md");
        fs::write(&doc, "old\n").unwrap();
        let out = backup_then_write(&doc, "old\n", "new line one\r\nline two\r", true).unwrap();
        assert_eq!(out, RewriteOutcome::Written);
        assert_eq!(fs::read_to_string(&doc).unwrap(), "new line one\nline two\n");
        assert_eq!(
            fs::read_to_string(dir.path().join("d.md.bak")).unwrap(),
            "old\n"
        );
    }

    #[test]
    fn backup_can_be_disabled() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("d.md");
        fs::write(&doc, "old\n").unwrap();
        backup_then_write(&doc, "old\n", "new\n", false).unwrap();
        assert!(!dir.path().join("d.md.bak").exists());
    }

    #[test]
    fn reads_utf16_and_lossy_fallback() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("u16.md");
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "hi ![a](a.png)".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        fs::write(&doc, &bytes).unwrap();
        assert_eq!(read_document(&doc).unwrap(), "hi ![a](a.png)");

        let bad = dir.path().join("bad.md");
        fs::write(&bad, [b'o', b'k', 0xFF, b'!']).unwrap();
        let text = read_document(&bad).unwrap();
        assert!(text.starts_with("ok"));

        assert!(matches!(
            read_document(&dir.path().join("missing.md")),
            Err(NamerError::DocumentNotFound { .. })
        ));
    }
}
