//! Result types for preview, apply, prefetch, and restore runs.
//!
//! Everything here serialises with serde so a run can be saved as JSON and
//! diffed against a later one. Model failures ride along inside
//! [`ItemReport::model_error`] — an item with a failed call still carries a
//! usable heuristic name.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::ModelError;
use crate::pipeline::candidates::Candidate;
use crate::pipeline::context::ExplicitRef;
use crate::pipeline::scan::RefKind;

/// Naming outcome for one image reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemReport {
    /// 1-indexed position in the document.
    pub index: usize,
    pub kind: RefKind,
    /// Link target exactly as written.
    pub src: String,
    pub block_index: usize,
    pub image_index: usize,
    pub above_text: String,
    pub below_text: String,
    pub between_text: String,
    pub explicit_refs: Vec<ExplicitRef>,
    /// Validated model candidates; empty when no model answered.
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub normalized_title: Option<String>,
    /// Final intent phrase after block stabilisation.
    pub phrase: String,
    /// Where the phrase came from: `seq`, `model_best`, `model_candidate`,
    /// `model_normalized`, `heuristic`, `block_same`, `prev_phrase`.
    pub phrase_source: String,
    /// Complete rendered file stem, duplicates disambiguated.
    pub suggested_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_error: Option<ModelError>,
    /// Truncated raw model text kept when parsing or validation failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_snippet: Option<String>,
    /// `single`, `batch`, or `vision` when a model request was made.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_mode: Option<String>,
}

/// Full preview of a document: every reference named, nothing touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReport {
    pub document: PathBuf,
    pub title: String,
    /// References found by the scanner.
    pub count: usize,
    pub items: Vec<ItemReport>,
    /// True when the run stopped early on the cancel flag or a rejected
    /// batch confirmation; trailing items carry heuristic names.
    pub cancelled: bool,
}

/// Result of an apply run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub document: PathBuf,
    pub title: String,
    pub attach_dir: PathBuf,
    /// Items in the executed plan.
    pub planned: usize,
    /// Items in `done` state after execution.
    pub done: usize,
    pub skipped: usize,
    pub errors: usize,
    /// `written` or `unchanged`.
    pub rewrite: String,
    /// Set when execution halted before completing the plan; the plan file
    /// on disk resumes from the failed item on the next run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    pub items: Vec<ItemReport>,
    pub cancelled: bool,
}

/// Per-source outcome of a prefetch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchDetail {
    pub src: String,
    /// `downloaded`, `moved`, `copied`, `reused`, `already`, `skipped`,
    /// `missing`, or `error`.
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_rel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Bulk-relocation statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefetchStats {
    pub total: usize,
    pub downloaded: usize,
    pub moved: usize,
    pub copied: usize,
    pub reused: usize,
    pub skipped: usize,
    pub missing: usize,
    pub errors: usize,
    /// Links rewritten in the document.
    pub updated: usize,
    pub details: Vec<PrefetchDetail>,
}

/// Result of moving attachments back to their recorded origins.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreStats {
    pub restored: usize,
    pub missing: usize,
    pub errors: usize,
    /// Links rewritten back to their original targets.
    pub updated: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serialises_without_empty_options() {
        let report = DocumentReport {
            document: PathBuf::from("/tmp/d.md"),
            title: "d".into(),
            count: 1,
            items: vec![ItemReport {
                index: 1,
                kind: RefKind::Inline,
                src: "a.png".into(),
                block_index: 1,
                image_index: 1,
                above_text: "above".into(),
                below_text: "below".into(),
                between_text: "above".into(),
                explicit_refs: vec![],
                candidates: vec![],
                best: None,
                normalized_title: None,
                phrase: "figure".into(),
                phrase_source: "seq".into(),
                suggested_name: "d_001_figure".into(),
                model_error: None,
                raw_snippet: None,
                request_mode: None,
            }],
            cancelled: false,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("model_error"));
        assert!(!json.contains("raw_snippet"));
        assert!(json.contains("\"suggested_name\":\"d_001_figure\""));
        let back: DocumentReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.items.len(), 1);
    }

    #[test]
    fn model_error_rides_inside_item_report() {
        let item = ItemReport {
            index: 2,
            kind: RefKind::RawHtml,
            src: "b.png".into(),
            block_index: 1,
            image_index: 2,
            above_text: String::new(),
            below_text: String::new(),
            between_text: String::new(),
            explicit_refs: vec![],
            candidates: vec![],
            best: None,
            normalized_title: None,
            phrase: "figure".into(),
            phrase_source: "heuristic".into(),
            suggested_name: "d_002_figure".into(),
            model_error: Some(ModelError::ParseFailed {
                snippet: "not json".into(),
            }),
            raw_snippet: Some("not json".into()),
            request_mode: Some("batch".into()),
        };
        let json = serde_json::to_string(&item).unwrap();
        assert!(json.contains("llm_parse_failed") || json.contains("parse_failed"));
    }
}
