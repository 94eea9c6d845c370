//! Error types for the md-intent-namer library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`NamerError`] — **Fatal**: the document cannot be processed or the
//!   attachment plan cannot progress (unreadable file, failed relocation,
//!   failed write-back). Returned as `Err(NamerError)` from the top-level
//!   entry points in [`crate::process`].
//!
//! * [`ModelError`] — **Non-fatal**: one language-model interaction failed
//!   (network error, unparseable output, schema-invalid result). Stored inside
//!   [`crate::report::ItemReport`] so the pipeline can fall back to a local
//!   heuristic phrase instead of losing the whole document to one bad call.
//!
//! Model failures are never ambient state: every failed call surfaces as an
//! explicit `ModelError` value attached to the item it belongs to.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the md-intent-namer library.
///
/// Per-reference model failures use [`ModelError`] and are stored in
/// [`crate::report::ItemReport`] rather than propagated here.
#[derive(Debug, Error)]
pub enum NamerError {
    // ── Document errors ───────────────────────────────────────────────────
    /// The Markdown document was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    DocumentNotFound { path: PathBuf },

    /// Reading the document failed after falling back through known encodings.
    #[error("Failed to read document '{path}': {source}")]
    DocumentRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing the `.bak` sibling failed. The original file is still intact.
    #[error("Failed to write backup '{path}': {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Writing the rewritten document failed.
    #[error("Failed to write document '{path}': {source}")]
    DocumentWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Plan errors ───────────────────────────────────────────────────────
    /// The plan or mapping file could not be persisted. Execution halts so
    /// the recorded state never diverges from the filesystem.
    #[error("Failed to persist '{path}': {source}")]
    StatePersistFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted plan/mapping file exists but is not valid JSON.
    #[error("Corrupt state file '{path}': {detail}")]
    StateCorrupt { path: PathBuf, detail: String },

    /// Plan execution halted on item `index`. The plan file is left on disk;
    /// re-invoking apply resumes from this item once the cause is fixed.
    #[error("Attachment plan halted at item {index}: {detail}")]
    PlanHalted { index: usize, detail: String },

    // ── Relocation errors ─────────────────────────────────────────────────
    /// Download of a remote image failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// A move/copy of a local file failed.
    #[error("Failed to relocate '{from}' -> '{to}': {reason}")]
    RelocateFailed {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single language-model interaction.
///
/// Stored alongside [`crate::report::ItemReport`] when a call fails. The
/// pipeline continues with a heuristic fallback phrase.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelError {
    /// The HTTP call failed after all retries.
    #[error("model call failed after {retries} retries: {detail}")]
    CallFailed { retries: u32, detail: String },

    /// The endpoint answered but the body carried no usable content.
    #[error("model returned an empty response")]
    EmptyResponse,

    /// No JSON object could be recovered from the response text.
    #[error("model output is not parseable JSON: {snippet}")]
    ParseFailed { snippet: String },

    /// JSON parsed but did not satisfy the candidate schema.
    #[error("model output failed schema validation: {snippet}")]
    ValidateFailed { snippet: String },
}

impl ModelError {
    /// Short machine-readable tag used in reports.
    pub fn tag(&self) -> &'static str {
        match self {
            ModelError::CallFailed { .. } => "llm_call_failed",
            ModelError::EmptyResponse => "llm_empty_response",
            ModelError::ParseFailed { .. } => "llm_parse_failed",
            ModelError::ValidateFailed { .. } => "llm_validate_failed",
        }
    }
}
