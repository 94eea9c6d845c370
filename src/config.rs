//! Configuration types for the naming pipeline.
//!
//! All pipeline behaviour is controlled through [`NamerConfig`], built via its
//! [`NamerConfigBuilder`]. Keeping every knob in one struct makes it trivial
//! to share a config between a preview pass and an apply pass, and to diff two
//! runs to understand why their outputs differ.

use crate::error::NamerError;
use crate::observer::{NoopObserver, Observer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Configuration for a document naming run.
///
/// Built via [`NamerConfig::builder()`] or using [`NamerConfig::default()`].
///
/// # Example
/// ```rust
/// use md_intent_namer::{NamerConfig, Strategy};
///
/// let config = NamerConfig::builder()
///     .strategy(Strategy::Hybrid)
///     .max_name_len(48)
///     .chunk_size(8)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct NamerConfig {
    /// Naming strategy. Default: [`Strategy::Intent`].
    pub strategy: Strategy,

    /// File-name template with `{title}` `{intent}` `{block}` `{idx}`
    /// `{index}` `{dup}` placeholders. `None` uses the built-in
    /// `<title>_<index>_<phrase>` scheme.
    pub template: Option<String>,

    /// Name of the attachment directory created next to the document.
    /// Default: "attachments".
    pub attach_dir_name: String,

    /// Absolute attachment directory. Takes precedence over
    /// `attach_dir_name` when set.
    pub attach_dir: Option<PathBuf>,

    /// Hard cap on the rendered file stem, in characters. Default: 64.
    pub max_name_len: usize,

    /// Zero-pad width for bare numeric placeholders and the preview
    /// sequence number. Range: 1–6. Default: 3.
    pub seq_width: usize,

    /// References per model batch request. Default: 5.
    pub chunk_size: usize,

    // ── Model access ──────────────────────────────────────────────────────
    /// Ask a language model for intent phrases. When false every reference
    /// uses the local heuristic phrase. Default: false.
    pub use_model: bool,

    /// Send the image itself alongside the text context. Forces one request
    /// per reference instead of batching. Default: false.
    pub vision: bool,

    /// OpenAI-compatible base URL, e.g. "https://api.openai.com". A trailing
    /// `/v1` is stripped. Default: None (https://api.openai.com).
    pub api_base: Option<String>,

    /// Bearer token for the chat endpoint. Optional for local endpoints.
    pub api_key: Option<String>,

    /// Model identifier, e.g. "gpt-4o-mini". Default: None (endpoint default).
    pub model: Option<String>,

    /// Sampling temperature. Default: 0.0.
    ///
    /// The task is extraction, not generation. Zero keeps the phrase the
    /// model picks stable across runs of the same document.
    pub temperature: f32,

    /// Maximum tokens the model may generate per request. Default: 512.
    pub max_tokens: usize,

    /// Retry attempts per model call before falling back. Default: 3.
    pub max_retries: u32,

    /// Fixed delay between retry attempts in milliseconds. Default: 800.
    pub retry_backoff_ms: u64,

    /// Minimum delay before each model call in milliseconds, for endpoints
    /// with strict rate limits. Default: 0.
    pub rate_limit_ms: u64,

    /// Per-request timeout for the chat endpoint, in seconds. Default: 60.
    pub api_timeout_secs: u64,

    // ── Relocation ────────────────────────────────────────────────────────
    /// Download remote image URLs into the attachment directory. When false,
    /// remote references are recorded as skipped in the plan. Default: true.
    pub download_remote: bool,

    /// Per-download timeout in seconds. Default: 120.
    pub download_timeout_secs: u64,

    /// Write a `.bak` sibling before rewriting the document. Default: true.
    pub backup: bool,

    // ── Context extraction ────────────────────────────────────────────────
    /// Clip each context side to this many characters before it enters a
    /// prompt. Default: 800.
    pub context_clip_chars: usize,

    /// Maximum priority-ranked sentences per side in the prompt payload.
    /// Default: 6.
    pub context_sentence_limit: usize,

    /// Thresholds for the block-boundary heuristic.
    pub boundary: BoundaryConfig,

    // ── Integration ───────────────────────────────────────────────────────
    /// Receives pipeline events and batch confirmations. Default: no-op.
    pub observer: Observer,

    /// Cooperative cancellation flag, checked between references, between
    /// batches, and between plan items.
    pub cancel: Arc<AtomicBool>,
}

impl Default for NamerConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            template: None,
            attach_dir_name: "attachments".to_string(),
            attach_dir: None,
            max_name_len: 64,
            seq_width: 3,
            chunk_size: 5,
            use_model: false,
            vision: false,
            api_base: None,
            api_key: None,
            model: None,
            temperature: 0.0,
            max_tokens: 512,
            max_retries: 3,
            retry_backoff_ms: 800,
            rate_limit_ms: 0,
            api_timeout_secs: 60,
            download_remote: true,
            download_timeout_secs: 120,
            backup: true,
            context_clip_chars: 800,
            context_sentence_limit: 6,
            boundary: BoundaryConfig::default(),
            observer: Arc::new(NoopObserver),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl fmt::Debug for NamerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamerConfig")
            .field("strategy", &self.strategy)
            .field("template", &self.template)
            .field("attach_dir_name", &self.attach_dir_name)
            .field("attach_dir", &self.attach_dir)
            .field("max_name_len", &self.max_name_len)
            .field("seq_width", &self.seq_width)
            .field("chunk_size", &self.chunk_size)
            .field("use_model", &self.use_model)
            .field("vision", &self.vision)
            .field("api_base", &self.api_base)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_retries", &self.max_retries)
            .field("download_remote", &self.download_remote)
            .field("backup", &self.backup)
            .field("boundary", &self.boundary)
            .finish()
    }
}

impl NamerConfig {
    /// Create a new builder for `NamerConfig`.
    pub fn builder() -> NamerConfigBuilder {
        NamerConfigBuilder {
            config: Self::default(),
        }
    }

    /// Whether the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Builder for [`NamerConfig`].
pub struct NamerConfigBuilder {
    config: NamerConfig,
}

impl NamerConfigBuilder {
    pub fn strategy(mut self, s: Strategy) -> Self {
        self.config.strategy = s;
        self
    }

    pub fn template(mut self, t: impl Into<String>) -> Self {
        self.config.template = Some(t.into());
        self
    }

    pub fn attach_dir_name(mut self, name: impl Into<String>) -> Self {
        self.config.attach_dir_name = name.into();
        self
    }

    pub fn attach_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.attach_dir = Some(dir.into());
        self
    }

    pub fn max_name_len(mut self, n: usize) -> Self {
        self.config.max_name_len = n.max(8);
        self
    }

    pub fn seq_width(mut self, w: usize) -> Self {
        self.config.seq_width = w.clamp(1, 6);
        self
    }

    pub fn chunk_size(mut self, n: usize) -> Self {
        self.config.chunk_size = n.max(1);
        self
    }

    pub fn use_model(mut self, v: bool) -> Self {
        self.config.use_model = v;
        self
    }

    pub fn vision(mut self, v: bool) -> Self {
        self.config.vision = v;
        self
    }

    pub fn api_base(mut self, base: impl Into<String>) -> Self {
        self.config.api_base = Some(base.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn rate_limit_ms(mut self, ms: u64) -> Self {
        self.config.rate_limit_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn download_remote(mut self, v: bool) -> Self {
        self.config.download_remote = v;
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    pub fn backup(mut self, v: bool) -> Self {
        self.config.backup = v;
        self
    }

    pub fn context_clip_chars(mut self, n: usize) -> Self {
        self.config.context_clip_chars = n.max(80);
        self
    }

    pub fn context_sentence_limit(mut self, n: usize) -> Self {
        self.config.context_sentence_limit = n.max(1);
        self
    }

    pub fn boundary(mut self, b: BoundaryConfig) -> Self {
        self.config.boundary = b;
        self
    }

    pub fn observer(mut self, obs: Observer) -> Self {
        self.config.observer = obs;
        self
    }

    pub fn cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.config.cancel = flag;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<NamerConfig, NamerError> {
        let c = &self.config;
        if c.attach_dir_name.is_empty()
            || c.attach_dir_name.contains('/')
            || c.attach_dir_name.contains('\\')
        {
            return Err(NamerError::InvalidConfig(format!(
                "attachment directory name must be a bare directory name, got '{}'",
                c.attach_dir_name
            )));
        }
        if c.max_name_len < 8 {
            return Err(NamerError::InvalidConfig(format!(
                "max_name_len must be >= 8, got {}",
                c.max_name_len
            )));
        }
        if c.chunk_size == 0 {
            return Err(NamerError::InvalidConfig("chunk_size must be >= 1".into()));
        }
        if c.vision && !c.use_model {
            return Err(NamerError::InvalidConfig(
                "vision requires the model to be enabled".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// How the intent phrase for a reference is chosen.
///
/// `Seq` never touches the model; every other strategy uses the model when
/// one is configured and falls back to a local sentence heuristic otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Positional placeholder only; no context analysis.
    Seq,
    /// Prefer the text above the image.
    Above,
    /// Prefer the text below the image.
    Below,
    /// Bridge phrase for an image sitting between two passages.
    Between,
    /// One short phrase describing what the image is for. (default)
    #[default]
    Intent,
    /// Intent phrase informed by both sides plus explicit references.
    Hybrid,
}

impl Strategy {
    /// Tag used in templates, reports, and model payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Seq => "seq",
            Strategy::Above => "above",
            Strategy::Below => "below",
            Strategy::Between => "between",
            Strategy::Intent => "intent",
            Strategy::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = NamerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "seq" => Ok(Strategy::Seq),
            "above" => Ok(Strategy::Above),
            "below" => Ok(Strategy::Below),
            "between" => Ok(Strategy::Between),
            "intent" => Ok(Strategy::Intent),
            "hybrid" => Ok(Strategy::Hybrid),
            other => Err(NamerError::InvalidConfig(format!(
                "unknown strategy '{other}' (expected seq, above, below, between, intent, hybrid)"
            ))),
        }
    }
}

/// Thresholds for deciding when a reference starts a new logical block.
///
/// A reference opens a new block when enough substantive prose separates it
/// from the previous one. All three knobs are tunable so documents with very
/// short captions or dense figure grids can loosen or tighten grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Minimum visible (letter or digit) characters in the raw text between
    /// two references for a boundary to be considered. Default: 4.
    pub min_visible_chars: usize,

    /// Minimum letters that must remain after stripping reference phrases,
    /// headings, list markers, and figure labels. Default: 8.
    pub min_substantive_letters: usize,

    /// A literal gap of at most this many characters keeps the references in
    /// the same block regardless of content. Default: 3.
    pub max_adjacent_gap: usize,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            min_visible_chars: 4,
            min_substantive_letters: 8,
            max_adjacent_gap: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let config = NamerConfig::builder().build().unwrap();
        assert_eq!(config.strategy, Strategy::Intent);
        assert_eq!(config.attach_dir_name, "attachments");
        assert_eq!(config.max_name_len, 64);
        assert_eq!(config.seq_width, 3);
        assert_eq!(config.chunk_size, 5);
        assert!(!config.use_model);
        assert!(config.download_remote);
        assert!(config.backup);
    }

    #[test]
    fn setters_clamp_out_of_range_values() {
        let config = NamerConfig::builder()
            .max_name_len(1)
            .seq_width(99)
            .chunk_size(0)
            .temperature(5.0)
            .build()
            .unwrap();
        assert_eq!(config.max_name_len, 8);
        assert_eq!(config.seq_width, 6);
        assert_eq!(config.chunk_size, 1);
        assert_eq!(config.temperature, 2.0);
    }

    #[test]
    fn vision_without_model_is_rejected() {
        let err = NamerConfig::builder().vision(true).build().unwrap_err();
        assert!(matches!(err, NamerError::InvalidConfig(_)));
    }

    #[test]
    fn attach_dir_name_rejects_path_separators() {
        let err = NamerConfig::builder()
            .attach_dir_name("a/b")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("bare directory name"));
    }

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("Hybrid".parse::<Strategy>().unwrap(), Strategy::Hybrid);
        assert_eq!(" seq ".parse::<Strategy>().unwrap(), Strategy::Seq);
        assert!("panel".parse::<Strategy>().is_err());
    }

    #[test]
    fn strategy_display_round_trips() {
        for s in [
            Strategy::Seq,
            Strategy::Above,
            Strategy::Below,
            Strategy::Between,
            Strategy::Intent,
            Strategy::Hybrid,
        ] {
            assert_eq!(s.to_string().parse::<Strategy>().unwrap(), s);
        }
    }

    #[test]
    fn boundary_defaults() {
        let b = BoundaryConfig::default();
        assert_eq!(b.min_visible_chars, 4);
        assert_eq!(b.min_substantive_letters, 8);
        assert_eq!(b.max_adjacent_gap, 3);
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = NamerConfig::builder().api_key("sk-secret").build().unwrap();
        let dbg = format!("{config:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("redacted"));
    }
}
