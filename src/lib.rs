//! # md-intent-namer
//!
//! Give the images in a Markdown document names that say what they show.
//!
//! ## Why this crate?
//!
//! Notes exported from editors and clippers arrive full of
//! `Pasted image 20240312.png` and `b3f9c2d41a.jpg`. The filename carries
//! none of the meaning the surrounding prose already has. This crate reads
//! the sentences around each image reference, derives a short intent phrase
//! (locally, or via any OpenAI-compatible chat model), and renames the
//! files to `Install_Guide_003_license_dialog.png` — then moves them into a
//! per-document attachment directory and rewrites the links.
//!
//! ## Pipeline Overview
//!
//! ```text
//! document.md
//!  │
//!  ├─ 1. Scan     inline, raw-HTML, and wiki-embed image references
//!  ├─ 2. Context  clean prose above/below, explicit "figure below" cues
//!  ├─ 3. Name     chat model candidates, or a local sentence heuristic
//!  ├─ 4. Plan     persisted move/download plan, resumable after failures
//!  ├─ 5. Execute  relocate files, hash-keyed mapping prevents rework
//!  └─ 6. Rewrite  backup, then splice the new relative links in place
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use md_intent_namer::{preview, apply, NamerConfig};
//! use std::collections::{HashMap, HashSet};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NamerConfig::builder()
//!         .max_name_len(48)
//!         .build()?;
//!     // Dry run: names only, nothing touched.
//!     let report = preview(Path::new("note.md"), &config)?;
//!     for item in &report.items {
//!         println!("{} -> {}", item.src, item.suggested_name);
//!     }
//!     // Accept everything.
//!     apply(Path::new("note.md"), &config, &HashMap::new(), &HashSet::new())?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `mdintent` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! md-intent-namer = { version = "0.4", default-features = false }
//! ```
//!
//! ## Model or no model
//!
//! Everything works offline: with `use_model` off (the default) the intent
//! phrase comes from the nearest substantive sentence on the side the prose
//! points at. Enabling the model only changes where the phrase comes from;
//! scanning, planning, relocation, and rewriting are identical either way,
//! and any model failure degrades to the local heuristic per reference
//! instead of failing the run.

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod observer;
pub mod pipeline;
pub mod process;
pub mod prompts;
pub mod report;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{BoundaryConfig, NamerConfig, NamerConfigBuilder, Strategy};
pub use error::{ModelError, NamerError};
pub use observer::{NoopObserver, Observer, PipelineObserver};
pub use process::{apply, attach_dir_for, prefetch, preview, restore};
pub use report::{
    ApplyReport, DocumentReport, ItemReport, PrefetchDetail, PrefetchStats, RestoreStats,
};
