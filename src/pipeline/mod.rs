//! Pipeline stages for Markdown image naming.
//!
//! Each submodule implements exactly one transformation step. Keeping
//! stages separate makes each independently testable and keeps the one
//! stage with network I/O ([`llm`], plus downloads in [`plan`]) isolated
//! from the pure text work.
//!
//! ## Data Flow
//!
//! ```text
//! scan ──▶ context ──▶ llm ──▶ repair ──▶ candidates ──▶ naming
//! (refs)   (prose)    (chat)  (JSON)     (validate)     (stems)
//!                                                          │
//!                                 rewrite ◀── plan ◀───────┘
//!                                 (links)    (move/download)
//! ```
//!
//! 1. [`scan`]       — find every image reference and logical block
//! 2. [`context`]    — clean surrounding prose and rank sentences
//! 3. [`llm`]        — chat-completion client and request payloads
//! 4. [`repair`]     — salvage JSON from a sloppy model reply
//! 5. [`candidates`] — validate candidates and pick the intent phrase
//! 6. [`naming`]     — sanitise and render the final file stem
//! 7. [`plan`]       — persisted relocation plan and its executor
//! 8. [`rewrite`]    — splice new targets back into the document

pub mod candidates;
pub mod context;
pub mod llm;
pub mod naming;
pub mod plan;
pub mod repair;
pub mod rewrite;
pub mod scan;
