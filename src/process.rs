//! Pipeline orchestration: the four document-level operations.
//!
//! - [`preview`] — name every reference without touching the filesystem.
//! - [`apply`] — preview, persist an attachment plan, execute it, and
//!   rewrite the document to point at the relocated files.
//! - [`prefetch`] — bulk relocation without intent naming.
//! - [`restore`] — move attachments back to their recorded origins.
//!
//! Model access is confined to the analysis phase; everything after the plan
//! is persisted works offline. A halted plan execution is reported, not
//! propagated as a fatal error, because the plan on disk already carries
//! everything needed to resume.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::{NamerConfig, Strategy};
use crate::error::{ModelError, NamerError};
use crate::pipeline::candidates::{self, AiResult};
use crate::pipeline::context::{self, RefContext};
use crate::pipeline::llm::{self, ChatClient};
use crate::pipeline::naming::{self, NameParts};
use crate::pipeline::plan::{self, EnsureAction, ItemStatus, PlanAction, PlanEntry};
use crate::pipeline::repair::repair_json;
use crate::pipeline::rewrite::{self, RewriteOutcome};
use crate::pipeline::scan::{self, ImageRef};
use crate::report::{
    ApplyReport, DocumentReport, ItemReport, PrefetchDetail, PrefetchStats, RestoreStats,
};

/// The attachment directory for a document.
pub fn attach_dir_for(path: &Path, config: &NamerConfig) -> PathBuf {
    config.attach_dir.clone().unwrap_or_else(|| {
        path.parent()
            .unwrap_or(Path::new("."))
            .join(&config.attach_dir_name)
    })
}

// ── Analysis ─────────────────────────────────────────────────────────────

struct Analysis {
    /// Document exactly as read from disk.
    raw: String,
    /// Text with export artefacts normalised; all spans refer to this.
    text: String,
    title: String,
    refs: Vec<ImageRef>,
    items: Vec<ItemReport>,
    cancelled: bool,
}

fn analyze(path: &Path, config: &NamerConfig) -> Result<Analysis, NamerError> {
    // ── Step 1: scan ─────────────────────────────────────────────────
    let raw = rewrite::read_document(path)?;
    let text = scan::normalize_embedded_html_images(&raw);
    let title = scan::extract_doc_title(&text, path);
    let refs = scan::collect_images(&text);
    let total = refs.len();
    config.observer.on_scan_complete(total);
    debug!(document = %path.display(), refs = total, "scan complete");

    // ── Step 2: context ──────────────────────────────────────────────
    let contexts = context::build_contexts(&text, &refs, config);

    // ── Step 3: model candidates ─────────────────────────────────────
    let mut ai: Vec<Option<Result<AiResult, ModelError>>> = (0..total).map(|_| None).collect();
    let mut raw_snippets: Vec<Option<String>> = vec![None; total];
    let mut request_mode: Vec<Option<String>> = vec![None; total];
    let mut cancelled = false;

    if config.use_model && config.strategy != Strategy::Seq && total > 0 {
        let client = ChatClient::from_config(config)?;
        if config.vision {
            cancelled = run_vision(
                path, &title, &refs, &contexts, &client, config, &mut ai, &mut raw_snippets,
                &mut request_mode,
            );
        } else {
            cancelled = run_batched(
                &title, &refs, &contexts, &client, config, &mut ai, &mut raw_snippets,
                &mut request_mode,
            );
        }
    }

    // ── Step 4: phrases and names ────────────────────────────────────
    let mut block_phrase: HashMap<usize, String> = HashMap::new();
    let mut prev_phrase: Option<String> = None;
    let mut name_counts: HashMap<String, usize> = HashMap::new();
    let mut items = Vec::with_capacity(total);

    for (i, ctx) in contexts.iter().enumerate() {
        let (ai_ok, model_error) = match ai[i].take() {
            Some(Ok(r)) => (Some(r), None),
            Some(Err(e)) => {
                config
                    .observer
                    .on_model_fallback(ctx.index, total, &e.to_string());
                (None, Some(e))
            }
            None => (None, None),
        };

        let (mut phrase, mut source) =
            if ctx.image_index > 1 && block_phrase.contains_key(&ctx.block_index) {
                (block_phrase[&ctx.block_index].clone(), "block_same".to_string())
            } else {
                let (p, s) =
                    candidates::pick_intent_phrase(ctx.effective_strategy, ctx, ai_ok.as_ref());
                (p, s.to_string())
            };
        if phrase.chars().count() < 3 {
            match &prev_phrase {
                Some(p) => {
                    phrase = p.clone();
                    source = "prev_phrase".to_string();
                }
                None => phrase = "figure".to_string(),
            }
        }
        if ctx.image_index == 1 {
            block_phrase.insert(ctx.block_index, phrase.clone());
        }
        prev_phrase = Some(phrase.clone());

        let suggested = render_stem(&title, ctx, &phrase, total, &mut name_counts, config);
        config
            .observer
            .on_reference_named(ctx.index, total, &suggested);

        items.push(ItemReport {
            index: ctx.index,
            kind: refs[i].kind,
            src: refs[i].src.clone(),
            block_index: ctx.block_index,
            image_index: ctx.image_index,
            above_text: ctx.above.clone(),
            below_text: ctx.below.clone(),
            between_text: ctx.between.clone(),
            explicit_refs: ctx.explicit_refs.clone(),
            candidates: ai_ok
                .as_ref()
                .map(|r| r.candidates.clone())
                .unwrap_or_default(),
            best: ai_ok.as_ref().map(|r| r.best.clone()),
            normalized_title: ai_ok.as_ref().map(|r| r.normalized_title.clone()),
            phrase,
            phrase_source: source,
            suggested_name: suggested,
            model_error,
            raw_snippet: raw_snippets[i].take(),
            request_mode: request_mode[i].take(),
        });
    }

    Ok(Analysis {
        raw,
        text,
        title,
        refs,
        items,
        cancelled,
    })
}

#[allow(clippy::too_many_arguments)]
fn run_vision(
    path: &Path,
    title: &str,
    refs: &[ImageRef],
    contexts: &[RefContext],
    client: &ChatClient,
    config: &NamerConfig,
    ai: &mut [Option<Result<AiResult, ModelError>>],
    raw_snippets: &mut [Option<String>],
    request_mode: &mut [Option<String>],
) -> bool {
    let doc_dir = path.parent().unwrap_or(Path::new("."));
    for (i, ctx) in contexts.iter().enumerate() {
        if config.is_cancelled() {
            return true;
        }
        let payload = llm::image_payload(ctx, title, &refs[i].alt, config);
        let resolved = if plan::is_remote(&refs[i].src) {
            None
        } else {
            plan::resolve_local_image(&refs[i].src, doc_dir)
        };
        let part = llm::vision_image_part(&refs[i].src, resolved.as_deref());
        let messages = llm::single_messages(&payload, part);
        request_mode[i] = Some("vision".to_string());
        match client.chat(&messages) {
            Ok(content) => match repair_json(&content) {
                Some(v) => {
                    let r = candidates::validate(&v);
                    if r.is_err() {
                        raw_snippets[i] = Some(snip(&content));
                    }
                    ai[i] = Some(r);
                }
                None => {
                    raw_snippets[i] = Some(snip(&content));
                    ai[i] = Some(Err(ModelError::ParseFailed {
                        snippet: snip(&content),
                    }));
                }
            },
            Err(e) => ai[i] = Some(Err(e)),
        }
    }
    false
}

#[allow(clippy::too_many_arguments)]
fn run_batched(
    title: &str,
    refs: &[ImageRef],
    contexts: &[RefContext],
    client: &ChatClient,
    config: &NamerConfig,
    ai: &mut [Option<Result<AiResult, ModelError>>],
    raw_snippets: &mut [Option<String>],
    request_mode: &mut [Option<String>],
) -> bool {
    let total = contexts.len();
    let mut batch: Vec<usize> = Vec::new();
    let mut payloads: Vec<serde_json::Value> = Vec::new();
    let mut batch_num = 0usize;

    for (i, ctx) in contexts.iter().enumerate() {
        if config.is_cancelled() {
            return true;
        }
        batch.push(i);
        payloads.push(llm::image_payload(ctx, title, &refs[i].alt, config));
        if batch.len() < config.chunk_size && i + 1 < total {
            continue;
        }

        batch_num += 1;
        let preview = serde_json::json!({ "images": payloads }).to_string();
        if !config.observer.confirm_batch(batch_num, batch.len(), &preview) {
            info!("batch {batch_num} declined, stopping");
            return true;
        }
        let messages = llm::batch_messages(&payloads);
        for &b in &batch {
            request_mode[b] = Some("batch".to_string());
        }
        match client.chat(&messages) {
            Ok(content) => match repair_json(&content) {
                Some(v) => match candidates::validate_batch(&v) {
                    Ok(entries) => {
                        let by_index: HashMap<usize, Result<AiResult, ModelError>> =
                            entries.into_iter().collect();
                        for &b in &batch {
                            match by_index.get(&contexts[b].index) {
                                Some(res) => {
                                    if res.is_err() {
                                        raw_snippets[b] = Some(snip(&content));
                                    }
                                    ai[b] = Some(res.clone());
                                }
                                None => {
                                    raw_snippets[b] = Some(snip(&content));
                                    ai[b] = Some(Err(ModelError::ValidateFailed {
                                        snippet: format!(
                                            "no item for index {}",
                                            contexts[b].index
                                        ),
                                    }));
                                }
                            }
                        }
                    }
                    Err(e) => {
                        for &b in &batch {
                            raw_snippets[b] = Some(snip(&content));
                            ai[b] = Some(Err(e.clone()));
                        }
                    }
                },
                None => {
                    for &b in &batch {
                        raw_snippets[b] = Some(snip(&content));
                        ai[b] = Some(Err(ModelError::ParseFailed {
                            snippet: snip(&content),
                        }));
                    }
                }
            },
            Err(e) => {
                for &b in &batch {
                    ai[b] = Some(Err(e.clone()));
                }
            }
        }
        batch.clear();
        payloads.clear();
    }
    false
}

fn snip(content: &str) -> String {
    if content.chars().count() <= 160 {
        content.to_string()
    } else {
        content.chars().take(160).collect::<String>() + "…"
    }
}

/// Render the final stem for one reference, disambiguating duplicates with
/// a counter.
fn render_stem(
    title: &str,
    ctx: &RefContext,
    phrase: &str,
    total: usize,
    counts: &mut HashMap<String, usize>,
    config: &NamerConfig,
) -> String {
    let make = |dup: usize| match &config.template {
        Some(t) => naming::render_name(
            t,
            &NameParts {
                title,
                intent: phrase,
                block: ctx.block_index,
                idx: ctx.image_index,
                index: ctx.index,
                dup,
            },
            config.seq_width,
            config.max_name_len,
        ),
        None => naming::preview_name(
            title,
            ctx.index,
            total,
            phrase,
            dup,
            config.seq_width,
            config.max_name_len,
        ),
    };
    let base = make(0);
    let count = counts.entry(base.clone()).or_insert(0);
    let name = if *count == 0 {
        base.clone()
    } else {
        let with_dup = make(*count);
        if with_dup == base {
            // Template without a {dup} placeholder; force a suffix.
            format!("{base}_{:02}", *count)
        } else {
            with_dup
        }
    };
    *count += 1;
    name
}

// ── Operations ───────────────────────────────────────────────────────────

/// Name every reference in the document. Read-only.
pub fn preview(path: &Path, config: &NamerConfig) -> Result<DocumentReport, NamerError> {
    let a = analyze(path, config)?;
    config.observer.on_run_complete(a.refs.len(), 0);
    Ok(DocumentReport {
        document: path.to_path_buf(),
        title: a.title,
        count: a.refs.len(),
        items: a.items,
        cancelled: a.cancelled,
    })
}

/// Name, relocate, and rewrite.
///
/// `overrides` replaces the suggested stem for specific reference indices;
/// `skips` leaves references out of the plan entirely. A pending plan from
/// an earlier halted run is resumed instead of being rebuilt, so fixing the
/// cause and re-running picks up at the failed item.
pub fn apply(
    path: &Path,
    config: &NamerConfig,
    overrides: &HashMap<usize, String>,
    skips: &HashSet<usize>,
) -> Result<ApplyReport, NamerError> {
    let a = analyze(path, config)?;
    let attach_dir = attach_dir_for(path, config);

    // ── Step 1: plan ─────────────────────────────────────────────────
    let mut entries = Vec::new();
    for item in &a.items {
        if skips.contains(&item.index) {
            continue;
        }
        let final_base = overrides
            .get(&item.index)
            .map(|s| naming::sanitize_file_stem(s))
            .unwrap_or_else(|| item.suggested_name.clone());
        entries.push(PlanEntry {
            index: item.index,
            block_index: item.block_index,
            image_index: item.image_index,
            src: item.src.clone(),
            final_base,
        });
    }
    let mut active_plan = match plan::load_plan(&attach_dir)? {
        Some(mut p) if !p.completed && p.document == path => {
            info!("resuming pending plan with {} items", p.items.len());
            plan::reset_for_resume(&mut p, path.parent().unwrap_or(Path::new(".")));
            plan::save_plan(&attach_dir, &p)?;
            p
        }
        _ => {
            let p = plan::build_plan(path, &a.title, &attach_dir, &entries, config);
            plan::save_plan(&attach_dir, &p)?;
            p
        }
    };
    let mut mapping = plan::load_mapping(&attach_dir)?;

    // ── Step 2: execute ──────────────────────────────────────────────
    let halted = match plan::execute_plan(&mut active_plan, &mut mapping, config) {
        Ok(_) => None,
        Err(NamerError::PlanHalted { index, detail }) => {
            warn!("plan halted at item {index}: {detail}");
            Some(format!("item {index}: {detail}"))
        }
        Err(e) => return Err(e),
    };

    // ── Step 3: rewrite links for relocated items ────────────────────
    let mut replacements = Vec::new();
    for item in &active_plan.items {
        if item.status != ItemStatus::Done || item.action == PlanAction::Skip {
            continue;
        }
        let Some(r) = a.refs.get(item.index - 1) else {
            continue;
        };
        let slice = &a.text[r.span.clone()];
        replacements.push((
            r.span.clone(),
            rewrite::replacement_for(r, slice, &item.target_rel),
        ));
    }
    replacements.sort_by_key(|(s, _)| s.start);
    let new_text = rewrite::splice(&a.text, &replacements);
    let outcome = rewrite::backup_then_write(path, &a.raw, &new_text, config.backup)?;

    let done = active_plan
        .items
        .iter()
        .filter(|i| i.status == ItemStatus::Done)
        .count();
    let skipped = active_plan
        .items
        .iter()
        .filter(|i| i.action == PlanAction::Skip && i.status == ItemStatus::Done)
        .count();
    let errors = active_plan
        .items
        .iter()
        .filter(|i| i.status == ItemStatus::Error)
        .count();
    config.observer.on_run_complete(a.refs.len(), done);

    Ok(ApplyReport {
        document: path.to_path_buf(),
        title: a.title,
        attach_dir,
        planned: active_plan.items.len(),
        done,
        skipped,
        errors,
        rewrite: rewrite_tag(outcome),
        halted,
        items: a.items,
        cancelled: a.cancelled,
    })
}

fn rewrite_tag(outcome: RewriteOutcome) -> String {
    match outcome {
        RewriteOutcome::Written => "written".to_string(),
        RewriteOutcome::Unchanged => "unchanged".to_string(),
    }
}

/// Pull every referenced asset into the attachment directory without
/// renaming, and point the document at the new locations.
pub fn prefetch(path: &Path, config: &NamerConfig) -> Result<PrefetchStats, NamerError> {
    let raw = rewrite::read_document(path)?;
    let text = scan::normalize_embedded_html_images(&raw);
    let refs = scan::collect_images(&text);
    config.observer.on_scan_complete(refs.len());
    let doc_dir = path.parent().unwrap_or(Path::new("."));
    let attach_dir = attach_dir_for(path, config);
    let mut mapping = plan::load_mapping(&attach_dir)?;
    let mut reserved = HashSet::new();

    let mut stats = PrefetchStats {
        total: refs.len(),
        ..Default::default()
    };
    let mut replacements = Vec::new();

    for (i, r) in refs.iter().enumerate() {
        if config.is_cancelled() {
            break;
        }
        let out = plan::ensure_attachment(
            &r.src, doc_dir, &attach_dir, &mut mapping, &mut reserved, false, config,
        );
        let (action, detail) = match &out.action {
            EnsureAction::Moved => {
                stats.moved += 1;
                ("moved", None)
            }
            EnsureAction::Copied => {
                stats.copied += 1;
                ("copied", None)
            }
            EnsureAction::Downloaded => {
                stats.downloaded += 1;
                ("downloaded", None)
            }
            EnsureAction::Reused => {
                stats.reused += 1;
                ("reused", None)
            }
            EnsureAction::Already => {
                stats.reused += 1;
                ("already", None)
            }
            EnsureAction::Skipped => {
                stats.skipped += 1;
                ("skipped", None)
            }
            EnsureAction::Error(e) if e == "source_missing" => {
                stats.missing += 1;
                ("missing", Some(e.clone()))
            }
            EnsureAction::Error(e) => {
                stats.errors += 1;
                ("error", Some(e.clone()))
            }
        };
        if let Some(rel) = &out.target_rel {
            if rel != &r.src {
                let slice = &text[r.span.clone()];
                replacements.push((r.span.clone(), rewrite::replacement_for(r, slice, rel)));
            }
        }
        stats.details.push(PrefetchDetail {
            src: r.src.clone(),
            action: action.to_string(),
            target_rel: out.target_rel.clone(),
            detail,
        });
        config
            .observer
            .on_item_complete(i + 1, refs.len(), action, &r.src);
        plan::save_mapping(&attach_dir, &mapping)?;
    }

    replacements.sort_by_key(|(s, _)| s.start);
    stats.updated = replacements.len();
    let new_text = rewrite::splice(&text, &replacements);
    rewrite::backup_then_write(path, &raw, &new_text, config.backup)?;
    config
        .observer
        .on_run_complete(stats.total, stats.total - stats.errors - stats.missing);
    Ok(stats)
}

/// Move every locally sourced attachment back where it came from, rewrite
/// the links, and drop the mapping entries.
pub fn restore(path: &Path, config: &NamerConfig) -> Result<RestoreStats, NamerError> {
    let raw = rewrite::read_document(path)?;
    let text = scan::normalize_embedded_html_images(&raw);
    let refs = scan::collect_images(&text);
    let doc_dir = path.parent().unwrap_or(Path::new("."));
    let attach_dir = attach_dir_for(path, config);
    let mut mapping = plan::load_mapping(&attach_dir)?;

    let mut stats = RestoreStats::default();
    let mut replacements = Vec::new();
    let local_keys: Vec<String> = mapping
        .iter()
        .filter(|(_, e)| e.kind == "local")
        .map(|(k, _)| k.clone())
        .collect();

    for key in local_keys {
        if config.is_cancelled() {
            break;
        }
        let entry = mapping[&key].clone();
        let Some(original) = entry.original.clone() else {
            continue;
        };
        if !entry.target.exists() {
            warn!("restore target missing: {}", entry.target.display());
            stats.missing += 1;
            mapping.remove(&key);
            continue;
        }
        match plan::move_file(&entry.target, &original) {
            Ok(()) => {
                stats.restored += 1;
                let back_rel = entry
                    .original_rel
                    .clone()
                    .unwrap_or_else(|| plan::rel_from_dir(doc_dir, &original));
                for r in refs.iter().filter(|r| r.src == entry.target_rel) {
                    let slice = &text[r.span.clone()];
                    replacements.push((
                        r.span.clone(),
                        rewrite::replacement_for(r, slice, &back_rel),
                    ));
                }
                mapping.remove(&key);
            }
            Err(e) => {
                warn!("restore failed for {key}: {e}");
                stats.errors += 1;
            }
        }
    }

    plan::save_mapping(&attach_dir, &mapping)?;
    replacements.sort_by_key(|(s, _)| s.start);
    stats.updated = replacements.len();
    let new_text = rewrite::splice(&text, &replacements);
    rewrite::backup_then_write(path, &raw, &new_text, config.backup)?;
    Ok(stats)
}
