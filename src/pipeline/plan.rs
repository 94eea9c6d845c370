//! Attachment plan state machine.
//!
//! Relocation is split into two phases so a crash can never leave the
//! document pointing at files that don't exist:
//!
//! 1. [`build_plan`] classifies every reference into a `move`, `download`,
//!    `skip`, or `error` item with a reserved target name, and the whole plan
//!    is persisted as `.image_plan.json` inside the attachment directory.
//! 2. [`execute_plan`] walks the items in order, performs the file
//!    operations, and persists the plan and the asset mapping after every
//!    single item. A failure marks the item, persists, and halts; re-running
//!    resumes exactly where it stopped, and a completed plan re-executes as a
//!    pure no-op.
//!
//! The asset mapping (`.image_moves.json`) records where every relocated
//! file came from, keyed by content source, with a SHA-256 of the bytes.
//! Entries whose target vanished or changed hash are dropped on sight.

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::NamerConfig;
use crate::error::NamerError;
use crate::pipeline::naming::is_image_ext;

pub const PLAN_FILE: &str = ".image_plan.json";
pub const MAPPING_FILE: &str = ".image_moves.json";

// ── Plan types ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Move,
    Download,
    /// Recorded but deliberately not relocated (remote downloads disabled).
    Skip,
    /// Unresolvable at plan time; halts execution until addressed.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Done,
    Error,
}

/// One reference's relocation, as persisted in the plan file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub index: usize,
    pub block_index: usize,
    pub image_index: usize,
    /// Link target exactly as written in the document.
    pub original_src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_abs: Option<PathBuf>,
    pub action: PlanAction,
    /// Rendered stem without extension.
    pub final_base: String,
    pub target_abs: PathBuf,
    /// Slash-separated path relative to the document directory.
    pub target_rel: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mapping_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// The persisted plan for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    pub document: PathBuf,
    pub title: String,
    pub attach_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub items: Vec<PlanItem>,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One relocated asset in `.image_moves.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingEntry {
    /// "remote" or "local".
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_rel: Option<String>,
    pub target: PathBuf,
    pub target_rel: String,
    /// SHA-256 of the file contents, lowercase hex.
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub moved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
}

pub type Mapping = BTreeMap<String, MappingEntry>;

// ── Persistence ──────────────────────────────────────────────────────────

pub fn plan_path(attach_dir: &Path) -> PathBuf {
    attach_dir.join(PLAN_FILE)
}

pub fn mapping_path(attach_dir: &Path) -> PathBuf {
    attach_dir.join(MAPPING_FILE)
}

pub fn load_plan(attach_dir: &Path) -> Result<Option<PlanFile>, NamerError> {
    load_state(&plan_path(attach_dir))
}

pub fn save_plan(attach_dir: &Path, plan: &PlanFile) -> Result<(), NamerError> {
    save_state(attach_dir, &plan_path(attach_dir), plan)
}

pub fn load_mapping(attach_dir: &Path) -> Result<Mapping, NamerError> {
    Ok(load_state(&mapping_path(attach_dir))?.unwrap_or_default())
}

pub fn save_mapping(attach_dir: &Path, mapping: &Mapping) -> Result<(), NamerError> {
    save_state(attach_dir, &mapping_path(attach_dir), mapping)
}

fn load_state<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, NamerError> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(NamerError::StatePersistFailed {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| NamerError::StateCorrupt {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
}

fn save_state<T: Serialize>(attach_dir: &Path, path: &Path, value: &T) -> Result<(), NamerError> {
    let persist_err = |source| NamerError::StatePersistFailed {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(attach_dir).map_err(persist_err)?;
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| NamerError::Internal(format!("serialize state: {e}")))?;
    fs::write(path, json).map_err(|source| NamerError::StatePersistFailed {
        path: path.to_path_buf(),
        source,
    })
}

// ── Keys, hashing, name reservation ──────────────────────────────────────

/// Whether a link target is a remote URL.
pub fn is_remote(src: &str) -> bool {
    src.starts_with("http://") || src.starts_with("https://")
}

/// Content key for the asset mapping: `remote:<url>` or `local:<abs path>`.
pub fn mapping_key(src: &str, resolved_abs: Option<&Path>) -> Option<String> {
    if is_remote(src) {
        Some(format!("remote:{src}"))
    } else {
        resolved_abs.map(|p| format!("local:{}", p.display()))
    }
}

/// Absolute form of a local link target without requiring the file to exist:
/// literal path cleanup and percent decoding only, no filesystem search.
///
/// When a source no longer resolves because a previous run already moved it,
/// this still produces the key the mapping entry was recorded under.
fn literal_local_abs(src: &str, doc_dir: &Path) -> PathBuf {
    let cleaned = src.trim().trim_matches(['"', '\'']).replace('\\', "/");
    let decoded = percent_decode_str(&cleaned).decode_utf8_lossy().into_owned();
    let p = PathBuf::from(decoded);
    if p.is_absolute() {
        p
    } else {
        doc_dir.join(p)
    }
}

/// SHA-256 of a file's contents as lowercase hex.
pub fn file_hash(path: &Path) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Reserve `base.ext` in `dir`, appending ` (N)` until the name collides
/// with neither the filesystem nor an earlier reservation in this plan.
pub fn reserve_unique_path(
    dir: &Path,
    base: &str,
    ext: &str,
    reserved: &mut HashSet<String>,
) -> PathBuf {
    let mut n = 0usize;
    loop {
        let name = if n == 0 {
            format!("{base}.{ext}")
        } else {
            format!("{base} ({n}).{ext}")
        };
        if !reserved.contains(&name) && !dir.join(&name).exists() {
            reserved.insert(name.clone());
            return dir.join(name);
        }
        n += 1;
    }
}

// ── Source resolution ────────────────────────────────────────────────────

/// Find the file a local link target refers to.
///
/// Tries the literal path (quotes stripped, backslashes normalised), a
/// percent-decoded variant, and finally a recursive search under the
/// document directory: exact file name first, then any image file whose
/// name starts with the wanted stem.
pub fn resolve_local_image(src: &str, doc_dir: &Path) -> Option<PathBuf> {
    let cleaned = src
        .trim()
        .trim_matches(['"', '\''])
        .replace('\\', "/");
    if cleaned.is_empty() {
        return None;
    }

    for candidate in [
        cleaned.clone(),
        percent_decode_str(&cleaned).decode_utf8_lossy().into_owned(),
    ] {
        let p = PathBuf::from(&candidate);
        let abs = if p.is_absolute() { p } else { doc_dir.join(p) };
        if abs.is_file() {
            return Some(abs);
        }
    }

    let decoded = percent_decode_str(&cleaned).decode_utf8_lossy().into_owned();
    let wanted = Path::new(&decoded).file_name()?.to_string_lossy().into_owned();
    let wanted_stem = Path::new(&wanted)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| wanted.clone());

    let mut stem_match: Option<PathBuf> = None;
    for entry in WalkDir::new(doc_dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.as_ref() == wanted {
            return Some(entry.into_path());
        }
        if stem_match.is_none()
            && name.starts_with(wanted_stem.as_str())
            && entry
                .path()
                .extension()
                .map(|e| is_image_ext(&e.to_string_lossy()))
                .unwrap_or(false)
        {
            stem_match = Some(entry.into_path());
        }
    }
    stem_match
}

/// Extension for a remote image, from the URL path when it carries one of
/// the known image extensions.
pub fn remote_ext_from_url(src: &str) -> Option<String> {
    let parsed = url::Url::parse(src).ok()?;
    let ext = Path::new(parsed.path())
        .extension()?
        .to_string_lossy()
        .to_ascii_lowercase();
    is_image_ext(&ext).then_some(ext)
}

/// Extension for a downloaded body, from its Content-Type.
pub fn ext_from_content_type(content_type: &str) -> Option<&'static str> {
    let ct = content_type.split(';').next()?.trim();
    match ct {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/bmp" => Some("bmp"),
        "image/svg+xml" => Some("svg"),
        "image/tiff" => Some("tiff"),
        "image/x-icon" | "image/vnd.microsoft.icon" => Some("ico"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}

// ── Plan construction ────────────────────────────────────────────────────

/// One reference handed to [`build_plan`] by the orchestrator.
#[derive(Debug, Clone)]
pub struct PlanEntry {
    pub index: usize,
    pub block_index: usize,
    pub image_index: usize,
    /// Link target exactly as written.
    pub src: String,
    /// Rendered stem, extension decided here.
    pub final_base: String,
}

/// Classify every entry and reserve its target name.
///
/// Unresolvable local sources become `error` items rather than being
/// dropped, so the executor halts on them and nothing silently disappears
/// from the document. Nothing touches the filesystem here beyond existence
/// checks for name reservation.
pub fn build_plan(
    document: &Path,
    title: &str,
    attach_dir: &Path,
    entries: &[PlanEntry],
    config: &NamerConfig,
) -> PlanFile {
    let doc_dir = document.parent().unwrap_or(Path::new("."));
    let mut reserved: HashSet<String> = HashSet::new();
    let mut items = Vec::with_capacity(entries.len());

    for e in entries {
        let (mut action, original_abs, ext) = if is_remote(&e.src) {
            if config.download_remote {
                let ext = remote_ext_from_url(&e.src).unwrap_or_else(|| "img".to_string());
                (PlanAction::Download, None, ext)
            } else {
                (PlanAction::Skip, None, "img".to_string())
            }
        } else {
            match resolve_local_image(&e.src, doc_dir) {
                Some(abs) => {
                    let ext = abs
                        .extension()
                        .map(|x| x.to_string_lossy().to_ascii_lowercase())
                        .filter(|x| !x.is_empty())
                        .unwrap_or_else(|| "img".to_string());
                    (PlanAction::Move, Some(abs), ext)
                }
                None => (PlanAction::Error, None, "img".to_string()),
            }
        };

        let candidate = attach_dir.join(format!("{}.{ext}", e.final_base));
        if action == PlanAction::Move && original_abs.as_deref() == Some(candidate.as_path()) {
            // Already named and in place; hold the name, nothing to move.
            reserved.insert(format!("{}.{ext}", e.final_base));
            action = PlanAction::Skip;
        }
        let target_abs = match action {
            PlanAction::Move | PlanAction::Download => {
                reserve_unique_path(attach_dir, &e.final_base, &ext, &mut reserved)
            }
            _ => candidate,
        };
        let target_rel = rel_from_dir(doc_dir, &target_abs);
        let key = match action {
            PlanAction::Move => mapping_key(&e.src, original_abs.as_deref()),
            PlanAction::Download => mapping_key(&e.src, None),
            _ => None,
        };

        items.push(PlanItem {
            index: e.index,
            block_index: e.block_index,
            image_index: e.image_index,
            original_src: e.src.clone(),
            original_abs,
            action,
            final_base: e.final_base.clone(),
            target_abs,
            target_rel,
            status: if action == PlanAction::Error {
                ItemStatus::Error
            } else {
                ItemStatus::Pending
            },
            mapping_key: key,
            error: (action == PlanAction::Error).then(|| "source_missing".to_string()),
            logs: Vec::new(),
            completed_at: None,
        });
    }

    PlanFile {
        document: document.to_path_buf(),
        title: title.to_string(),
        attach_dir: attach_dir.to_path_buf(),
        created_at: Utc::now(),
        items,
        completed: false,
        completed_at: None,
    }
}

/// Make a halted plan executable again.
///
/// Failed items go back to pending so the executor retries them, and items
/// whose source could not be found at build time get one more resolution
/// attempt against the current filesystem. Items that still do not resolve
/// stay in error state and halt the next run too.
pub fn reset_for_resume(plan: &mut PlanFile, doc_dir: &Path) {
    let attach_dir = plan.attach_dir.clone();
    for item in &mut plan.items {
        if item.status != ItemStatus::Error {
            continue;
        }
        if item.action == PlanAction::Error {
            let Some(abs) = resolve_local_image(&item.original_src, doc_dir) else {
                continue;
            };
            let ext = abs
                .extension()
                .map(|x| x.to_string_lossy().to_ascii_lowercase())
                .filter(|x| !x.is_empty())
                .unwrap_or_else(|| "img".to_string());
            item.target_abs = attach_dir.join(format!("{}.{ext}", item.final_base));
            item.target_rel = rel_from_dir(doc_dir, &item.target_abs);
            item.mapping_key = mapping_key(&item.original_src, Some(&abs));
            item.original_abs = Some(abs);
            item.action = PlanAction::Move;
        }
        item.status = ItemStatus::Pending;
        item.error = None;
    }
}

/// Slash-separated path of `target` relative to `base`, falling back to the
/// absolute form when `target` lives elsewhere.
pub fn rel_from_dir(base: &Path, target: &Path) -> String {
    match target.strip_prefix(base) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => target.display().to_string(),
    }
}

// ── Execution ────────────────────────────────────────────────────────────

/// Execute every pending item in order, persisting after each one.
///
/// Returns the number of items in `done` state. Halts with
/// [`NamerError::PlanHalted`] on the first failure or pre-existing error
/// item; the plan on disk always reflects exactly what happened.
pub fn execute_plan(
    plan: &mut PlanFile,
    mapping: &mut Mapping,
    config: &NamerConfig,
) -> Result<usize, NamerError> {
    let attach_dir = plan.attach_dir.clone();
    if plan.completed {
        debug!("plan already completed, nothing to do");
        return Ok(done_count(plan));
    }
    fs::create_dir_all(&attach_dir).map_err(|source| NamerError::StatePersistFailed {
        path: attach_dir.clone(),
        source,
    })?;

    let total = plan.items.len();
    for i in 0..plan.items.len() {
        if config.is_cancelled() {
            info!("cancelled before item {}", i + 1);
            save_plan(&attach_dir, plan)?;
            return Ok(done_count(plan));
        }
        let item = &plan.items[i];
        match item.status {
            ItemStatus::Done => continue,
            ItemStatus::Error => {
                let detail = item.error.clone().unwrap_or_else(|| "error".to_string());
                return Err(NamerError::PlanHalted {
                    index: item.index,
                    detail,
                });
            }
            ItemStatus::Pending => {}
        }
        config.observer.on_item_start(
            i + 1,
            total,
            action_tag(plan.items[i].action),
            &plan.items[i].target_rel,
        );

        let outcome = execute_item(&mut plan.items[i], mapping, config);
        match outcome {
            Ok(log) => {
                let item = &mut plan.items[i];
                item.status = ItemStatus::Done;
                item.completed_at = Some(Utc::now());
                item.logs.push(log.clone());
                save_plan(&attach_dir, plan)?;
                save_mapping(&attach_dir, mapping)?;
                config
                    .observer
                    .on_item_complete(i + 1, total, "done", &log);
            }
            Err(e) => {
                let detail = e.to_string();
                let item = &mut plan.items[i];
                item.status = ItemStatus::Error;
                item.error = Some(detail.clone());
                item.logs.push(detail.clone());
                let index = item.index;
                save_plan(&attach_dir, plan)?;
                save_mapping(&attach_dir, mapping)?;
                config
                    .observer
                    .on_item_complete(i + 1, total, "error", &detail);
                return Err(NamerError::PlanHalted { index, detail });
            }
        }
    }

    plan.completed = true;
    plan.completed_at = Some(Utc::now());
    save_plan(&attach_dir, plan)?;
    Ok(done_count(plan))
}

fn done_count(plan: &PlanFile) -> usize {
    plan.items
        .iter()
        .filter(|i| i.status == ItemStatus::Done)
        .count()
}

fn action_tag(action: PlanAction) -> &'static str {
    match action {
        PlanAction::Move => "move",
        PlanAction::Download => "download",
        PlanAction::Skip => "skip",
        PlanAction::Error => "error",
    }
}

fn execute_item(
    item: &mut PlanItem,
    mapping: &mut Mapping,
    config: &NamerConfig,
) -> Result<String, NamerError> {
    // Mapping short-circuit: a previous run already captured this asset.
    if let Some(key) = &item.mapping_key {
        if let Some(entry) = mapping.get(key) {
            let target = entry.target.clone();
            match file_hash(&target) {
                Ok(hash) if hash == entry.hash => {
                    if target != item.target_abs {
                        move_file(&target, &item.target_abs)?;
                        let rel = item.target_rel.clone();
                        let entry = mapping.get_mut(key).unwrap();
                        entry.target = item.target_abs.clone();
                        entry.target_rel = rel;
                    }
                    return Ok("reused".to_string());
                }
                _ => {
                    warn!("stale mapping entry dropped: {key}");
                    mapping.remove(key);
                }
            }
        }
    }

    match item.action {
        PlanAction::Skip => Ok("skipped".to_string()),
        PlanAction::Download => {
            if item.target_abs.exists() {
                return Ok("exists".to_string());
            }
            download_to(&item.original_src, &item.target_abs, config)?;
            record_mapping(item, mapping, true)?;
            Ok("downloaded".to_string())
        }
        PlanAction::Move => {
            let src = item
                .original_abs
                .clone()
                .ok_or_else(|| NamerError::Internal("move item without source".into()))?;
            if item.target_abs.exists() && !src.exists() {
                return Ok("exists".to_string());
            }
            move_file(&src, &item.target_abs)?;
            record_mapping(item, mapping, false)?;
            Ok("moved".to_string())
        }
        PlanAction::Error => unreachable!("error items halt before execution"),
    }
}

fn record_mapping(item: &PlanItem, mapping: &mut Mapping, remote: bool) -> Result<(), NamerError> {
    let Some(key) = &item.mapping_key else {
        return Ok(());
    };
    let hash = file_hash(&item.target_abs).map_err(|e| NamerError::Internal(format!(
        "hash {}: {e}",
        item.target_abs.display()
    )))?;
    let now = Some(Utc::now());
    let entry = if remote {
        MappingEntry {
            kind: "remote".to_string(),
            url: Some(item.original_src.clone()),
            original: None,
            original_rel: None,
            target: item.target_abs.clone(),
            target_rel: item.target_rel.clone(),
            hash,
            moved_at: None,
            downloaded_at: now,
        }
    } else {
        MappingEntry {
            kind: "local".to_string(),
            url: None,
            original: item.original_abs.clone(),
            original_rel: Some(item.original_src.clone()),
            target: item.target_abs.clone(),
            target_rel: item.target_rel.clone(),
            hash,
            moved_at: now,
            downloaded_at: None,
        }
    };
    mapping.insert(key.clone(), entry);
    Ok(())
}

/// Rename, falling back to copy-then-remove across filesystems.
pub fn move_file(from: &Path, to: &Path) -> Result<(), NamerError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| relocate_err(from, to, &e))?;
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to).map_err(|e| relocate_err(from, to, &e))?;
            fs::remove_file(from).map_err(|e| relocate_err(from, to, &e))?;
            Ok(())
        }
    }
}

fn relocate_err(from: &Path, to: &Path, e: &std::io::Error) -> NamerError {
    NamerError::RelocateFailed {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Fetch a remote image into `dest`.
///
/// Sends a browser-ish User-Agent and an image Accept header; some CDNs
/// refuse the default reqwest identity. The body is written to a temporary
/// sibling and renamed so a failed download never leaves a partial target.
pub fn download_to(src: &str, dest: &Path, config: &NamerConfig) -> Result<(), NamerError> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(config.download_timeout_secs))
        .build()
        .map_err(|e| NamerError::Internal(format!("http client: {e}")))?;
    let resp = client
        .get(src)
        .header(
            reqwest::header::USER_AGENT,
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
        )
        .header(
            reqwest::header::ACCEPT,
            "image/avif,image/webp,image/apng,image/*,*/*;q=0.8",
        )
        .send()
        .and_then(|r| r.error_for_status())
        .map_err(|e| {
            if e.is_timeout() {
                NamerError::DownloadTimeout {
                    url: src.to_string(),
                    secs: config.download_timeout_secs,
                }
            } else {
                NamerError::DownloadFailed {
                    url: src.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
    let bytes = resp.bytes().map_err(|e| NamerError::DownloadFailed {
        url: src.to_string(),
        reason: e.to_string(),
    })?;

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| relocate_err(Path::new(src), dest, &e))?;
    }
    let tmp = dest.with_extension("part");
    fs::write(&tmp, &bytes).map_err(|e| relocate_err(&tmp, dest, &e))?;
    fs::rename(&tmp, dest).map_err(|e| relocate_err(&tmp, dest, &e))?;
    Ok(())
}

// ── Single-asset relocation ──────────────────────────────────────────────

/// Outcome of [`ensure_attachment`] for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureAction {
    Moved,
    Copied,
    Downloaded,
    /// Reused an earlier relocation recorded in the mapping.
    Reused,
    /// Source already lives inside the attachment directory.
    Already,
    /// Remote source with downloads disabled.
    Skipped,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct EnsureOutcome {
    pub action: EnsureAction,
    /// Relative link target when the asset is (now) in the attachment dir.
    pub target_rel: Option<String>,
}

/// Bring one referenced asset into the attachment directory without
/// renaming it to an intent name. This is the bulk-relocation primitive
/// behind prefetch; `copy` keeps the original file in place.
pub fn ensure_attachment(
    src: &str,
    doc_dir: &Path,
    attach_dir: &Path,
    mapping: &mut Mapping,
    reserved: &mut HashSet<String>,
    copy: bool,
    config: &NamerConfig,
) -> EnsureOutcome {
    // Mapping short-circuit first, for remote and local alike. A local
    // source that no longer resolves is keyed by its literal path so an
    // earlier relocation is still found and either reused or dropped.
    let resolved = if is_remote(src) {
        None
    } else {
        resolve_local_image(src, doc_dir)
    };
    let key = mapping_key(src, resolved.as_deref())
        .unwrap_or_else(|| format!("local:{}", literal_local_abs(src, doc_dir).display()));
    if let Some(entry) = mapping.get(&key) {
        match file_hash(&entry.target) {
            Ok(hash) if hash == entry.hash => {
                return EnsureOutcome {
                    action: EnsureAction::Reused,
                    target_rel: Some(entry.target_rel.clone()),
                };
            }
            _ => {
                warn!("stale mapping entry dropped: {key}");
                mapping.remove(&key);
            }
        }
    }

    if is_remote(src) {
        if !config.download_remote {
            return EnsureOutcome {
                action: EnsureAction::Skipped,
                target_rel: None,
            };
        }
        let base = remote_basename(src);
        let ext = remote_ext_from_url(src).unwrap_or_else(|| "img".to_string());
        let target = reserve_unique_path(attach_dir, &base, &ext, reserved);
        return match download_to(src, &target, config) {
            Ok(()) => {
                let target_rel = rel_from_dir(doc_dir, &target);
                insert_remote_entry(mapping, src, &target, &target_rel);
                EnsureOutcome {
                    action: EnsureAction::Downloaded,
                    target_rel: Some(target_rel),
                }
            }
            Err(e) => EnsureOutcome {
                action: EnsureAction::Error(e.to_string()),
                target_rel: None,
            },
        };
    }

    let Some(abs) = resolved else {
        return EnsureOutcome {
            action: EnsureAction::Error("source_missing".to_string()),
            target_rel: None,
        };
    };
    if abs.starts_with(attach_dir) {
        return EnsureOutcome {
            action: EnsureAction::Already,
            target_rel: Some(rel_from_dir(doc_dir, &abs)),
        };
    }

    let base = abs
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let ext = abs
        .extension()
        .map(|x| x.to_string_lossy().to_ascii_lowercase())
        .filter(|x| !x.is_empty())
        .unwrap_or_else(|| "img".to_string());
    let target = reserve_unique_path(attach_dir, &base, &ext, reserved);

    let result = if copy {
        fs::copy(&abs, &target)
            .map(|_| ())
            .map_err(|e| relocate_err(&abs, &target, &e))
    } else {
        move_file(&abs, &target)
    };
    match result {
        Ok(()) => {
            let target_rel = rel_from_dir(doc_dir, &target);
            insert_local_entry(mapping, src, &abs, &target, &target_rel);
            EnsureOutcome {
                action: if copy {
                    EnsureAction::Copied
                } else {
                    EnsureAction::Moved
                },
                target_rel: Some(target_rel),
            }
        }
        Err(e) => EnsureOutcome {
            action: EnsureAction::Error(e.to_string()),
            target_rel: None,
        },
    }
}

fn remote_basename(src: &str) -> String {
    let stem = url::Url::parse(src)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
        })
        .unwrap_or_default();
    let stem = crate::pipeline::naming::sanitize_file_stem(&stem);
    if stem == "image" {
        "download".to_string()
    } else {
        stem
    }
}

fn insert_remote_entry(mapping: &mut Mapping, src: &str, target: &Path, target_rel: &str) {
    if let Ok(hash) = file_hash(target) {
        mapping.insert(
            format!("remote:{src}"),
            MappingEntry {
                kind: "remote".to_string(),
                url: Some(src.to_string()),
                original: None,
                original_rel: None,
                target: target.to_path_buf(),
                target_rel: target_rel.to_string(),
                hash,
                moved_at: None,
                downloaded_at: Some(Utc::now()),
            },
        );
    }
}

fn insert_local_entry(mapping: &mut Mapping, src: &str, abs: &Path, target: &Path, target_rel: &str) {
    if let Ok(hash) = file_hash(target) {
        mapping.insert(
            format!("local:{}", abs.display()),
            MappingEntry {
                kind: "local".to_string(),
                url: None,
                original: Some(abs.to_path_buf()),
                original_rel: Some(src.to_string()),
                target: target.to_path_buf(),
                target_rel: target_rel.to_string(),
                hash,
                moved_at: Some(Utc::now()),
                downloaded_at: None,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: usize, src: &str, base: &str) -> PlanEntry {
        PlanEntry {
            index,
            block_index: 1,
            image_index: index,
            src: src.to_string(),
            final_base: base.to_string(),
        }
    }

    #[test]
    fn build_classifies_remote_local_and_missing() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("doc.md");
        fs::write(&doc, "x").unwrap();
        fs::write(dir.path().join("pic.png"), b"png").unwrap();
        let attach = dir.path().join("attachments");

        let config = NamerConfig::default();
        let plan = build_plan(
            &doc,
            "Doc",
            &attach,
            &[
                entry(1, "pic.png", "doc_001_pic"),
                entry(2, "https://cdn.example/x.jpg", "doc_002_shot"),
                entry(3, "gone.png", "doc_003_gone"),
            ],
            &config,
        );
        assert_eq!(plan.items[0].action, PlanAction::Move);
        assert_eq!(plan.items[0].target_rel, "attachments/doc_001_pic.png");
        assert_eq!(plan.items[1].action, PlanAction::Download);
        assert!(plan.items[1].target_rel.ends_with("doc_002_shot.jpg"));
        assert_eq!(plan.items[2].action, PlanAction::Error);
        assert_eq!(plan.items[2].status, ItemStatus::Error);
        assert_eq!(plan.items[2].error.as_deref(), Some("source_missing"));
    }

    #[test]
    fn downloads_disabled_become_skip_items() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("doc.md");
        fs::write(&doc, "x").unwrap();
        let config = NamerConfig::builder().download_remote(false).build().unwrap();
        let plan = build_plan(
            &doc,
            "Doc",
            &dir.path().join("attachments"),
            &[entry(1, "https://cdn.example/x.png", "doc_001_x")],
            &config,
        );
        assert_eq!(plan.items[0].action, PlanAction::Skip);
    }

    #[test]
    fn execute_moves_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("doc.md");
        fs::write(&doc, "x").unwrap();
        let src = dir.path().join("pic.png");
        fs::write(&src, b"pixels").unwrap();
        let attach = dir.path().join("attachments");
        let config = NamerConfig::default();

        let mut plan = build_plan(&doc, "Doc", &attach, &[entry(1, "pic.png", "doc_001_pic")], &config);
        let mut mapping = Mapping::new();
        let done = execute_plan(&mut plan, &mut mapping, &config).unwrap();
        assert_eq!(done, 1);
        assert!(plan.completed);
        assert!(!src.exists());
        let target = attach.join("doc_001_pic.png");
        assert!(target.is_file());
        assert_eq!(mapping.len(), 1);
        let key = format!("local:{}", src.display());
        assert_eq!(mapping[&key].target, target);

        // Second run must perform zero file operations.
        let before = fs::metadata(&target).unwrap().modified().unwrap();
        let done2 = execute_plan(&mut plan, &mut mapping, &config).unwrap();
        assert_eq!(done2, 1);
        assert_eq!(fs::metadata(&target).unwrap().modified().unwrap(), before);

        // Persisted state round-trips.
        let loaded = load_plan(&attach).unwrap().unwrap();
        assert!(loaded.completed);
        assert_eq!(load_mapping(&attach).unwrap().len(), 1);
    }

    #[test]
    fn preexisting_error_item_halts_execution() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("doc.md");
        fs::write(&doc, "x").unwrap();
        let attach = dir.path().join("attachments");
        let config = NamerConfig::default();
        let mut plan = build_plan(&doc, "Doc", &attach, &[entry(1, "gone.png", "doc_001_gone")], &config);
        let mut mapping = Mapping::new();
        let err = execute_plan(&mut plan, &mut mapping, &config).unwrap_err();
        match err {
            NamerError::PlanHalted { index, detail } => {
                assert_eq!(index, 1);
                assert_eq!(detail, "source_missing");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn mapping_reuse_renames_existing_target() {
        let dir = tempdir().unwrap();
        let doc = dir.path().join("doc.md");
        fs::write(&doc, "x").unwrap();
        let attach = dir.path().join("attachments");
        fs::create_dir_all(&attach).unwrap();
        let old_target = attach.join("old_name.png");
        fs::write(&old_target, b"pixels").unwrap();
        let src = dir.path().join("pic.png");
        // Source no longer exists; only the mapping knows where the bytes went.
        let config = NamerConfig::default();
        let mut mapping = Mapping::new();
        mapping.insert(
            format!("local:{}", src.display()),
            MappingEntry {
                kind: "local".to_string(),
                url: None,
                original: Some(src.clone()),
                original_rel: Some("pic.png".to_string()),
                target: old_target.clone(),
                target_rel: "attachments/old_name.png".to_string(),
                hash: file_hash(&old_target).unwrap(),
                moved_at: Some(Utc::now()),
                downloaded_at: None,
            },
        );

        let mut plan = PlanFile {
            document: doc.clone(),
            title: "Doc".into(),
            attach_dir: attach.clone(),
            created_at: Utc::now(),
            items: vec![PlanItem {
                index: 1,
                block_index: 1,
                image_index: 1,
                original_src: "pic.png".into(),
                original_abs: Some(src.clone()),
                action: PlanAction::Move,
                final_base: "doc_001_pic".into(),
                target_abs: attach.join("doc_001_pic.png"),
                target_rel: "attachments/doc_001_pic.png".into(),
                status: ItemStatus::Pending,
                mapping_key: Some(format!("local:{}", src.display())),
                error: None,
                logs: Vec::new(),
                completed_at: None,
            }],
            completed: false,
            completed_at: None,
        };

        execute_plan(&mut plan, &mut mapping, &config).unwrap();
        assert!(!old_target.exists());
        assert!(attach.join("doc_001_pic.png").is_file());
        assert_eq!(plan.items[0].logs, vec!["reused".to_string()]);
        let entry = &mapping[&format!("local:{}", src.display())];
        assert_eq!(entry.target_rel, "attachments/doc_001_pic.png");
    }

    #[test]
    fn stale_mapping_entry_is_dropped() {
        let dir = tempdir().unwrap();
        let attach = dir.path().join("attachments");
        fs::create_dir_all(&attach).unwrap();
        let mut mapping = Mapping::new();
        mapping.insert(
            "local:/nowhere/pic.png".to_string(),
            MappingEntry {
                kind: "local".to_string(),
                url: None,
                original: Some(PathBuf::from("/nowhere/pic.png")),
                original_rel: None,
                target: attach.join("vanished.png"),
                target_rel: "attachments/vanished.png".to_string(),
                hash: "deadbeef".to_string(),
                moved_at: None,
                downloaded_at: None,
            },
        );
        let config = NamerConfig::default();
        let mut reserved = HashSet::new();
        let out = ensure_attachment(
            "/nowhere/pic.png",
            dir.path(),
            &attach,
            &mut mapping,
            &mut reserved,
            false,
            &config,
        );
        assert!(matches!(out.action, EnsureAction::Error(_)));
        assert!(mapping.is_empty());
    }

    #[test]
    fn moved_away_source_reuses_mapping_by_literal_path() {
        let dir = tempdir().unwrap();
        let attach = dir.path().join("attachments");
        fs::create_dir_all(&attach).unwrap();
        let target = attach.join("kept.png");
        fs::write(&target, b"pixels").unwrap();
        // The source was relocated by an earlier run and no longer exists.
        let src_abs = dir.path().join("gone.png");
        let mut mapping = Mapping::new();
        mapping.insert(
            format!("local:{}", src_abs.display()),
            MappingEntry {
                kind: "local".to_string(),
                url: None,
                original: Some(src_abs.clone()),
                original_rel: Some("gone.png".to_string()),
                target: target.clone(),
                target_rel: "attachments/kept.png".to_string(),
                hash: file_hash(&target).unwrap(),
                moved_at: Some(Utc::now()),
                downloaded_at: None,
            },
        );
        let config = NamerConfig::default();
        let mut reserved = HashSet::new();
        let out = ensure_attachment(
            "gone.png",
            dir.path(),
            &attach,
            &mut mapping,
            &mut reserved,
            false,
            &config,
        );
        assert_eq!(out.action, EnsureAction::Reused);
        assert_eq!(out.target_rel.as_deref(), Some("attachments/kept.png"));
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn ensure_already_inside_attach_dir_leaves_mapping_alone() {
        let dir = tempdir().unwrap();
        let attach = dir.path().join("attachments");
        fs::create_dir_all(&attach).unwrap();
        fs::write(attach.join("pic.png"), b"pixels").unwrap();
        let config = NamerConfig::default();
        let mut mapping = Mapping::new();
        let mut reserved = HashSet::new();
        let out = ensure_attachment(
            "attachments/pic.png",
            dir.path(),
            &attach,
            &mut mapping,
            &mut reserved,
            false,
            &config,
        );
        assert_eq!(out.action, EnsureAction::Already);
        assert_eq!(out.target_rel.as_deref(), Some("attachments/pic.png"));
        assert!(mapping.is_empty());
        assert!(attach.join("pic.png").is_file());
    }

    #[test]
    fn ensure_moves_local_file_and_records_mapping() {
        let dir = tempdir().unwrap();
        let attach = dir.path().join("attachments");
        let src = dir.path().join("shot.png");
        fs::write(&src, b"pixels").unwrap();
        let config = NamerConfig::default();
        let mut mapping = Mapping::new();
        let mut reserved = HashSet::new();
        let out = ensure_attachment(
            "shot.png",
            dir.path(),
            &attach,
            &mut mapping,
            &mut reserved,
            false,
            &config,
        );
        assert_eq!(out.action, EnsureAction::Moved);
        assert_eq!(out.target_rel.as_deref(), Some("attachments/shot.png"));
        assert!(!src.exists());
        assert_eq!(mapping.len(), 1);

        // Re-running reuses the mapping entry without touching files.
        fs::write(&src, b"different now").unwrap();
        let out2 = ensure_attachment(
            "shot.png",
            dir.path(),
            &attach,
            &mut mapping,
            &mut reserved,
            false,
            &config,
        );
        // The literal path resolves to the new file, which has no entry; but
        // the old entry stays keyed by the same path, so the hash check on
        // the target still matches and the relocation is reused.
        assert_eq!(out2.action, EnsureAction::Reused);
    }

    #[test]
    fn ensure_skips_remote_when_downloads_disabled() {
        let dir = tempdir().unwrap();
        let config = NamerConfig::builder().download_remote(false).build().unwrap();
        let mut mapping = Mapping::new();
        let mut reserved = HashSet::new();
        let out = ensure_attachment(
            "https://cdn.example/a.png",
            dir.path(),
            &dir.path().join("attachments"),
            &mut mapping,
            &mut reserved,
            false,
            &config,
        );
        assert_eq!(out.action, EnsureAction::Skipped);
    }

    #[test]
    fn reserve_appends_counter_on_collision() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("x.png"), b"a").unwrap();
        let mut reserved = HashSet::new();
        let p1 = reserve_unique_path(dir.path(), "x", "png", &mut reserved);
        assert_eq!(p1.file_name().unwrap(), "x (1).png");
        let p2 = reserve_unique_path(dir.path(), "x", "png", &mut reserved);
        assert_eq!(p2.file_name().unwrap(), "x (2).png");
    }

    #[test]
    fn resolve_handles_percent_encoding_and_search() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("assets");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("my shot.png"), b"a").unwrap();

        // Percent-encoded literal path.
        let found = resolve_local_image("assets/my%20shot.png", dir.path()).unwrap();
        assert!(found.ends_with("assets/my shot.png"));
        // Basename-only reference found by recursive search.
        let found = resolve_local_image("my shot.png", dir.path()).unwrap();
        assert!(found.ends_with("assets/my shot.png"));
        // Stem-prefix fallback.
        let found = resolve_local_image("my shot", dir.path()).unwrap();
        assert!(found.ends_with("assets/my shot.png"));
        assert!(resolve_local_image("nothing.png", dir.path()).is_none());
    }

    #[test]
    fn remote_ext_and_content_type_mapping() {
        assert_eq!(remote_ext_from_url("https://x/y/shot.PNG?v=1").as_deref(), Some("png"));
        assert_eq!(remote_ext_from_url("https://x/y/page"), None);
        assert_eq!(ext_from_content_type("image/jpeg; charset=binary"), Some("jpg"));
        assert_eq!(ext_from_content_type("text/html"), None);
    }

    #[test]
    fn corrupt_plan_file_is_reported() {
        let dir = tempdir().unwrap();
        fs::write(plan_path(dir.path()), "{not json").unwrap();
        let err = load_plan(dir.path()).unwrap_err();
        assert!(matches!(err, NamerError::StateCorrupt { .. }));
    }
}
