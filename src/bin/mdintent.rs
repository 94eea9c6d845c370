//! CLI binary for md-intent-namer.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `NamerConfig` and prints reports.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use md_intent_namer::{
    apply, prefetch, preview, restore, NamerConfig, PipelineObserver, Strategy,
};
use std::collections::{HashMap, HashSet};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI observer using indicatif ─────────────────────────────────────────────

/// Terminal observer: a progress bar over the references plus per-item log
/// lines. Batch confirmations suspend the bar and prompt on stdin.
struct CliObserver {
    bar: ProgressBar,
    assume_yes: bool,
}

impl CliObserver {
    fn new(assume_yes: bool) -> Arc<Self> {
        let bar = ProgressBar::new(0); // length set in on_scan_complete
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(spinner_style);
        bar.set_prefix("Scanning");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar, assume_yes })
    }

    fn activate_bar(&self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}/{len} images  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ");
        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Naming");
    }
}

impl PipelineObserver for CliObserver {
    fn on_scan_complete(&self, total_refs: usize) {
        self.activate_bar(total_refs);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Found {total_refs} image references"))
        ));
    }

    fn confirm_batch(&self, batch_num: usize, batch_size: usize, _batch_payload: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        self.bar.suspend(|| {
            eprint!(
                "{} Send batch {batch_num} ({batch_size} images) to the model? [Y/n] ",
                cyan("?")
            );
            io::stderr().flush().ok();
            let mut line = String::new();
            if io::stdin().lock().read_line(&mut line).is_err() {
                return false;
            }
            let answer = line.trim().to_lowercase();
            answer.is_empty() || answer == "y" || answer == "yes"
        })
    }

    fn on_reference_named(&self, _index: usize, _total: usize, name: &str) {
        self.bar.set_message(name.to_string());
        self.bar.inc(1);
    }

    fn on_model_fallback(&self, index: usize, total: usize, error: &str) {
        let msg = if error.chars().count() > 80 {
            format!("{}\u{2026}", error.chars().take(79).collect::<String>())
        } else {
            error.to_string()
        };
        self.bar.println(format!(
            "  {} Image {index:>3}/{total:<3}  {}",
            cyan("⚠"),
            dim(&format!("model failed, local name: {msg}")),
        ));
    }

    fn on_item_start(&self, _item_index: usize, _total: usize, action: &str, target: &str) {
        self.bar.set_message(format!("{action} {target}"));
    }

    fn on_item_complete(&self, item_index: usize, total: usize, status: &str, detail: &str) {
        let tick = match status {
            "error" => red("✗"),
            "skipped" | "missing" => cyan("⚠"),
            _ => green("✓"),
        };
        self.bar.println(format!(
            "  {tick} Item {item_index:>3}/{total:<3}  {status:<10}  {}",
            dim(detail),
        ));
    }

    fn on_run_complete(&self, total_refs: usize, done_count: usize) {
        self.bar.finish_and_clear();
        if done_count == 0 {
            eprintln!(
                "{} {} references named",
                green("✔"),
                bold(&total_refs.to_string())
            );
        } else if done_count == total_refs {
            eprintln!(
                "{} {} attachments in place",
                green("✔"),
                bold(&done_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} attachments in place",
                cyan("⚠"),
                bold(&done_count.to_string()),
                total_refs,
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Dry run: print suggested names, touch nothing
  mdintent note.md

  # Rename, relocate, and rewrite links (local heuristic, no API key)
  mdintent note.md --apply

  # Use a model for intent phrases
  export OPENAI_API_KEY=sk-...
  mdintent note.md --apply --use-model --model gpt-4o-mini

  # Send the images themselves, not just the prose
  mdintent note.md --apply --use-model --vision --model gpt-4o

  # Override one name, skip another
  mdintent note.md --apply --rename 3=license_dialog --skip 5

  # Custom naming template
  mdintent note.md --template "{title}_{block:02}_{intent:.40}"

  # Just gather the files, keep their names
  mdintent note.md --prefetch

  # Put everything back where it was
  mdintent note.md --restore-moved

  # Machine-readable report
  mdintent note.md --json > report.json

NAMING TEMPLATE PLACEHOLDERS:
  {title}        document title (front matter, first heading, or file stem)
  {intent}       intent phrase; {intent:.40} truncates to 40 chars
  {block}        logical block number; {block:02} zero-pads
  {idx}          position within the block
  {index}        position within the document
  {dup}          duplicate counter, empty for the first occurrence

STRATEGIES:
  intent (default)  weigh prose on both sides, follow explicit cues
  above / below     trust one side only
  between           bridge text between this image and the next
  hybrid            like intent, with document title context weighted in
  seq               purely sequential numbering, never calls a model

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY    API key for any OpenAI-compatible endpoint
  OPENAI_BASE_URL   Endpoint base, e.g. http://localhost:11434 for Ollama
  OPENAI_MODEL      Model ID when --model is not given

A halted --apply run leaves .image_plan.json in the attachment directory;
running --apply again resumes at the failed item. .image_moves.json records
every relocation so repeated runs reuse files and --restore-moved can undo
them."#;

/// Rename Markdown image attachments after what they show.
#[derive(Parser, Debug)]
#[command(
    name = "mdintent",
    version,
    about = "Rename Markdown image attachments after what they show",
    long_about = "Derive intent-revealing file names for the images referenced by a Markdown \
document, from the surrounding prose or an OpenAI-compatible chat model. Optionally relocate \
the files into a per-document attachment directory and rewrite the links.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Markdown document to process.
    document: PathBuf,

    /// Execute: relocate files and rewrite links (default is a dry run).
    #[arg(long)]
    apply: bool,

    /// Gather referenced files into the attachment directory without renaming.
    #[arg(long, conflicts_with_all = ["apply", "restore_moved"])]
    prefetch: bool,

    /// Move previously relocated attachments back and rewrite the links.
    #[arg(long, conflicts_with = "apply")]
    restore_moved: bool,

    /// Naming strategy: intent, above, below, between, hybrid, seq.
    #[arg(short, long, default_value = "intent")]
    strategy: String,

    /// Custom name template, e.g. "{title}_{block:02}_{intent:.40}".
    #[arg(short, long)]
    template: Option<String>,

    /// Attachment directory name, created next to the document.
    #[arg(long, default_value = "attachments")]
    attach_dir_name: String,

    /// Absolute attachment directory; overrides --attach-dir-name.
    #[arg(long)]
    attach_dir: Option<PathBuf>,

    /// Maximum file-stem length in characters.
    #[arg(long, default_value_t = 64)]
    max_name_len: usize,

    /// Minimum zero-padded width of sequence numbers.
    #[arg(long, default_value_t = 3)]
    seq_width: usize,

    /// Derive phrases with a chat model instead of the local heuristic.
    #[arg(long, env = "MDINTENT_USE_MODEL")]
    use_model: bool,

    /// Attach the image bytes to each request (implies --use-model).
    #[arg(long)]
    vision: bool,

    /// Model ID, e.g. gpt-4o-mini.
    #[arg(long, env = "OPENAI_MODEL")]
    model: Option<String>,

    /// API base URL for any OpenAI-compatible endpoint.
    #[arg(long, env = "OPENAI_BASE_URL")]
    api_base: Option<String>,

    /// API key.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// References per batched model request.
    #[arg(long, default_value_t = 5)]
    batch_size: usize,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, default_value_t = 0.0)]
    temperature: f32,

    /// Max model output tokens per request.
    #[arg(long, default_value_t = 512)]
    max_tokens: usize,

    /// Retries per model request.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Per-request model timeout in seconds.
    #[arg(long, default_value_t = 60)]
    api_timeout: u64,

    /// Minimum milliseconds between model requests.
    #[arg(long, default_value_t = 0)]
    rate_limit_ms: u64,

    /// Leave remote images where they are.
    #[arg(long)]
    no_download: bool,

    /// Download timeout per remote image in seconds.
    #[arg(long, default_value_t = 120)]
    download_timeout: u64,

    /// Skip writing the .bak backup before rewriting the document.
    #[arg(long)]
    no_backup: bool,

    /// Override a suggested name: INDEX=STEM, repeatable.
    #[arg(long, value_name = "INDEX=STEM")]
    rename: Vec<String>,

    /// Leave a reference out of the plan: INDEX, repeatable.
    #[arg(long, value_name = "INDEX")]
    skip: Vec<usize>,

    /// Answer yes to every batch confirmation.
    #[arg(short = 'y', long)]
    yes: bool,

    /// Print the full report as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Also write the full report as JSON to this file.
    #[arg(long)]
    save_report: Option<PathBuf>,

    /// Disable the progress bar.
    #[arg(long)]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long)]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Suppress INFO-level library logs when the progress bar is active;
    // the bar provides all the feedback that matters to the user.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli, show_progress)?;

    // ── Run ──────────────────────────────────────────────────────────────
    if cli.restore_moved {
        let stats = restore(&cli.document, &config).context("Restore failed")?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else if !cli.quiet {
            eprintln!(
                "{} {} restored, {} links updated{}",
                green("✔"),
                bold(&stats.restored.to_string()),
                stats.updated,
                if stats.errors + stats.missing > 0 {
                    red(&format!(
                        "  ({} errors, {} missing)",
                        stats.errors, stats.missing
                    ))
                } else {
                    String::new()
                },
            );
        }
        return Ok(());
    }

    if cli.prefetch {
        let stats = prefetch(&cli.document, &config).context("Prefetch failed")?;
        if let Some(ref path) = cli.save_report {
            std::fs::write(path, serde_json::to_string_pretty(&stats)?)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
        }
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        } else if !cli.quiet {
            eprintln!(
                "{} {}/{} gathered  {}",
                if stats.errors == 0 { green("✔") } else { cyan("⚠") },
                bold(&(stats.downloaded + stats.moved + stats.copied + stats.reused).to_string()),
                stats.total,
                dim(&format!(
                    "{} downloaded, {} moved, {} reused, {} skipped, {} missing, {} errors",
                    stats.downloaded,
                    stats.moved,
                    stats.reused,
                    stats.skipped,
                    stats.missing,
                    stats.errors
                )),
            );
        }
        return Ok(());
    }

    if cli.apply {
        let overrides = parse_renames(&cli.rename)?;
        let skips: HashSet<usize> = cli.skip.iter().copied().collect();
        let report =
            apply(&cli.document, &config, &overrides, &skips).context("Apply failed")?;
        if let Some(ref path) = cli.save_report {
            std::fs::write(path, serde_json::to_string_pretty(&report)?)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
        }
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else if !cli.quiet {
            eprintln!(
                "{}  {}/{} items done  document {}  →  {}",
                if report.errors == 0 && report.halted.is_none() {
                    green("✔")
                } else {
                    cyan("⚠")
                },
                report.done,
                report.planned,
                report.rewrite,
                bold(&report.attach_dir.display().to_string()),
            );
            if let Some(ref reason) = report.halted {
                eprintln!(
                    "   {} halted at {}; fix the cause and re-run --apply to resume",
                    red("✗"),
                    reason
                );
            }
        }
        return Ok(());
    }

    // Preview (default).
    let report = preview(&cli.document, &config).context("Preview failed")?;
    if let Some(ref path) = cli.save_report {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
    }
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        writeln!(out, "{}  {}", bold(&report.title), dim(&format!("({} images)", report.count)))?;
        for item in &report.items {
            writeln!(
                out,
                "  {:>3}  {}  {}",
                item.index,
                bold(&item.suggested_name),
                dim(&format!("{}  [{}]", item.src, item.phrase_source)),
            )?;
        }
        if report.cancelled {
            writeln!(out, "  {} run cancelled before completion", cyan("⚠"))?;
        }
    }

    Ok(())
}

/// Map CLI args to `NamerConfig`.
fn build_config(cli: &Cli, show_progress: bool) -> Result<NamerConfig> {
    let strategy: Strategy = cli.strategy.parse().context("Invalid --strategy")?;

    let mut builder = NamerConfig::builder()
        .strategy(strategy)
        .attach_dir_name(&cli.attach_dir_name)
        .max_name_len(cli.max_name_len)
        .seq_width(cli.seq_width)
        .chunk_size(cli.batch_size)
        .use_model(cli.use_model || cli.vision)
        .vision(cli.vision)
        .temperature(cli.temperature)
        .max_tokens(cli.max_tokens)
        .max_retries(cli.max_retries)
        .api_timeout_secs(cli.api_timeout)
        .rate_limit_ms(cli.rate_limit_ms)
        .download_remote(!cli.no_download)
        .download_timeout_secs(cli.download_timeout)
        .backup(!cli.no_backup);

    if let Some(ref t) = cli.template {
        builder = builder.template(t);
    }
    if let Some(ref dir) = cli.attach_dir {
        builder = builder.attach_dir(dir);
    }
    if let Some(ref base) = cli.api_base {
        builder = builder.api_base(base);
    }
    if let Some(ref key) = cli.api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if show_progress {
        builder = builder.observer(CliObserver::new(cli.yes || cli.quiet));
    }

    builder.build().context("Invalid configuration")
}

/// Parse repeated `--rename INDEX=STEM` flags.
fn parse_renames(renames: &[String]) -> Result<HashMap<usize, String>> {
    let mut map = HashMap::new();
    for spec in renames {
        let (idx, stem) = spec
            .split_once('=')
            .with_context(|| format!("Invalid --rename '{spec}', expected INDEX=STEM"))?;
        let idx: usize = idx
            .trim()
            .parse()
            .with_context(|| format!("Invalid index in --rename '{spec}'"))?;
        if stem.trim().is_empty() {
            anyhow::bail!("Empty name in --rename '{spec}'");
        }
        map.insert(idx, stem.trim().to_string());
    }
    Ok(map)
}
