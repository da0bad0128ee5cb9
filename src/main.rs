//! # Folio CLI (`folio`)
//!
//! Command-line access to the content pipeline: image fitting, content
//! addressing, diffs, version history, rendering and draft recovery.
//!
//! ## Usage
//!
//! ```bash
//! folio --config ./config/folio.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `folio init` | Create the draft recovery database |
//! | `folio address <file>` | Print the content id of a file |
//! | `folio fit <image>` | Re-encode an image under a byte budget |
//! | `folio resize <image>` | Downscale an image into a bounding box |
//! | `folio diff <from> <to>` | Print the patch turning one file into another |
//! | `folio apply <patch> <file>` | Apply a patch and print the result |
//! | `folio history <doc.json>` | List versions or print one |
//! | `folio render <doc.json>` | Print the render tree as JSON |
//! | `folio cost <file>` | Estimate the publishing cost of a draft text |
//! | `folio draft ...` | Inspect and manage recovery records |
//!
//! Results go to stdout; logs go to stderr (`RUST_LOG`, default `warn`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use folio::config::{self, Config};
use folio::draft::RecoveryKey;
use folio::memory_service::InMemoryDocumentService;
use folio::models::Document;
use folio::patch::{self, Patch};
use folio::recovery::{DraftStore, SqliteDraftStore};
use folio::render::{RenderEngine, RenderOptions};
use folio::{content_id, draft, history, image_fit, migrate, tokens};

/// Folio: drafting, publishing and rendering of posts.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Missing files fall back to built-in defaults.
#[derive(Parser)]
#[command(name = "folio", version, about = "Folio: a post content pipeline")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/folio.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the draft recovery database. Safe to run repeatedly.
    Init,

    /// Print the content id of a file.
    Address { file: PathBuf },

    /// Re-encode an image so it fits in a byte budget.
    Fit {
        image: PathBuf,

        /// Budget in bytes; defaults to `limits.max_blob_bytes`.
        #[arg(long)]
        max_bytes: Option<usize>,

        #[arg(long)]
        out: PathBuf,
    },

    /// Downscale an image into a bounding box. Never upscales.
    Resize {
        image: PathBuf,

        #[arg(long)]
        max_width: u32,

        #[arg(long)]
        max_height: u32,

        #[arg(long)]
        out: PathBuf,
    },

    /// Print the patch (JSON) that turns FROM into TO.
    Diff { from: PathBuf, to: PathBuf },

    /// Apply a patch (JSON) to a file and print the result.
    Apply { patch: PathBuf, file: PathBuf },

    /// List the versions of a document, or print one of them.
    History {
        /// Document JSON file.
        document: PathBuf,

        #[arg(long)]
        version: Option<usize>,
    },

    /// Render a document to a JSON render tree.
    ///
    /// The file may hold one document or an array; the first entry is
    /// rendered and the rest are available for embedding.
    Render {
        document: PathBuf,

        #[arg(long)]
        version: Option<usize>,

        /// Feed context: collapse the text after the cut marker.
        #[arg(long)]
        summary: bool,
    },

    /// Estimate the publishing cost of a draft text.
    Cost {
        file: PathBuf,

        /// The post carries a poll.
        #[arg(long)]
        poll: bool,
    },

    /// Manage draft recovery records.
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },
}

#[derive(Subcommand)]
enum DraftAction {
    /// Save a file's text as the recovery record for KEY.
    Save { key: String, file: PathBuf },
    /// Print the recovery record for KEY.
    Show { key: String },
    /// Delete the recovery record for KEY.
    Discard { key: String },
    /// List keys with a recovery record.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_or_default(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!(
                "Draft store initialized at {}.",
                cfg.drafts.path.display()
            );
        }
        Commands::Address { file } => {
            let bytes = read_bytes(&file)?;
            println!("{}", content_id::address_of(&bytes));
        }
        Commands::Fit {
            image,
            max_bytes,
            out,
        } => {
            let bytes = read_bytes(&image)?;
            let budget = max_bytes.unwrap_or(cfg.limits.max_blob_bytes);
            let fitted = image_fit::fit(&bytes, budget)?;
            write_bytes(&out, &fitted.bytes)?;
            println!(
                "{}x{}, {} bytes, {} iterations",
                fitted.width,
                fitted.height,
                fitted.bytes.len(),
                fitted.iterations
            );
        }
        Commands::Resize {
            image,
            max_width,
            max_height,
            out,
        } => {
            let bytes = read_bytes(&image)?;
            let fitted = image_fit::resize_to_fit(&bytes, max_width, max_height)?;
            write_bytes(&out, &fitted.bytes)?;
            println!(
                "{}x{}, {} bytes",
                fitted.width,
                fitted.height,
                fitted.bytes.len()
            );
        }
        Commands::Diff { from, to } => {
            let patch = patch::diff(&read_text(&from)?, &read_text(&to)?);
            println!("{}", serde_json::to_string_pretty(&patch)?);
        }
        Commands::Apply { patch, file } => {
            let patch: Patch = serde_json::from_str(&read_text(&patch)?)
                .with_context(|| format!("Failed to parse patch: {}", patch.display()))?;
            let applied = patch::apply(&patch, &read_text(&file)?);
            if !applied.clean {
                eprintln!("warning: some hunks could not be located and were skipped");
            }
            print!("{}", applied.text);
        }
        Commands::History { document, version } => {
            let doc = load_documents(&document)?.remove(0);
            match version {
                Some(v) => {
                    let rebuilt = history::reconstruct(&doc, v);
                    if !rebuilt.clean {
                        eprintln!(
                            "warning: version {} is approximate ({} patches applied)",
                            v, rebuilt.applied
                        );
                    }
                    print!("{}", rebuilt.body);
                }
                None => {
                    for info in history::versions(&doc) {
                        println!(
                            "{:>4}  {}{}",
                            info.version,
                            format_ts(info.timestamp),
                            if info.latest { "  (latest)" } else { "" }
                        );
                    }
                }
            }
        }
        Commands::Render {
            document,
            version,
            summary,
        } => {
            let mut docs = load_documents(&document)?;
            let doc = docs.remove(0);
            let service = Arc::new(InMemoryDocumentService::new());
            for other in docs {
                service.insert_document(other);
            }
            let mut engine = RenderEngine::new(cfg.render.clone(), service.clone());
            let opts = RenderOptions {
                summary,
                ..RenderOptions::default()
            };
            let rendered = engine
                .render_resolved(
                    &doc,
                    version.unwrap_or(doc.latest_version()),
                    opts,
                    service.as_ref(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&rendered)?);
        }
        Commands::Cost { file, poll } => {
            let text = read_text(&file)?;
            let tags = tokens::tag_count(&text);
            let images = tokens::blob_references(&text).len();
            let cost = draft::estimate_cost(tags, images, poll, &cfg.costs);
            println!(
                "{} ({} tags, {} images{})",
                cost,
                tags,
                images,
                if poll { ", poll" } else { "" }
            );
        }
        Commands::Draft { action } => run_draft(&cfg, action).await?,
    }

    Ok(())
}

async fn run_draft(cfg: &Config, action: DraftAction) -> Result<()> {
    let store = SqliteDraftStore::open(cfg).await?;
    match action {
        DraftAction::Save { key, file } => {
            let key = RecoveryKey::new(key);
            store.save(&key, &read_text(&file)?).await?;
            println!("Saved {}.", key);
        }
        DraftAction::Show { key } => match store.load(&RecoveryKey::new(key.clone())).await? {
            Some(text) => print!("{}", text),
            None => bail!("no recovery record for {}", key),
        },
        DraftAction::Discard { key } => {
            store.clear(&RecoveryKey::new(key.clone())).await?;
            println!("Discarded {}.", key);
        }
        DraftAction::List => {
            for key in store.keys().await? {
                println!("{}", key);
            }
        }
    }
    store.close().await;
    Ok(())
}

/// Read one document or an array of documents; never returns an empty list.
fn load_documents(path: &Path) -> Result<Vec<Document>> {
    let raw = read_text(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse document file: {}", path.display()))?;
    let docs: Vec<Document> = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    if docs.is_empty() {
        bail!("{} contains no documents", path.display());
    }
    Ok(docs)
}

fn read_text(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
