//! # Vault Sync CLI (`vsync`)
//!
//! The `vsync` binary drives incremental synchronization of a document vault
//! into a Chroma collection, and inspects the state it leaves behind.
//!
//! ## Usage
//!
//! ```bash
//! vsync --config ./config/vsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vsync sync` | Push vault changes; Ctrl-C pauses and the next run resumes |
//! | `vsync verify` | Compare the recorded state with the remote collection |
//! | `vsync status` | Show recorded documents, failures, verification and session |
//! | `vsync stop` | Stop and clear a persisted session |
//! | `vsync check` | Test the Chroma connection |
//! | `vsync chunk <file>` | Print the chunk plan of a single file |

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vault_sync::chunk::{chunk_document, needs_chunking};
use vault_sync::config::{self, Config};
use vault_sync::delta::{document_id, DeltaEngine};
use vault_sync::executor::IndexExecutor;
use vault_sync::extract::ProcessorRegistry;
use vault_sync::index::chroma::ChromaIndex;
use vault_sync::index::IndexBackend;
use vault_sync::ingest::{SyncOptions, SyncPipeline, SyncStatus};
use vault_sync::models::{MimeClass, SourceDocument};
use vault_sync::progress::ProgressMode;
use vault_sync::session::{SessionManager, SyncController};
use vault_sync::source::DocumentEntry;
use vault_sync::status::collect_status;
use vault_sync::store::StateStore;
use vault_sync::verify::{run_verification, VerificationBackend};

/// Vault Sync CLI: incremental, resumable vault synchronization into Chroma.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "vsync",
    about = "Vault Sync: incremental, resumable synchronization of a document vault into Chroma",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vsync.toml")]
    config: PathBuf,

    /// Verbose logging (debug level). `RUST_LOG` takes precedence.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push vault changes to the collection.
    ///
    /// Scans the vault, diffs it against the recorded state and applies the
    /// delta in batches. Documents that failed in earlier runs are retried.
    /// Ctrl-C pauses the session; the next `sync` resumes it.
    Sync {
        /// Re-send every document regardless of its recorded hash.
        #[arg(long)]
        full: bool,

        /// Show the planned actions without sending or recording anything.
        #[arg(long)]
        dry_run: bool,

        /// Actions per batch (overrides `sync.batch_size`).
        #[arg(long)]
        batch_size: Option<usize>,

        /// Progress output: `off`, `human` or `json` (stderr).
        /// Defaults to `human` on a terminal, otherwise `off`.
        #[arg(long)]
        progress: Option<String>,

        /// Print the final report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Verify the recorded state against the remote collection.
    Verify {
        #[arg(long)]
        json: bool,
    },

    /// Show the recorded state and any persisted session.
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Stop a persisted session and clear it after the grace period.
    Stop,

    /// Test the connection: heartbeat plus collection lookup.
    Check,

    /// Print how a single file would be chunked.
    Chunk {
        /// File to chunk.
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "warn" })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Sync {
            full,
            dry_run,
            batch_size,
            progress,
            json,
        } => {
            let mode = match progress.as_deref() {
                Some(value) => ProgressMode::parse(value)
                    .with_context(|| format!("Unknown progress mode: {}", value))?,
                None => ProgressMode::default_for_tty(),
            };
            let options = SyncOptions {
                full,
                dry_run,
                batch_size,
            };
            run_sync(&cfg, &options, mode, json).await?;
        }
        Commands::Verify { json } => {
            let store = StateStore::new(&cfg.state.dir);
            let index = ChromaIndex::new(&cfg.chroma)?;
            let report = run_verification(&index, &store).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                let verdict = if report.is_consistent() {
                    "verified"
                } else {
                    "inconsistent"
                };
                println!("verify {} ({})", index.collection_name(), verdict);
                println!("  local documents: {}", report.local_count);
                println!("  remote documents: {}", report.remote_count);
                println!("  collection records: {}", report.collection_count);
                for path in &report.missing_remotely {
                    println!("  missing remotely: {}", path);
                }
                for name in &report.extra_remotely {
                    println!("  extra remotely: {}", name);
                }
            }
        }
        Commands::Status { json } => {
            let store = StateStore::new(&cfg.state.dir);
            let report = collect_status(&store, cfg.sync.max_retries);
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
        }
        Commands::Stop => {
            let store = StateStore::new(&cfg.state.dir);
            let controller = SyncController::new(
                SessionManager::load(store.session_path()),
                cfg.sync.stop_grace(),
            );
            if controller.stop().await {
                println!("Sync session stopped and cleared.");
            } else {
                println!("No active sync session.");
            }
        }
        Commands::Check => {
            let index = ChromaIndex::new(&cfg.chroma)?;
            index.heartbeat().await?;
            index.ensure_ready().await?;
            let count = index.count().await?;
            println!("check {}", cfg.chroma.endpoint);
            println!("  collection: {}", index.collection_name());
            println!("  records: {}", count);
            println!("ok");
        }
        Commands::Chunk { file } => {
            print_chunks(&cfg, &file)?;
        }
    }

    Ok(())
}

async fn run_sync(cfg: &Config, options: &SyncOptions, mode: ProgressMode, json: bool) -> Result<()> {
    let store = StateStore::new(&cfg.state.dir);
    let engine = DeltaEngine::from_config(&cfg.vault)?;
    let index = Arc::new(ChromaIndex::from_config(cfg)?);
    let backend: Arc<dyn IndexBackend> = index.clone();
    let verifier: Arc<dyn VerificationBackend> = index;

    let controller = SyncController::new(
        SessionManager::load(store.session_path()),
        cfg.sync.stop_grace(),
    );
    let on_interrupt = controller.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() && on_interrupt.pause().await {
            eprintln!("sync  pausing after the current action...");
        }
    });

    let mut pipeline = SyncPipeline {
        engine,
        executor: Arc::new(IndexExecutor::new(backend, cfg.chunking)),
        verifier: Some(verifier),
        store,
        settings: cfg.sync.clone(),
        progress: mode.reporter(),
    };
    let report = pipeline.run(&controller, options).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.print_summary();
    }
    if report.status == SyncStatus::PartialFailure {
        bail!(
            "sync finished with {} failed document(s); they will be retried on the next run",
            report.failed.len()
        );
    }
    Ok(())
}

fn print_chunks(cfg: &Config, file: &Path) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let meta = std::fs::metadata(file)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let entry = DocumentEntry {
        path: file.to_string_lossy().replace('\\', "/"),
        mtime,
        size: meta.len(),
    };

    let processed = ProcessorRegistry::default().process(&entry, &bytes);
    let doc = SourceDocument {
        id: document_id(&entry.path),
        mime: MimeClass::from_extension(&entry.extension()),
        content: processed.content,
        updated_at: mtime,
    };

    println!("chunk {}", entry.path);
    println!("  id: {}", doc.id);
    println!("  length: {} bytes", doc.content.len());
    if !needs_chunking(&doc.content, &cfg.chunking) {
        println!("  fits in a single record (max_len {})", cfg.chunking.max_len);
        return Ok(());
    }

    for chunk in chunk_document(&doc, &cfg.chunking) {
        let m = &chunk.metadata;
        let overlap = match (m.overlap_with_prev, m.overlap_with_next) {
            (true, true) => "prev+next",
            (true, false) => "prev",
            (false, true) => "next",
            (false, false) => "none",
        };
        println!(
            "  [{}] {}..{}  {} bytes  overlap={}  {}",
            m.sequence_order,
            chunk.start,
            chunk.end,
            chunk.content.len(),
            overlap,
            m.heading_breadcrumbs.join(" > ")
        );
    }
    Ok(())
}
