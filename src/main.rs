//! # docsync CLI
//!
//! ## Usage
//!
//! ```bash
//! docsync --config ./config/docsync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docsync init` | Create (or update) the index schema |
//! | `docsync sources` | Show the configured source and check that it can be listed |
//! | `docsync rules <ext>` | Print the transform chain resolved for an extension |
//! | `docsync sync` | Run one synchronization pass |
//! | `docsync stats` | Indexed documents per scope |
//!
//! Exit status is 0 when a sync reaches `done` (even with per-document
//! failures) and 1 when it fails or the configuration is invalid.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use docsync::config::{self, Config, IndexBackend};
use docsync::index_azure::AzureSearchIndex;
use docsync::index_sqlite::SqliteIndex;
use docsync::orchestrator::{run_from_config, SyncOptions, SyncSummary};
use docsync::progress::ProgressMode;
use docsync::secrets::{build_secret_provider, SecretProvider};
use docsync::{logging, sources, stats};

/// docsync: keep a search index synchronized with a document source.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docsync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docsync",
    about = "Keep a search index synchronized with a remote document source",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/docsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the index schema. Safe to run repeatedly.
    Init,

    /// Show the configured source and whether it can be listed.
    Sources,

    /// Print the transform rules that apply to an extension.
    Rules {
        /// File extension, with or without the leading dot.
        extension: String,
    },

    /// Run one synchronization pass: list, transform, index, purge.
    Sync {
        /// Re-process every document, ignoring stored fingerprints.
        #[arg(long)]
        full: bool,

        /// List and resolve rules without fetching, writing or purging.
        #[arg(long)]
        dry_run: bool,

        /// Skip purging index entries whose document is gone.
        #[arg(long)]
        no_purge: bool,

        /// Progress output on stderr: `human`, `json` or `off`
        /// (default: human when stderr is a terminal).
        #[arg(long)]
        progress: Option<String>,

        /// Write the run summary as JSON to this file
        /// (default: `sync.summary_path`).
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Show indexed document counts.
    Stats,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let cfg = match config::load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(1);
        }
    };
    logging::init(&cfg.logging);
    let secrets = build_secret_provider(&cfg.secrets);

    let result = match cli.command {
        Commands::Init => init(&cfg, secrets.as_ref()).await.map(|_| true),
        Commands::Sources => sources::list_sources(&cfg, secrets.as_ref()).await,
        Commands::Rules { extension } => {
            sources::print_rules(&cfg, &extension);
            Ok(true)
        }
        Commands::Sync {
            full,
            dry_run,
            no_purge,
            progress,
            summary,
        } => {
            let mut options = SyncOptions::from_config(&cfg);
            options.full |= full;
            options.dry_run = dry_run;
            options.no_purge = no_purge;
            let summary_path = summary.or_else(|| cfg.sync.summary_path.clone());
            sync(
                &cfg,
                secrets.as_ref(),
                options,
                progress.as_deref(),
                summary_path.as_deref(),
            )
            .await
        }
        Commands::Stats => stats::run_stats(&cfg, secrets.as_ref()).await.map(|_| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

async fn init(cfg: &Config, secrets: &dyn SecretProvider) -> anyhow::Result<()> {
    match cfg.index.backend {
        IndexBackend::Sqlite => {
            let index = SqliteIndex::open(&cfg.index.path, cfg.chunking.max_tokens).await?;
            index.close().await;
            println!("Index initialized at {}.", cfg.index.path.display());
        }
        IndexBackend::Azure => {
            let key = secrets.get_secret(&cfg.index.api_key_secret).await?;
            AzureSearchIndex::new(&cfg.index, key)?.ensure_index().await?;
            println!("Index '{}' is up to date.", cfg.index.name);
        }
    }
    Ok(())
}

async fn sync(
    cfg: &Config,
    secrets: &dyn SecretProvider,
    options: SyncOptions,
    progress: Option<&str>,
    summary_path: Option<&Path>,
) -> anyhow::Result<bool> {
    let mode = match progress {
        Some("json") => ProgressMode::Json,
        Some("human") => ProgressMode::Human,
        Some("off") => ProgressMode::Off,
        Some(other) => anyhow::bail!("unknown progress mode '{}': use human, json or off", other),
        None => ProgressMode::default_for_tty(),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight documents");
            on_signal.cancel();
        }
    });

    let dry_run = options.dry_run;
    let summary = run_from_config(cfg, secrets, options, Arc::from(mode.reporter()), cancel).await?;
    print_summary(&summary, dry_run);
    if let Some(path) = summary_path {
        summary.write_json(path).await?;
    }
    Ok(summary.is_success())
}

fn print_summary(summary: &SyncSummary, dry_run: bool) {
    println!(
        "sync {}{}",
        summary.scope,
        if dry_run { " (dry-run)" } else { "" }
    );
    println!("  state:               {}", summary.state);
    if let Some(ref err) = summary.error {
        println!("  error:               {}", err);
    }
    println!("  listed:              {}", summary.listed);
    if summary.excluded > 0 {
        println!("  excluded:            {}", summary.excluded);
    }
    if dry_run {
        println!("  would process:       {}", summary.planned);
        println!("  unchanged:           {}", summary.skipped_unchanged);
        println!("  would purge:         {}", summary.stale);
    } else {
        println!(
            "  succeeded:           {} ({} unchanged)",
            summary.succeeded, summary.skipped_unchanged
        );
        println!("  failed:              {}", summary.failed);
        println!("  relocated:           {}", summary.relocated);
        println!("  relocation failures: {}", summary.relocation_failures.len());
        println!(
            "  purged:              {} ({} failed)",
            summary.purged, summary.purge_failed
        );
    }
    println!("  duration:            {:.2}s", summary.duration.as_secs_f64());

    for f in &summary.failed_documents {
        println!("  ! {}: {}", f.name, f.error);
    }
    for f in &summary.relocation_failures {
        println!("  ! relocation {}: {}", f.name, f.error);
    }
    for f in &summary.purge_failures {
        println!("  ! purge {}: {}", f.name, f.error);
    }
}
