//! Program enricher CLI
//!
//! Local entry point for discovery ingestion and reconciliation runs.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use enricher::{
    error::{AppError, Result},
    models::{Config, Identity, Stage},
    pipeline::{self, Engine},
    services::FileDiscovery,
};

/// Enricher - University Data-Science Program Reconciler
#[derive(Parser, Debug)]
#[command(
    name = "enricher",
    version,
    about = "Discover, extract and summarize university data-science program pages"
)]
struct Cli {
    /// Path to storage directory (records, default config)
    #[arg(short, long, default_value = "storage", global = true)]
    storage_dir: PathBuf,

    /// Path to config file (default: {storage_dir}/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a single (university, url) pair
    Observe {
        university: String,
        url: String,
    },

    /// Observe every discovery in a JSON or JSON Lines file
    Ingest { file: PathBuf },

    /// Advance one record by a single stage
    Advance { identity: String },

    /// Ingest (optional) then reconcile every pending record
    Run {
        /// Discovery file to ingest before reconciling
        #[arg(long)]
        discovery: Option<PathBuf>,
    },

    /// Reset failed records to the stage they failed from
    Redrive {
        /// Identity of the record to re-drive
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        identity: Option<String>,

        /// Re-drive every failed record
        #[arg(long)]
        all: bool,
    },

    /// Drop extracted content so the page is fetched again
    Reextract { identity: String },

    /// Show record counts per stage
    Status,

    /// Validate configuration
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load(path),
        None => Ok(Config::load_or_default(cli.storage_dir.join("config.toml"))),
    }
}

/// Set the engine's cancel flag on Ctrl-C.
fn cancel_on_ctrl_c(engine: &Engine) {
    let flag = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted, finishing in-flight transitions...");
            flag.store(true, Ordering::SeqCst);
        }
    });
}

async fn ingest_file(engine: &Engine, file: &Path) -> Result<()> {
    if !file.exists() {
        log::error!("Discovery file not found at {}", file.display());
        return Err(AppError::config("Discovery file not found"));
    }
    let mut source = FileDiscovery::new(file);
    let report = engine.ingest(&mut source).await?;
    report.log_summary();
    Ok(())
}

/// Main entry point for the CLI application.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    log::debug!("Storage directory: {}", cli.storage_dir.display());

    if let Command::Validate = cli.command {
        log::info!("Validating configuration...");
        if let Err(e) = config.validate() {
            log::error!("Config validation failed: {}", e);
            return Err(e);
        }
        log::info!("✓ Config OK");
        return Ok(());
    }

    if let Command::Status = cli.command {
        let store = pipeline::open_store(&config, &cli.storage_dir)?;
        let status = pipeline::StatusReport::from_records(&store.list().await?);
        log::info!("Records: {}", status.total);
        for (stage, count) in &status.by_stage {
            log::info!("    {:<20} {}", stage.as_str(), count);
        }
        for failed in &status.failed {
            match &failed.last_error {
                Some(error) => log::warn!("    FAILED {}: {}", failed.identity, error),
                None => log::warn!("    FAILED {}", failed.identity),
            }
        }
        return Ok(());
    }

    let engine = pipeline::build_engine(&config, &cli.storage_dir)?;

    match cli.command {
        Command::Observe { university, url } => {
            let identity = engine.observe(&university, &url).await?;
            log::info!("Observed {}", identity);
        }

        Command::Ingest { file } => {
            cancel_on_ctrl_c(&engine);
            ingest_file(&engine, &file).await?;
        }

        Command::Advance { identity } => {
            let identity = Identity::from_raw(identity);
            let stage = engine.advance(&identity).await?;
            log::info!("{} is now {}", identity, stage);
        }

        Command::Run { discovery } => {
            cancel_on_ctrl_c(&engine);
            if let Some(file) = discovery {
                log::info!("Step 1/2: Ingesting discoveries...");
                ingest_file(&engine, &file).await?;
                log::info!("Step 2/2: Reconciling records...");
            }
            if !engine.is_cancelled() {
                let report = engine.reconcile_all().await?;
                report.log_summary();
            }
        }

        Command::Redrive { identity, all } => {
            if all {
                let count = engine.redrive_failed().await?;
                log::info!("Re-drove {} failed record(s)", count);
            } else if let Some(identity) = identity {
                let identity = Identity::from_raw(identity);
                let stage = engine.redrive(&identity).await?;
                if stage == Stage::Failed {
                    log::warn!("{} is still failed", identity);
                } else {
                    log::info!("{} reset to {}", identity, stage);
                }
            }
        }

        Command::Reextract { identity } => {
            let identity = Identity::from_raw(identity);
            let stage = engine.reextract(&identity).await?;
            log::info!("{} is now {}", identity, stage);
        }

        Command::Status | Command::Validate => {}
    }

    log::info!("Done!");

    Ok(())
}
