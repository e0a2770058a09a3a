use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tiersync_core::TiersyncConfig;
use tiersync_storage::{AdapterRegistry, LocalFsAdapter, Orchestrator, TransitionIntent};
use tracing_subscriber::{fmt, EnvFilter};

mod archive;
mod inventory;

use archive::{scan, ScanReport};
use inventory::Inventory;

#[derive(Parser, Debug)]
#[command(name = "tiersyncd")]
#[command(about = "TierSync hybrid archive tiering and sync daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file; without it the layered lookup is used
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan the archive and run the sweep and scheduler loops until Ctrl-C
    Run {
        /// Root directory of the local archive
        #[arg(long, env = "TIERSYNC_ARCHIVE_ROOT")]
        archive_root: PathBuf,

        /// Inventory JSON with targets, policies and tasks
        #[arg(long, env = "TIERSYNC_INVENTORY")]
        inventory: Option<PathBuf>,
    },

    /// Load and validate the configuration (and inventory, if given)
    CheckConfig {
        #[arg(long, env = "TIERSYNC_INVENTORY")]
        inventory: Option<PathBuf>,
    },

    /// Run one evaluator pass without side effects and print the intents as JSON
    Plan {
        #[arg(long, env = "TIERSYNC_ARCHIVE_ROOT")]
        archive_root: PathBuf,

        #[arg(long, env = "TIERSYNC_INVENTORY")]
        inventory: Option<PathBuf>,
    },
}

#[derive(Debug, Serialize)]
struct Plan {
    scan: ScanReport,
    intents: Vec<TransitionIntent>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            archive_root,
            inventory,
        } => {
            let (mut orchestrator, report) =
                bootstrap(config, &archive_root, inventory.as_deref()).await?;
            tracing::info!(
                archive_root = %archive_root.display(),
                assets = report.ingested,
                tasks = orchestrator.tasks().len(),
                "TierSync daemon starting"
            );

            orchestrator.start();
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for Ctrl-C")?;

            tracing::info!("Shutdown requested");
            orchestrator.shutdown();
            if let Some(saved) = orchestrator.save_state().await.context("failed to save state")? {
                tracing::info!(
                    assets = saved.assets,
                    manifests = saved.manifests,
                    history = saved.history,
                    "State saved"
                );
            }
            Ok(())
        }

        Commands::CheckConfig { inventory } => {
            if let Some(path) = inventory {
                Inventory::from_file(&path)?.validate()?;
                tracing::info!(inventory = %path.display(), "Inventory is valid");
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }

        Commands::Plan {
            archive_root,
            inventory,
        } => {
            let (orchestrator, scan) = bootstrap(config, &archive_root, inventory.as_deref()).await?;
            let plan = Plan {
                scan,
                intents: orchestrator.evaluator().evaluate(Utc::now()),
            };
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<TiersyncConfig> {
    let config = match path {
        Some(path) => TiersyncConfig::from_file(path)
            .with_context(|| format!("invalid configuration {}", path.display()))?,
        None => TiersyncConfig::load().context("invalid configuration")?,
    };
    Ok(config)
}

/// Build the orchestrator over the local archive, restore saved state and
/// register the inventory.
async fn bootstrap(
    config: TiersyncConfig,
    archive_root: &Path,
    inventory: Option<&Path>,
) -> Result<(Orchestrator, ScanReport)> {
    let local = LocalFsAdapter::new(archive_root)
        .await
        .with_context(|| format!("failed to open archive {}", archive_root.display()))?;
    let orchestrator = Orchestrator::new(
        config,
        Arc::new(AdapterRegistry::with_builtin_factories()),
        Arc::new(local.clone()),
    )?;
    orchestrator
        .load_state(Utc::now())
        .await
        .context("failed to load saved state")?;

    if let Some(path) = inventory {
        let applied = Inventory::from_file(path)?.apply(&orchestrator, Utc::now())?;
        tracing::info!(
            targets = applied.targets,
            policies = applied.policies,
            tasks = applied.tasks,
            "Inventory loaded"
        );
    }

    let report = scan(&orchestrator, &local).await?;
    Ok((orchestrator, report))
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).with_target(false).init();
}
