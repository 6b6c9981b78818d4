mod config;
use clap::{Parser, Subcommand};
use config::Config;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use shardsync_core::{Allocation, AllocationBuilder, CollaboratorAction, Result};

#[derive(Parser)]
#[command(name = "shardsync")]
#[command(about = "Keep a local tree in sync with an erasure-coded blobber allocation")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "shardsync.yaml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare snapshot, local mirror and remote state
    Diff {
        /// Print the diff as JSON
        #[arg(long)]
        json: bool,
    },
    /// Write the agreed remote state to the snapshot file
    Snapshot,
    /// List one remote directory as the blobbers agree on it
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Report which blobbers lack the agreed copy of a file
    RepairCheck { path: String },
    /// Grant or revoke collaborator access on every blobber
    Collaborator {
        #[command(subcommand)]
        action: CollaboratorCommand,
    },
}

#[derive(Subcommand)]
enum CollaboratorCommand {
    Add { path: String, collaborator_id: String },
    Remove { path: String, collaborator_id: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shardsync=info,shardsync_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let cfg = match Config::from_file(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    let allocation = match AllocationBuilder::from_config(&cfg.allocation).build().await {
        Ok(allocation) => allocation,
        Err(e) => {
            tracing::error!("Failed to open allocation: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = run(cli.command, &cfg, &allocation).await;
    allocation.shutdown().await;

    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(2),
        Err(e) => {
            tracing::error!("Command failed: {}", e);
            std::process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when the command ran but did not fully succeed.
async fn run(command: Commands, cfg: &Config, allocation: &Allocation) -> Result<bool> {
    match command {
        Commands::Diff { json } => {
            let diffs = allocation
                .get_allocation_diff(
                    &cfg.sync.snapshot_path,
                    &cfg.sync.local_root,
                    &cfg.sync.local_filters,
                    &cfg.sync.remote_excludes,
                )
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&diffs)?);
            } else {
                for diff in &diffs {
                    println!("{:<9} {}", diff.op, diff.path);
                }
            }
            Ok(true)
        }
        Commands::Snapshot => {
            let cache = allocation
                .save_remote_snapshot(&cfg.sync.snapshot_path, &cfg.sync.remote_excludes)
                .await?;
            tracing::info!(
                "Saved {} entries to {:?}",
                cache.len(),
                cfg.sync.snapshot_path
            );
            Ok(true)
        }
        Commands::Ls { path } => {
            let consensus = allocation.list_dir(&path).await?;
            for child in &consensus.listing.children {
                let kind = if child.is_dir() { "d" } else { "f" };
                println!("{} {:>12} {}", kind, child.size, child.path);
            }
            for unresolved in &consensus.unresolved {
                let kind = if unresolved.is_dir() { "d?" } else { "f?" };
                println!("{} {:>11} {}", kind, "-", unresolved.path);
            }
            Ok(consensus.unresolved.is_empty())
        }
        Commands::RepairCheck { path } => {
            let check = allocation.repair_required(&path).await?;
            let blobbers = allocation.blobbers()?;
            for (blobber, found) in blobbers.iter().zip(&check.found) {
                println!("{} {}", if *found { "ok     " } else { "missing" }, blobber.id);
            }
            println!(
                "{}: {} of {} blobbers hold {}",
                if check.required { "repair required" } else { "healthy" },
                check.holders(),
                check.found.len(),
                check.file.hash
            );
            Ok(!check.required)
        }
        Commands::Collaborator { action } => {
            let (action, path, collaborator_id) = match action {
                CollaboratorCommand::Add {
                    path,
                    collaborator_id,
                } => (CollaboratorAction::Add, path, collaborator_id),
                CollaboratorCommand::Remove {
                    path,
                    collaborator_id,
                } => (CollaboratorAction::Remove, path, collaborator_id),
            };

            let outcomes = allocation
                .fan_out_outcomes(action, &path, &collaborator_id)
                .await?;
            for outcome in &outcomes {
                match &outcome.error {
                    None => println!("ok      {}", outcome.blobber_id),
                    Some(error) => println!("failed  {} {}", outcome.blobber_id, error),
                }
            }

            let succeeded = outcomes.iter().filter(|outcome| outcome.success).count();
            Ok(allocation
                .collaborator_policy()
                .is_met(succeeded, outcomes.len()))
        }
    }
}
