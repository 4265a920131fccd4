//! repsync CLI
//!
//! Command-line tools for repository replicas.
//!
//! # Commands
//!
//! - `init` - Initialize a repository in a directory
//! - `scan` - Reconcile the worktree with the metadata store
//! - `status` - Show repository state and peer watermarks
//! - `sync` - Run a sync session against a peer URL

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// repsync command-line repository tools.
#[derive(Parser)]
#[command(name = "repsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the repository worktree (defaults to the current directory)
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a repository in the target directory
    Init,

    /// Reconcile the worktree with the metadata store
    Scan,

    /// Show repository state and peer watermarks
    Status,

    /// Run a sync session against a peer
    Sync {
        /// Peer URL, e.g. file:///var/repos/other
        url: String,

        /// Subtree of the peer to sync with
        #[arg(long)]
        remote_prefix: Option<String>,

        /// Local subtree to sync into
        #[arg(long)]
        local_prefix: Option<String>,

        /// Skip the pre-sync filesystem scans
        #[arg(long)]
        no_local_sync: bool,

        /// Maximum attempts on transient transport failures
        #[arg(long, default_value = "3")]
        retries: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let root = cli.path.unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Init => commands::init(&root)?,
        Commands::Scan => commands::scan(&root)?,
        Commands::Status => commands::status(&root)?,
        Commands::Sync {
            url,
            remote_prefix,
            local_prefix,
            no_local_sync,
            retries,
        } => commands::sync(
            &root,
            &url,
            remote_prefix.as_deref(),
            local_prefix.as_deref(),
            no_local_sync,
            retries,
        )?,
    }
    Ok(())
}
