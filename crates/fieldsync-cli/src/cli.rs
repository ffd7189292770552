use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use fieldsync_core::models::SyncStatus;

#[derive(Parser)]
#[command(name = "fieldsync")]
#[command(about = "Inspect and sync the offline survey mutation queue")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Optional JSON sync configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show queued mutations with their sync status
    #[command(alias = "ls")]
    Queue {
        /// Only show mutations in these statuses (e.g. FAILED)
        #[arg(long, value_name = "STATUS")]
        status: Vec<SyncStatus>,
        /// Include completed mutations
        #[arg(long)]
        all: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one sync pass against the remote API
    Sync {
        /// Keep syncing in the background until interrupted
        #[arg(long)]
        watch: bool,
    },
    /// Return mutations stuck in flight after a crash to the queue
    Recover,
    /// Delete completed mutations older than the retention window
    Purge {
        /// Override the configured retention window
        #[arg(long, value_name = "HOURS")]
        older_than_hours: Option<u64>,
    },
    /// Re-queue a failed mutation
    Retry {
        /// Queue id of the failed mutation
        id: i64,
    },
    /// Drop a queued mutation and its media without syncing it
    Discard {
        /// Queue id of the mutation
        id: i64,
    },
    /// Manage surveys available offline
    Survey {
        #[command(subcommand)]
        command: SurveyCommands,
    },
    /// Print a completion script for fieldsync subcommands and flags
    #[command(
        long_about = "Print a completion script for fieldsync subcommands and flags, \
                      including the `survey` and queue maintenance commands. \
                      With --output the script is written to a file and the \
                      line that loads it is shown."
    )]
    Completions {
        /// Shell to generate the script for
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Write the script here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
}

#[derive(Subcommand)]
pub enum SurveyCommands {
    /// List surveys cached offline
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Download a survey if needed and make it the active survey
    Activate {
        /// Remote survey id
        id: String,
    },
    /// Clear the active survey
    Deactivate,
    /// Re-download a cached survey and its predefined sites
    Sync {
        /// Remote survey id
        id: String,
    },
    /// Delete a survey's offline copy; unsynced changes stay queued
    Remove {
        /// Remote survey id
        id: String,
    },
}
